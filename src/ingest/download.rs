//! Remote video download.
//!
//! HTTP(S) sources are fetched whole into a temporary file before decoding so
//! the decoder can seek freely. The file is removed when the returned handle
//! is dropped.

use std::io;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::error::PipelineError;

pub fn download_to_tempfile(url: &str, io_timeout: Duration) -> Result<NamedTempFile, PipelineError> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(io_timeout)
        .timeout_read(io_timeout)
        .build();
    let response = agent
        .get(url)
        .call()
        .map_err(|e| PipelineError::connection(url, e))?;

    let mut file = tempfile::Builder::new()
        .prefix("facestream-")
        .suffix(&format!(".{}", extension_of(url)))
        .tempfile()
        .map_err(|e| PipelineError::connection(url, format!("create temp file: {}", e)))?;

    let written = io::copy(&mut response.into_reader(), file.as_file_mut())
        .map_err(|e| PipelineError::connection(url, format!("download interrupted: {}", e)))?;
    if written == 0 {
        return Err(PipelineError::connection(url, "empty response body"));
    }
    log::info!(
        "downloaded {} ({} bytes) to {}",
        url,
        written,
        file.path().display()
    );
    Ok(file)
}

fn extension_of(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && !ext.contains('/'))
        .unwrap_or("bin")
}
