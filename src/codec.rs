//! Length-prefixed binary framing for queue payloads.
//!
//! Layout:
//!
//! ```text
//! +----------------+-------------------------+---------------------------+
//! | L: u32 (BE)    | L bytes of UTF-8 JSON   | payload (rest of buffer)  |
//! +----------------+-------------------------+---------------------------+
//! ```
//!
//! The payload carries no length of its own; it is everything after the
//! metadata block. Frame and face records use this framing. Recognition
//! results are plain JSON and never go through here.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PipelineError;

const LEN_PREFIX: usize = 4;

/// Encode `metadata` as JSON and prepend its length, then append `payload`.
pub fn encode<M: Serialize + ?Sized>(metadata: &M, payload: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let meta = serde_json::to_vec(metadata)
        .map_err(|e| PipelineError::malformed(format!("metadata not serializable: {}", e)))?;
    let meta_len = u32::try_from(meta.len())
        .map_err(|_| PipelineError::malformed("metadata block exceeds u32 length"))?;

    let mut out = Vec::with_capacity(LEN_PREFIX + meta.len() + payload.len());
    out.extend_from_slice(&meta_len.to_be_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a framed buffer into its decoded metadata and the borrowed payload.
pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<(M, &[u8]), PipelineError> {
    let (meta_bytes, payload) = split(bytes)?;
    let metadata = serde_json::from_slice(meta_bytes)
        .map_err(|e| PipelineError::malformed(format!("metadata is not valid JSON: {}", e)))?;
    Ok((metadata, payload))
}

fn split(bytes: &[u8]) -> Result<(&[u8], &[u8]), PipelineError> {
    let Some(prefix) = bytes.get(..LEN_PREFIX) else {
        return Err(PipelineError::malformed(format!(
            "buffer of {} bytes is shorter than the length prefix",
            bytes.len()
        )));
    };
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(prefix);
    let meta_len = u32::from_be_bytes(len_bytes) as usize;

    let rest = &bytes[LEN_PREFIX..];
    if meta_len > rest.len() {
        return Err(PipelineError::malformed(format!(
            "declared metadata length {} exceeds remaining {} bytes",
            meta_len,
            rest.len()
        )));
    }
    Ok(rest.split_at(meta_len))
}
