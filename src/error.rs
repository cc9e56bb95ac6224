//! Pipeline error taxonomy.
//!
//! Every fallible operation that crosses a stage boundary reports one of these
//! variants. Callers branch on the variant:
//! - `Connection` is retried with backoff by the source reader.
//! - `EndOfStream` ends a finite source and restarts a live one.
//! - `MalformedFrame` and `Capability` drop the in-flight item.
//! - `Sink` is logged and ignored.
//! - `Startup`, `InvalidSource` and `UnknownSource` are reported to the operator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A queue payload could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The source could not be opened or stopped producing frames.
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// The capture reached the end of its media.
    #[error("end of stream")]
    EndOfStream,

    /// An external capability (detection, feature extraction, identity lookup) failed.
    #[error("{capability} failed: {cause:#}")]
    Capability {
        capability: &'static str,
        cause: anyhow::Error,
    },

    /// Persisting a result failed.
    #[error("result sink failed: {0:#}")]
    Sink(anyhow::Error),

    /// A component could not be initialised.
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("invalid source url '{0}'")]
    InvalidSource(String),

    #[error("unknown source '{0}'")]
    UnknownSource(String),
}

impl PipelineError {
    pub fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn capability(capability: &'static str, cause: anyhow::Error) -> Self {
        Self::Capability { capability, cause }
    }

    pub fn malformed(reason: impl ToString) -> Self {
        Self::MalformedFrame(reason.to_string())
    }

    /// True when retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
