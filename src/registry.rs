//! Registry of started sources and their status.
//!
//! All access goes through atomic operations on the registry; the map itself
//! is never handed out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Starting or running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceInfo {
    pub source_id: String,
    pub url: String,
    pub debug_mode: bool,
    pub status: SourceStatus,
    pub error: Option<String>,
    pub started_at: f64,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    next_seq: AtomicU64,
    sources: Mutex<HashMap<String, SourceInfo>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SourceInfo>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a source in `starting` state and return its id (`stream_N`).
    pub fn register(&self, url: &str, debug_mode: bool) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let source_id = format!("stream_{}", seq);
        let info = SourceInfo {
            source_id: source_id.clone(),
            url: url.to_string(),
            debug_mode,
            status: SourceStatus::Starting,
            error: None,
            started_at: crate::now_s(),
            seq,
        };
        self.lock().insert(source_id.clone(), info);
        source_id
    }

    pub fn update_status(&self, source_id: &str, status: SourceStatus) -> Result<(), PipelineError> {
        let mut sources = self.lock();
        let info = sources
            .get_mut(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))?;
        info.status = status;
        Ok(())
    }

    /// `starting` -> `running`. A source already asked to stop keeps its status.
    pub fn mark_running(&self, source_id: &str) -> Result<bool, PipelineError> {
        self.transition(source_id, &[SourceStatus::Starting], SourceStatus::Running)
    }

    /// `starting`/`running` -> `stopping`. Returns false when the source had
    /// already stopped or failed.
    pub fn begin_stop(&self, source_id: &str) -> Result<bool, PipelineError> {
        self.transition(
            source_id,
            &[SourceStatus::Starting, SourceStatus::Running],
            SourceStatus::Stopping,
        )
    }

    fn transition(
        &self,
        source_id: &str,
        from: &[SourceStatus],
        to: SourceStatus,
    ) -> Result<bool, PipelineError> {
        let mut sources = self.lock();
        let info = sources
            .get_mut(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))?;
        if from.contains(&info.status) {
            info.status = to;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark a source as failed with a reason.
    pub fn set_error(&self, source_id: &str, reason: impl Into<String>) -> Result<(), PipelineError> {
        let mut sources = self.lock();
        let info = sources
            .get_mut(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))?;
        info.status = SourceStatus::Error;
        info.error = Some(reason.into());
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<SourceInfo> {
        self.lock().get(source_id).cloned()
    }

    pub fn status(&self, source_id: &str) -> Option<SourceStatus> {
        self.lock().get(source_id).map(|info| info.status)
    }

    /// Every registered source in registration order.
    pub fn list(&self) -> Vec<SourceInfo> {
        let mut all: Vec<SourceInfo> = self.lock().values().cloned().collect();
        all.sort_by_key(|info| info.seq);
        all
    }

    pub fn list_active(&self) -> Vec<SourceInfo> {
        let mut active = self.list();
        active.retain(|info| info.status.is_active());
        active
    }
}
