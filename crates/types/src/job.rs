//! Sync job states, progress snapshots and outcomes.

use serde::{Deserialize, Serialize};

/// Direction of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Upload,
    Restore,
}

/// State of a sync job.
///
/// Upload: `Pending → Chunking → Uploading → Committing → Complete`.
/// Restore: `Pending → Fetching → Reassembling → Verifying → Complete`.
/// `Failed` is reachable from every non-initial, non-terminal state;
/// `Cancelled` from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Chunking,
    Uploading,
    Committing,
    Fetching,
    Reassembling,
    Verifying,
    Complete,
    Failed,
    Cancelled,
}

impl JobState {
    /// `Complete`, `Failed` and `Cancelled` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if a job of `kind` may move from `self` to `next`.
    pub fn can_transition(self, kind: JobKind, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (kind, self, next) {
            (_, _, Cancelled) => true,
            (_, Pending, Failed) => false,
            (_, _, Failed) => true,

            (JobKind::Upload, Pending, Chunking) => true,
            (JobKind::Upload, Chunking, Uploading) => true,
            (JobKind::Upload, Uploading, Committing) => true,
            (JobKind::Upload, Committing, Complete) => true,

            (JobKind::Restore, Pending, Fetching) => true,
            (JobKind::Restore, Fetching, Reassembling) => true,
            (JobKind::Restore, Reassembling, Verifying) => true,
            (JobKind::Restore, Verifying, Complete) => true,

            _ => false,
        }
    }
}

/// Error taxonomy reported with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retries were exhausted on a network blip or rate limit.
    Transient,
    /// Payload too large or credentials rejected; retrying cannot help.
    Configuration,
    /// Restored content did not match its digest.
    Integrity,
    /// Manifest has missing ordinals; the upload can be resumed.
    Incomplete,
    /// Local I/O or index failure.
    Local,
}

impl ErrorClass {
    /// Whether re-running the job may succeed without user intervention.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Transient | Self::Incomplete)
    }
}

/// Final result of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Complete { file_id: String },
    Failed { class: ErrorClass, reason: String },
    Cancelled,
}

impl JobOutcome {
    /// Terminal state matching this outcome.
    pub fn state(&self) -> JobState {
        match self {
            Self::Complete { .. } => JobState::Complete,
            Self::Failed { .. } => JobState::Failed,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}

/// Point-in-time progress of a job, as rendered by a UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: String,
    pub file_id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub total_chunks: u32,
    pub done_chunks: u32,
    /// Chunks satisfied from the digest cache or a previous attempt.
    pub skipped_chunks: u32,
    pub bytes_per_second: f64,
    /// Seconds left at the current rate, once a rate is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgress {
    /// Returns the job progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == JobState::Complete {
                100.0
            } else {
                0.0
            };
        }
        self.done_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}
