//! Pipeline tuning.

use serde::{Deserialize, Serialize};
use televault_chunker::DEFAULT_CHUNK_SIZE;

use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// Default number of concurrent transport calls.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Settings shared by every job a coordinator runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bytes per chunk. Must not exceed the transport's payload limit.
    pub chunk_size: usize,
    /// Transport calls in flight across all jobs.
    pub concurrency: usize,
    /// Chunks buffered between the reader and the uploaders. Defaults to
    /// `concurrency`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            queue_depth: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.concurrency).max(1)
    }

    /// Checks the settings against a transport's payload ceiling.
    pub fn validate(&self, max_payload: usize) -> Result<(), SyncError> {
        if self.chunk_size == 0 {
            return Err(SyncError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.chunk_size > max_payload {
            return Err(SyncError::InvalidConfig(format!(
                "chunk_size {} exceeds transport payload limit {max_payload}",
                self.chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(SyncError::InvalidConfig("concurrency must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be positive".into(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry.backoff_factor must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}
