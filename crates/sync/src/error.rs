//! Sync error types.

use televault_chunker::ChunkError;
use televault_index::IndexError;
use televault_transport::{ErrorKind, TransportError};
use televault_types::ErrorClass;

/// Errors produced by the sync pipelines and the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// A transport call failed after retries (or fatally).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("integrity check failed for {file_id}: {detail}")]
    Integrity { file_id: String, detail: String },

    #[error("file {file_id} is incomplete ({missing} chunk(s) missing)")]
    Incomplete { file_id: String, missing: usize },

    /// The source no longer matches what was already committed.
    #[error("source of {file_id} changed: {reason}")]
    SourceChanged { file_id: String, reason: String },

    #[error("no source path recorded for {0}")]
    NoSource(String),

    /// The stored name cannot be used as a restore target.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a job is already running for {0}")]
    JobAlreadyActive(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Maps the error onto the reported failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(e) => match e.kind() {
                ErrorKind::Transient => ErrorClass::Transient,
                ErrorKind::PayloadTooLarge | ErrorKind::Unauthorized => {
                    ErrorClass::Configuration
                }
                // The remote lost a chunk the manifest points at.
                ErrorKind::NotFound => ErrorClass::Integrity,
            },
            Self::Index(IndexError::IncompleteManifest { .. }) | Self::Incomplete { .. } => {
                ErrorClass::Incomplete
            }
            Self::Integrity { .. } => ErrorClass::Integrity,
            Self::InvalidConfig(_) => ErrorClass::Configuration,
            Self::Io(_)
            | Self::Chunk(_)
            | Self::Index(_)
            | Self::SourceChanged { .. }
            | Self::NoSource(_)
            | Self::InvalidName(_)
            | Self::JobAlreadyActive(_)
            | Self::UnknownJob(_)
            | Self::Task(_)
            | Self::Cancelled => ErrorClass::Local,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
