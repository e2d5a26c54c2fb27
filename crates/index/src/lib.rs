//! Index store: file manifests plus the digest → locator cache.
//!
//! The index is the only owner of manifest and cache persistence. Every
//! operation is atomic: a chunk commit updates the file's chunk list and the
//! digest cache together, or leaves both untouched.

mod json;

pub use json::JsonIndexStore;

use televault_types::{ChunkRef, Digest, FileManifest, RemoteLocator};

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("file already indexed: {0}")]
    DuplicateFile(String),

    #[error("invalid manifest for {file_id}: {reason}")]
    InvalidManifest { file_id: String, reason: String },

    #[error("invalid chunk {ordinal} for {file_id}: {reason}")]
    InvalidChunk {
        file_id: String,
        ordinal: u32,
        reason: String,
    },

    /// A different digest is already committed at this ordinal.
    #[error("chunk {ordinal} of {file_id} already committed with digest {existing}")]
    ChunkConflict {
        file_id: String,
        ordinal: u32,
        existing: Digest,
    },

    #[error("manifest {file_id} is missing {} chunk(s)", missing.len())]
    IncompleteManifest { file_id: String, missing: Vec<u32> },

    #[error("manifest {0} is already complete")]
    Sealed(String),
}

/// Atomic manifest and digest-cache operations.
///
/// Implementations must serialize concurrent commits and allow reads of one
/// file while another is being committed.
pub trait IndexStore: Send + Sync {
    /// Registers a manifest skeleton (no chunks, not complete).
    fn begin_file(&self, manifest: FileManifest) -> Result<(), IndexError>;

    /// Locator of a previously uploaded chunk with this digest.
    fn lookup_digest(&self, digest: &Digest) -> Result<Option<RemoteLocator>, IndexError>;

    /// Records `chunk` for `file_id` and caches its locator.
    ///
    /// Re-committing the same digest at the same ordinal is a no-op.
    fn commit_chunk(
        &self,
        file_id: &str,
        chunk: ChunkRef,
        locator: RemoteLocator,
    ) -> Result<(), IndexError>;

    /// Seals a manifest whose ordinals are all committed.
    fn complete_file(&self, file_id: &str, file_digest: Digest)
    -> Result<FileManifest, IndexError>;

    fn read_manifest(&self, file_id: &str) -> Result<FileManifest, IndexError>;

    /// Committed chunks of a file in ordinal order, each with its locator.
    fn chunk_locators(&self, file_id: &str)
    -> Result<Vec<(ChunkRef, RemoteLocator)>, IndexError>;

    /// All manifests, oldest first.
    fn list_files(&self) -> Result<Vec<FileManifest>, IndexError>;

    /// Manifests that are not yet complete.
    fn incomplete_files(&self) -> Result<Vec<FileManifest>, IndexError> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter(|m| !m.is_complete())
            .collect())
    }

    /// Drops a manifest. Returns the locators no remaining manifest
    /// references; their cache entries are dropped in the same operation.
    fn remove_file(&self, file_id: &str) -> Result<Vec<RemoteLocator>, IndexError>;
}
