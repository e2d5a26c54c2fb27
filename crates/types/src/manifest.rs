//! File manifests, chunk references and remote locators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Reference to one chunk of a file.
///
/// Immutable once committed. Several manifests may hold chunk refs with the
/// same digest; they all resolve to the same [`RemoteLocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Zero-based position within the file.
    pub ordinal: u32,
    /// Payload length in bytes.
    pub length: u64,
    /// SHA-256 of the payload.
    pub digest: Digest,
}

/// Where a chunk payload lives on the remote platform.
///
/// `address` is opaque to everything but the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteLocator {
    pub digest: Digest,
    pub address: String,
}

impl RemoteLocator {
    pub fn new(digest: Digest, address: impl Into<String>) -> Self {
        Self {
            digest,
            address: address.into(),
        }
    }
}

/// The ordered chunk list (plus whole-file digest) that reconstructs a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    /// Locally assigned identifier.
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Chunk size the file was split with.
    pub chunk_size: u64,
    /// Number of chunks the file is expected to have.
    pub chunk_count: u32,
    /// Committed chunks, sorted by ordinal.
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    /// Whole-file digest, known once the file has been completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_digest: Option<Digest>,
    /// Local path the file was uploaded from, used to resume uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileManifest {
    /// Builds a manifest skeleton with no committed chunks.
    ///
    /// Returns `None` if `chunk_size` is zero or the chunk count would not fit
    /// in a `u32`.
    pub fn skeleton(
        id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        chunk_size: u64,
        source_path: Option<String>,
    ) -> Option<Self> {
        let chunk_count = expected_chunk_count(size, chunk_size)?;
        Some(Self {
            id: id.into(),
            name: name.into(),
            size,
            created_at: Utc::now(),
            chunk_size,
            chunk_count,
            chunks: Vec::new(),
            file_digest: None,
            source_path,
            completed_at: None,
        })
    }

    /// Returns `true` once the index has sealed the manifest.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some() && self.file_digest.is_some()
    }

    /// Ordinals in `0..chunk_count` that have no committed chunk.
    pub fn missing_ordinals(&self) -> Vec<u32> {
        let mut have = self.chunks.iter().map(|c| c.ordinal).peekable();
        let mut missing = Vec::new();
        for ordinal in 0..self.chunk_count {
            // chunks is sorted, so walk both sequences together.
            while have.next_if(|&o| o < ordinal).is_some() {}
            if have.next_if_eq(&ordinal).is_none() {
                missing.push(ordinal);
            }
        }
        missing
    }

    /// Committed chunk at `ordinal`, if any.
    pub fn chunk(&self, ordinal: u32) -> Option<&ChunkRef> {
        self.chunks
            .binary_search_by_key(&ordinal, |c| c.ordinal)
            .ok()
            .map(|i| &self.chunks[i])
    }

    /// Sum of committed chunk lengths.
    pub fn committed_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }
}

/// Number of chunks a file of `size` bytes splits into: `ceil(size / chunk_size)`.
///
/// An empty file has zero chunks.
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(size.div_ceil(chunk_size)).ok()
}
