//! Fixed-size content chunking with SHA-256 digests.
//!
//! A [`Chunker`] walks any [`std::io::Read`] source and yields ordinal,
//! payload and digest triples, while hashing the whole stream on the side.

mod chunked;

pub use chunked::{Chunk, Chunker, StreamDigest, digest_bytes, digest_file};

/// Default chunk size: 1 MiB.
///
/// Small enough to stay well under every Bot API payload ceiling, large
/// enough that per-message overhead does not dominate.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors produced by the chunker crate.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source failed mid-read. Chunks yielded before `offset` stay valid.
    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("too many chunks for chunk size {0}")]
    TooManyChunks(usize),
}
