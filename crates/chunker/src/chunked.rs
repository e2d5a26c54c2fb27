use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};
use televault_types::{ChunkRef, Digest};

use crate::ChunkError;

// ---------------------------------------------------------------------------
// Digest helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data`.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_bytes(hasher.finalize().into())
}

/// Computes SHA-256 of an entire file.
pub fn digest_file(path: &Path) -> Result<Digest, ChunkError> {
    let mut file = File::open(path)?;
    let mut digest = StreamDigest::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

/// Incremental SHA-256 over a byte stream.
#[derive(Clone, Default)]
pub struct StreamDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> Digest {
        Digest::from_bytes(self.hasher.finalize().into())
    }
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// One fixed-size slice of a source stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based position within the stream.
    pub ordinal: u32,
    /// Byte offset of the first payload byte.
    pub offset: u64,
    pub data: Vec<u8>,
    /// SHA-256 of `data`.
    pub digest: Digest,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The index-facing reference for this chunk.
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            ordinal: self.ordinal,
            length: self.data.len() as u64,
            digest: self.digest,
        }
    }
}

/// Splits a byte stream into `chunk_size` blocks.
///
/// Every chunk but the last is exactly `chunk_size` bytes. The whole-stream
/// digest becomes available from [`file_digest`](Self::file_digest) once the
/// source is exhausted. After a read error the chunker yields nothing more;
/// restart by constructing a new one over a fresh reader.
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    ordinal: u32,
    offset: u64,
    stream: Option<StreamDigest>,
    file_digest: Option<Digest>,
    failed: bool,
}

impl Chunker<File> {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, ChunkError> {
        let file = File::open(path)?;
        Self::new(file, chunk_size)
    }
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            reader,
            chunk_size,
            ordinal: 0,
            offset: 0,
            stream: Some(StreamDigest::new()),
            file_digest: None,
            failed: false,
        })
    }

    /// Reads the next chunk. Returns `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        if self.failed || self.file_digest.is_some() {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    self.failed = true;
                    return Err(ChunkError::Read {
                        offset: self.offset + filled as u64,
                        source,
                    });
                }
            }
        }

        if filled == 0 {
            let stream = self.stream.take().unwrap_or_default();
            self.file_digest = Some(stream.finalize());
            return Ok(None);
        }
        buf.truncate(filled);

        if let Some(stream) = self.stream.as_mut() {
            stream.update(&buf);
        }
        let chunk = Chunk {
            ordinal: self.ordinal,
            offset: self.offset,
            digest: digest_bytes(&buf),
            data: buf,
        };
        self.offset += filled as u64;
        self.ordinal = self
            .ordinal
            .checked_add(1)
            .ok_or(ChunkError::TooManyChunks(self.chunk_size))?;
        Ok(Some(chunk))
    }

    /// Whole-stream digest, available once the stream has been exhausted.
    pub fn file_digest(&self) -> Option<Digest> {
        self.file_digest
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
