//! SAN Core Library
//!
//! This library provides the chunked container parser and companion string
//! resources for the SAN animation format.

pub mod chunk;
pub mod strings;

pub use chunk::{ChunkReader, Tag};
pub use strings::StringResource;

/// Result type for san-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for san-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a SAN animation, expected 'ANIM' chunk")]
    NotAnimation,

    #[error("Unknown chunk '{tag}' at offset {offset:#x}")]
    UnknownChunk { tag: Tag, offset: u64 },

    #[error("Chunk '{tag}' has wrong size {size}")]
    WrongChunkSize { tag: Tag, size: u32 },

    #[error("Chunk '{tag}' runs past end of stream at offset {offset:#x}")]
    ChunkOutOfBounds { tag: Tag, offset: u64 },
}
