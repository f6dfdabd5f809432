//! SAN Decoder Library
//!
//! This library plays back SAN animations: it decodes frame objects through
//! the stateful codec bank, manages the palette and its fade deltas,
//! demultiplexes the interleaved audio sub-streams and paces frames against
//! a clock or an active audio channel.

pub mod audio;
pub mod codec;
pub mod host;
pub mod palette;
pub mod player;
pub mod text;

pub use codec::CodecBank;
pub use palette::Palette;
pub use player::{Playback, Player, PlayerState};

/// Result type for san-decoder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for san-decoder operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SAN core error: {0}")]
    Core(#[from] san_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported codec id: {0}")]
    UnsupportedCodec(u16),

    #[error("Corrupt frame object data for codec {0}")]
    CorruptFrame(u16),

    #[error("Zlib frame object failed to decompress")]
    ZlibFrame,

    #[error("Sub-chunk payload too small")]
    TruncatedSubChunk,

    #[error("Invalid escape code '^{0}' in text string")]
    BadTextEscape(char),

    #[error("Invalid audio stream user id: {0}")]
    BadStreamUserId(u16),

    #[error("Interleaved audio block without stream magic")]
    MissingStreamMagic,

    #[error("Audio stream rejected buffer {0}")]
    StreamRefused(usize),
}
