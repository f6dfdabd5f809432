//! SAN chunk stream parsing
//!
//! A SAN file is a sequence of big-endian `(4-byte tag, 4-byte length)`
//! chunks. The length excludes the 8-byte chunk header; a chunk with an odd
//! length is followed by one padding byte that is not counted anywhere else.

use crate::{Error, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

/// Four-character chunk tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Tag(*bytes)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

/// Top-level container tag
pub const ANIM: Tag = Tag::new(b"ANIM");
/// Animation header: version, frame count, initial palette
pub const AHDR: Tag = Tag::new(b"AHDR");
/// One frame of sub-chunks
pub const FRME: Tag = Tag::new(b"FRME");
/// Full 256-entry palette
pub const NPAL: Tag = Tag::new(b"NPAL");
/// Frame object (codec id + pixel data)
pub const FOBJ: Tag = Tag::new(b"FOBJ");
/// Zlib-compressed frame object
pub const ZFOB: Tag = Tag::new(b"ZFOB");
/// Delta palette: install or apply a fade table
pub const XPAL: Tag = Tag::new(b"XPAL");
/// Chunked audio track frame
pub const PSAD: Tag = Tag::new(b"PSAD");
/// Interleaved compressed audio
pub const IACT: Tag = Tag::new(b"IACT");
/// Text by string id
pub const TRES: Tag = Tag::new(b"TRES");
/// Inline text
pub const TEXT: Tag = Tag::new(b"TEXT");
/// Store the current frame buffer
pub const STOR: Tag = Tag::new(b"STOR");
/// Fetch the stored frame buffer
pub const FTCH: Tag = Tag::new(b"FTCH");
/// Skip marker for the next frame object
pub const SKIP: Tag = Tag::new(b"SKIP");
/// Obfuscated string resource header
pub const ETRS: Tag = Tag::new(b"ETRS");

/// Length of a chunk including its 8-byte header and the trailing pad byte
/// for odd sizes.
pub fn padded_size(size: u32) -> u32 {
    size + 8 + (size & 1)
}

/// Sequential bounds-checked reader over a chunked byte stream.
///
/// The reader tracks the total stream size; every primitive read that would
/// cross the end of the stream fails instead of returning short data.
pub struct ChunkReader<R> {
    inner: R,
    len: u64,
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len })
    }

    /// Total stream size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pos(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }

    /// True while the read position is inside the stream.
    pub fn within_bounds(&mut self) -> Result<bool> {
        Ok(self.pos()? < self.len)
    }

    /// Reads the next chunk header: big-endian tag and payload length.
    pub fn read_tag(&mut self) -> Result<(Tag, u32)> {
        let mut tag = [0u8; 4];
        self.inner.read_exact(&mut tag)?;
        let size = self.inner.read_u32::<BigEndian>()?;
        Ok((Tag(tag), size))
    }

    /// Reads an entire chunk payload of `size` bytes, failing if the chunk
    /// would run past the end of the stream.
    pub fn read_payload(&mut self, tag: Tag, size: u32) -> Result<Vec<u8>> {
        let offset = self.pos()?;
        if offset + u64::from(size) > self.len {
            return Err(Error::ChunkOutOfBounds { tag, offset });
        }
        let mut payload = vec![0u8; size as usize];
        self.inner.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Seeks to the end of a chunk whose payload starts at `offset`,
    /// skipping the pad byte for odd sizes.
    pub fn seek_past(&mut self, offset: u64, size: u32) -> Result<()> {
        let mut end = offset + u64::from(size);
        if size & 1 == 1 {
            end += 1;
        }
        self.seek(end)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8()?)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.inner.read_i8()?)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(self.inner.read_u16::<LittleEndian>()?)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(self.inner.read_u16::<BigEndian>()?)
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        Ok(self.inner.read_i16::<LittleEndian>()?)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32::<LittleEndian>()?)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32::<BigEndian>()?)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(tag);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        if payload.len() & 1 == 1 {
            out.push(0);
        }
        out
    }

    #[test]
    fn test_read_tag_and_payload() {
        let data = chunk(b"FRME", &[1, 2, 3, 4]);
        let mut reader = ChunkReader::new(Cursor::new(data)).unwrap();

        let (tag, size) = reader.read_tag().unwrap();
        assert_eq!(tag, FRME);
        assert_eq!(size, 4);
        let payload = reader.read_payload(tag, size).unwrap();
        assert_eq!(payload, vec![1, 2, 3, 4]);
        assert!(!reader.within_bounds().unwrap());
    }

    #[test]
    fn test_odd_size_padding_accounting() {
        // Two sub-chunks, the first with an odd payload; the padded sizes
        // must add up to the container length exactly.
        let mut body = chunk(b"STOR", &[0, 0, 0]);
        body.extend_from_slice(&chunk(b"FTCH", &[0, 0, 0, 0, 0, 0]));

        let sizes = [3u32, 6u32];
        let accounted: u32 = sizes.iter().map(|&s| padded_size(s)).sum();
        assert_eq!(accounted as usize, body.len());

        let mut reader = ChunkReader::new(Cursor::new(body)).unwrap();
        let (tag, size) = reader.read_tag().unwrap();
        assert_eq!((tag, size), (STOR, 3));
        let offset = reader.pos().unwrap();
        reader.seek_past(offset, size).unwrap();

        // The pad byte was skipped, so the next header parses cleanly.
        let (tag, size) = reader.read_tag().unwrap();
        assert_eq!((tag, size), (FTCH, 6));
    }

    #[test]
    fn test_payload_out_of_bounds() {
        let mut data = Vec::new();
        data.extend_from_slice(b"FOBJ");
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[0; 10]);

        let mut reader = ChunkReader::new(Cursor::new(data)).unwrap();
        let (tag, size) = reader.read_tag().unwrap();
        assert!(matches!(
            reader.read_payload(tag, size),
            Err(Error::ChunkOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(AHDR.to_string(), "AHDR");
        assert_eq!(Tag::new(&[b'A', 0x01, b'Z', b' ']).to_string(), "A\\x01Z ");
    }
}
