//! Palette state and delta fades
//!
//! The player keeps one 256-entry RGB palette plus a parallel table of
//! signed per-channel deltas used for slow fades. Changed entries are
//! tracked as a dirty index range that must be flushed to the display
//! before the frame buffer is copied out.

use byteorder::{ByteOrder, LittleEndian};
use san_core::chunk::XPAL;
use san_core::Error as CoreError;

use crate::Result;

/// Bytes in a full palette: 256 RGB triples.
pub const PALETTE_SIZE: usize = 0x300;

/// XPAL payload size that installs a new delta table and palette.
const XPAL_INSTALL_SIZE: u32 = (PALETTE_SIZE * 3 + 4) as u32;
/// XPAL payload size that applies the stored delta in place.
const XPAL_APPLY_SIZE: u32 = 6;

/// Exact fade step: the channel is scaled by 129/128 (rounded, integer
/// division) before the signed delta is added. The arithmetic is
/// load-bearing for bit-for-bit palette compatibility with reference
/// captures.
fn delta_color(org: u8, delta: i16) -> u8 {
    ((org as i32 * 129 + 64) / 128 + delta as i32).clamp(0, 255) as u8
}

pub struct Palette {
    colors: [u8; PALETTE_SIZE],
    delta: [i16; PALETTE_SIZE],
    dirty_min: i32,
    dirty_max: i32,
}

impl Default for Palette {
    fn default() -> Self {
        Self::new()
    }
}

impl Palette {
    pub fn new() -> Self {
        Self {
            colors: [0; PALETTE_SIZE],
            delta: [0; PALETTE_SIZE],
            dirty_min: 256,
            dirty_max: -1,
        }
    }

    /// Raw RGB triples, index 0 first.
    pub fn colors(&self) -> &[u8; PALETTE_SIZE] {
        &self.colors
    }

    /// Installs a full palette and dirties every entry.
    pub fn set_full(&mut self, bytes: &[u8]) {
        self.colors.copy_from_slice(&bytes[..PALETTE_SIZE]);
        self.mark_dirty(0, 255);
    }

    pub fn set_entry(&mut self, n: usize, r: u8, g: u8, b: u8) {
        self.colors[n * 3] = r;
        self.colors[n * 3 + 1] = g;
        self.colors[n * 3 + 2] = b;
        self.mark_dirty(n as i32, n as i32);
    }

    /// Widens the dirty palette index range.
    pub fn mark_dirty(&mut self, min: i32, max: i32) {
        if self.dirty_min > min {
            self.dirty_min = min;
        }
        if self.dirty_max < max {
            self.dirty_max = max;
        }
    }

    /// Returns and clears the pending dirty index range, if any.
    pub fn take_dirty(&mut self) -> Option<(usize, usize)> {
        if self.dirty_max < self.dirty_min {
            return None;
        }
        let range = (self.dirty_min as usize, self.dirty_max as usize);
        self.dirty_min = 256;
        self.dirty_max = -1;
        Some(range)
    }

    /// Applies the stored delta table to every channel byte.
    pub fn apply_delta(&mut self) {
        for i in 0..PALETTE_SIZE {
            self.colors[i] = delta_color(self.colors[i], self.delta[i]);
        }
        self.mark_dirty(0, 255);
    }

    /// Handles an XPAL chunk payload. The large variant installs a delta
    /// table plus a full palette for the following fade sequence; the small
    /// variant applies the stored delta once. Any other size is fatal.
    pub fn handle_delta_chunk(&mut self, payload: &[u8]) -> Result<()> {
        match payload.len() as u32 {
            XPAL_INSTALL_SIZE => {
                let mut off = 4;
                for i in 0..PALETTE_SIZE {
                    self.delta[i] = LittleEndian::read_i16(&payload[off..]);
                    off += 2;
                }
                self.set_full(&payload[off..off + PALETTE_SIZE]);
                Ok(())
            }
            XPAL_APPLY_SIZE => {
                self.apply_delta();
                Ok(())
            }
            size => Err(CoreError::WrongChunkSize { tag: XPAL, size }.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_formula_exact() {
        // Reference capture fixture: old=100, delta=128 must give exactly
        // clamp(round(100 * 129 / 128) + 128, 0, 255) = 229.
        assert_eq!(delta_color(100, 128), 229);
        assert_eq!(delta_color(0, -5), 0);
        assert_eq!(delta_color(255, 300), 255);
        assert_eq!(delta_color(128, 0), 129);
    }

    #[test]
    fn test_dirty_range_widens_and_clears() {
        let mut pal = Palette::new();
        assert!(pal.take_dirty().is_none());

        pal.set_entry(10, 1, 2, 3);
        pal.set_entry(200, 4, 5, 6);
        assert_eq!(pal.take_dirty(), Some((10, 200)));
        assert!(pal.take_dirty().is_none());
    }

    #[test]
    fn test_install_then_apply() {
        let mut pal = Palette::new();

        // Install: 4 pad bytes, 768 LE delta words, then a full palette.
        let mut payload = vec![0u8; 4];
        for _ in 0..PALETTE_SIZE {
            payload.extend_from_slice(&64i16.to_le_bytes());
        }
        payload.extend(std::iter::repeat(100u8).take(PALETTE_SIZE));
        pal.handle_delta_chunk(&payload).unwrap();
        assert_eq!(pal.colors()[0], 100);
        assert_eq!(pal.take_dirty(), Some((0, 255)));

        // Apply: round(100 * 129 / 128) + 64 = 165.
        pal.handle_delta_chunk(&[0u8; 6]).unwrap();
        assert_eq!(pal.colors()[0], 165);
        assert_eq!(pal.take_dirty(), Some((0, 255)));
    }

    #[test]
    fn test_wrong_size_is_fatal() {
        let mut pal = Palette::new();
        assert!(pal.handle_delta_chunk(&[0u8; 100]).is_err());
    }
}
