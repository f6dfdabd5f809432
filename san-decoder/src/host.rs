//! Host integration seams
//!
//! The player does not own a pixel surface, an audio device or an event
//! queue; the embedding host provides them through these traits. Headless
//! implementations are included for tools and tests.

use std::path::Path;
use std::time::Instant;

use crate::text::TextDraw;

/// Millisecond clock plus the pacing sleep.
pub trait Clock {
    fn millis(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}

/// Real-time clock backed by [`Instant`].
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// Output surface for decoded frames and palette updates.
pub trait DisplaySurface {
    /// Pushes a contiguous palette range; `colors` holds `count` RGB
    /// triples starting at palette index `first`.
    fn set_palette(&mut self, colors: &[u8], first: usize, count: usize);

    /// Copies a finished frame. `frame` is indexed color with row stride
    /// `pitch`; only the `width` x `height` rectangle is meaningful.
    fn copy_frame(&mut self, frame: &[u8], pitch: usize, width: usize, height: usize);
}

/// Logical streamed-audio buffer roles for the multiplexed protocol.
pub const STREAM_SPEECH: usize = 1;
pub const STREAM_MUSIC: usize = 2;
pub const STREAM_EFFECTS: usize = 3;

/// Audio output seam. Compressed bitstream decoding happens behind this
/// trait; the player only queues bytes and reads playback positions back
/// for frame pacing.
pub trait AudioSink {
    /// Queues decoded PCM from the interleaved audio protocol.
    fn queue_pcm(&mut self, rate: u32, stereo: bool, data: Vec<u8>);
    fn pcm_active(&self) -> bool;
    fn pcm_position_ms(&self) -> u64;

    /// Queues raw track bytes from a demuxed channel at the given sample
    /// rate.
    fn queue_track(&mut self, track_id: i32, rate: u32, volume: u8, pan: i8, data: Vec<u8>);

    /// Starts a logical stream for the multiplexed protocol. Returns false
    /// when the stream cannot be opened.
    fn start_stream(&mut self, buffer: usize, volume: i32) -> bool;
    fn feed_stream(&mut self, buffer: usize, data: &[u8], paused: bool);
    fn stream_active(&self, buffer: usize) -> bool;

    /// Tries to play an external compressed rendition of the animation's
    /// audio (the player then syncs to its position instead of demuxing).
    fn play_companion_track(&mut self, path: &Path) -> bool;
    fn track_active(&self) -> bool;
    fn track_position_ms(&self) -> u64;

    fn stop_all(&mut self);
}

/// Text rendering seam; receives resolved draw instructions.
pub trait GlyphRenderer {
    fn draw(&mut self, frame: &mut [u8], pitch: usize, draw: &TextDraw);
}

/// Cooperative cancellation: polled once per loop iteration.
pub trait EventSource {
    fn should_quit(&mut self) -> bool;
}

/// Discards all audio; positions stay at zero so the player paces against
/// the wall clock.
#[derive(Default)]
pub struct NullAudio;

impl AudioSink for NullAudio {
    fn queue_pcm(&mut self, _rate: u32, _stereo: bool, _data: Vec<u8>) {}

    fn pcm_active(&self) -> bool {
        false
    }

    fn pcm_position_ms(&self) -> u64 {
        0
    }

    fn queue_track(&mut self, _track_id: i32, _rate: u32, _volume: u8, _pan: i8, _data: Vec<u8>) {}

    fn start_stream(&mut self, _buffer: usize, _volume: i32) -> bool {
        true
    }

    fn feed_stream(&mut self, _buffer: usize, _data: &[u8], _paused: bool) {}

    fn stream_active(&self, _buffer: usize) -> bool {
        false
    }

    fn play_companion_track(&mut self, _path: &Path) -> bool {
        false
    }

    fn track_active(&self) -> bool {
        false
    }

    fn track_position_ms(&self) -> u64 {
        0
    }

    fn stop_all(&mut self) {}
}

/// Drops draw instructions.
#[derive(Default)]
pub struct NullGlyphs;

impl GlyphRenderer for NullGlyphs {
    fn draw(&mut self, _frame: &mut [u8], _pitch: usize, _draw: &TextDraw) {}
}

/// Never quits.
#[derive(Default)]
pub struct NullEvents;

impl EventSource for NullEvents {
    fn should_quit(&mut self) -> bool {
        false
    }
}
