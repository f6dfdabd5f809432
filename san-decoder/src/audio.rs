//! Audio demuxing
//!
//! Two audio sub-protocols ride inside frame chunks. Sound frames carry
//! per-track chunked sample buffers reassembled by sequence index into
//! channel objects. Interleaved audio chunks carry either 2-byte-grouped
//! transform blocks decoded in place, or a multiplexed stream protocol that
//! maps a numeric user id to a logical buffer role and volume.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::host::{AudioSink, STREAM_EFFECTS, STREAM_MUSIC, STREAM_SPEECH};
use crate::{Error, Result};

/// Track sample rate for demuxed channels.
pub const TRACK_RATE: u32 = 22050;

/// Nominal bytes per declared track frame, used for capacity tracking.
const TRACK_FRAME_SIZE: usize = 4096;

/// One logical audio sub-stream keyed by track id.
pub struct Channel {
    track_id: i32,
    /// Last accepted sequence index.
    index: i32,
    frame_count: i32,
    flags: i32,
    volume: u8,
    pan: i8,
    pending: Vec<u8>,
    queued_bytes: usize,
}

impl Channel {
    fn new(track_id: i32) -> Self {
        Self {
            track_id,
            index: 0,
            frame_count: 0,
            flags: 0,
            volume: 127,
            pan: 0,
            pending: Vec::new(),
            queued_bytes: 0,
        }
    }

    pub fn track_id(&self) -> i32 {
        self.track_id
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn pan(&self) -> i8 {
        self.pan
    }

    /// First delivery (or the post-seek override) fixes the channel
    /// parameters and accepts any starting index.
    fn set_parameters(&mut self, frame_count: i32, flags: i32, volume: u8, pan: i8, index: i32) {
        self.frame_count = frame_count;
        self.flags = flags;
        self.volume = volume;
        self.pan = pan;
        self.index = index;
    }

    /// Later deliveries must carry exactly the next sequence index.
    fn check_parameters(&mut self, index: i32, frame_count: i32, volume: u8, pan: i8) -> bool {
        if index != self.index + 1 {
            warn!(
                track = self.track_id,
                got = index,
                expected = self.index + 1,
                "out of order track delivery, dropping"
            );
            return false;
        }
        self.index = index;
        self.frame_count = frame_count;
        self.volume = volume;
        self.pan = pan;
        true
    }

    /// Appends sample bytes, clamped to the declared capacity.
    fn append(&mut self, data: &[u8]) {
        let capacity = self.frame_count as usize * TRACK_FRAME_SIZE;
        let room = capacity.saturating_sub(self.queued_bytes);
        if data.len() > room {
            warn!(
                track = self.track_id,
                over = data.len() - room,
                "track delivery exceeds declared capacity, truncating"
            );
        }
        let take = data.len().min(room);
        self.pending.extend_from_slice(&data[..take]);
        self.queued_bytes += take;
    }

    fn drain(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

/// All live channels for the current stream, keyed by track id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<i32, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(&mut self, track_id: i32) -> &mut Channel {
        self.channels
            .entry(track_id)
            .or_insert_with(|| Channel::new(track_id))
    }

    pub fn get(&self, track_id: i32) -> Option<&Channel> {
        self.channels.get(&track_id)
    }

    /// Parses a sound-frame payload and appends it to its channel.
    /// `middle_audio` suppresses the sequence check once after a seek.
    pub fn handle_sound_frame(&mut self, payload: &[u8], middle_audio: &mut bool) -> Result<()> {
        if payload.len() < 10 {
            return Err(Error::TruncatedSubChunk);
        }
        let track_id = LittleEndian::read_u16(&payload[0..]) as i32;
        let index = LittleEndian::read_u16(&payload[2..]) as i32;
        let frame_count = LittleEndian::read_u16(&payload[4..]) as i32;
        let flags = LittleEndian::read_u16(&payload[6..]) as i32;
        let volume = payload[8];
        let pan = payload[9] as i8;
        let data = &payload[10..];

        debug!(track_id, index, frame_count, "sound frame");

        let channel = self.find_or_create(track_id);
        if *middle_audio || index == 0 {
            channel.set_parameters(frame_count, flags, volume, pan, index);
        } else if !channel.check_parameters(index, frame_count, volume, pan) {
            *middle_audio = false;
            return Ok(());
        }
        *middle_audio = false;
        channel.append(data);
        Ok(())
    }

    /// Flushes every channel's pending bytes to the sink. Called once per
    /// frame after the sub-chunks are processed.
    pub fn advance(&mut self, sink: &mut dyn AudioSink) {
        for channel in self.channels.values_mut() {
            if let Some(data) = channel.drain() {
                sink.queue_track(channel.track_id, TRACK_RATE, channel.volume, channel.pan, data);
            }
        }
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

/// Output rate of the interleaved transform protocol.
const INTERLEAVED_RATE: u32 = 22050;
/// Decoded bytes per complete transform block.
const INTERLEAVED_OUTPUT: usize = 4096;
/// Escape control byte: copy a literal 16-bit sample.
const LITERAL_SAMPLE: u8 = 0x80;
/// Worst-case encoded payload: the shift byte plus 6 input bytes per
/// 4-byte output group when every sample uses the literal escape.
const INTERLEAVED_MAX_PAYLOAD: usize = 1 + (INTERLEAVED_OUTPUT / 4) * 6;

/// Stateful decoder for the interleaved compressed-audio sub-protocol.
///
/// Blocks arrive split across chunks: a big-endian 16-bit payload length
/// plus that many bytes. A complete block expands to 4096 output bytes;
/// each 2 control bytes yield 4 output bytes (two 16-bit samples built by
/// shifting a signed byte by one of two per-block nibble amounts), with
/// 0x80 escaping a literal 16-bit sample.
pub struct InterleavedDecoder {
    block: [u8; 2 + INTERLEAVED_MAX_PAYLOAD],
    pos: usize,
}

impl Default for InterleavedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InterleavedDecoder {
    pub fn new() -> Self {
        Self {
            block: [0; 2 + INTERLEAVED_MAX_PAYLOAD],
            pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Feeds chunk bytes, queuing every completed block to the sink.
    pub fn feed(&mut self, mut data: &[u8], sink: &mut dyn AudioSink) -> Result<()> {
        while !data.is_empty() {
            if self.pos >= 2 {
                let len = BigEndian::read_u16(&self.block) as usize + 2;
                if len > self.block.len() {
                    return Err(Error::TruncatedSubChunk);
                }
                let need = len - self.pos;
                if need > data.len() {
                    self.block[self.pos..self.pos + data.len()].copy_from_slice(data);
                    self.pos += data.len();
                    data = &[];
                } else {
                    self.block[self.pos..len].copy_from_slice(&data[..need]);
                    let output = decode_block(&self.block[2..len])?;
                    sink.queue_pcm(INTERLEAVED_RATE, true, output);
                    data = &data[need..];
                    self.pos = 0;
                }
            } else {
                if data.len() > 1 && self.pos == 0 {
                    self.block[0] = data[0];
                    data = &data[1..];
                    self.pos = 1;
                }
                self.block[self.pos] = data[0];
                data = &data[1..];
                self.pos += 1;
            }
        }
        Ok(())
    }
}

/// Expands one complete transform block to 4096 bytes of 16-bit stereo PCM.
fn decode_block(block: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(INTERLEAVED_OUTPUT);
    let mut src = block.iter();
    let mut next = || src.next().copied().ok_or(Error::TruncatedSubChunk);

    let first = next()?;
    let shift_high = first / 16;
    let shift_low = first & 0x0F;

    for _ in 0..INTERLEAVED_OUTPUT / 4 {
        for shift in [shift_high, shift_low] {
            let value = next()?;
            if value == LITERAL_SAMPLE {
                out.push(next()?);
                out.push(next()?);
            } else {
                let sample = ((value as i8) as i16) << shift;
                out.push((sample >> 8) as u8);
                out.push(sample as u8);
            }
        }
    }
    Ok(out)
}

/// Magic at the head of a multiplexed stream's first block.
const STREAM_MAGIC: &[u8; 4] = b"iMUS";

/// Maps a multiplexed user id to (buffer role, volume). Ids 1..=3 select
/// the role directly at full volume; the banded ranges carry the volume in
/// the id. Anything else is fatal.
pub fn map_user_id(user_id: u16) -> Result<(usize, i32)> {
    match user_id {
        1 => Ok((STREAM_SPEECH, 127)),
        2 => Ok((STREAM_MUSIC, 127)),
        3 => Ok((STREAM_EFFECTS, 127)),
        100..=163 => Ok((STREAM_SPEECH, 2 * user_id as i32 - 200)),
        200..=263 => Ok((STREAM_MUSIC, 2 * user_id as i32 - 400)),
        300..=363 => Ok((STREAM_EFFECTS, 2 * user_id as i32 - 600)),
        other => Err(Error::BadStreamUserId(other)),
    }
}

/// State for the multiplexed stream protocol: last accepted block index per
/// buffer role.
pub struct StreamDemuxer {
    index_table: [i32; 4],
}

impl Default for StreamDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self { index_table: [0; 4] }
    }

    pub fn reset(&mut self) {
        self.index_table = [0; 4];
    }

    /// Handles one multiplexed block. `index` 0 opens the stream (the block
    /// must start with the stream magic); later blocks must arrive exactly
    /// in order or they are dropped with a warning.
    pub fn handle_block(
        &mut self,
        user_id: u16,
        index: i32,
        frame_count: i32,
        data: &[u8],
        sink: &mut dyn AudioSink,
    ) -> Result<()> {
        let (buffer, volume) = map_user_id(user_id)?;
        let paused = frame_count - index == 1;

        // Reordering around this boundary is expected in some streams, so a
        // stale block is a recoverable drop rather than an error.
        if index != 0 && self.index_table[buffer] - index != -1 {
            warn!(buffer, index, "out of order stream block, dropping");
            return Ok(());
        }
        self.index_table[buffer] = index;

        if index != 0 {
            if !sink.stream_active(buffer) {
                return Err(Error::StreamRefused(buffer));
            }
            sink.feed_stream(buffer, data, paused);
            return Ok(());
        }

        if data.len() < 4 || &data[..4] != STREAM_MAGIC {
            return Err(Error::MissingStreamMagic);
        }
        if !sink.start_stream(buffer, volume) {
            return Err(Error::StreamRefused(buffer));
        }
        sink.feed_stream(buffer, data, paused);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sound_frame(track: u16, index: u16, frames: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&track.to_le_bytes());
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&frames.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.push(127);
        payload.push(0);
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn test_sequence_gap_rejected() {
        let mut registry = ChannelRegistry::new();
        let mut middle = false;

        registry
            .handle_sound_frame(&sound_frame(1, 0, 4, &[1, 2]), &mut middle)
            .unwrap();
        // Skipping index 1 drops the chunk without crashing.
        registry
            .handle_sound_frame(&sound_frame(1, 2, 4, &[3, 4]), &mut middle)
            .unwrap();
        assert_eq!(registry.get(1).unwrap().index, 0);

        registry
            .handle_sound_frame(&sound_frame(1, 1, 4, &[5, 6]), &mut middle)
            .unwrap();
        assert_eq!(registry.get(1).unwrap().index, 1);
        assert_eq!(registry.get(1).unwrap().pending, vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_middle_audio_suppresses_check_once() {
        let mut registry = ChannelRegistry::new();
        let mut middle = true;

        // Mid-stream index accepted because of the one-shot flag.
        registry
            .handle_sound_frame(&sound_frame(2, 7, 16, &[9]), &mut middle)
            .unwrap();
        assert!(!middle);
        assert_eq!(registry.get(2).unwrap().index, 7);

        // The flag does not persist: another jump is rejected.
        registry
            .handle_sound_frame(&sound_frame(2, 12, 16, &[9]), &mut middle)
            .unwrap();
        assert_eq!(registry.get(2).unwrap().index, 7);
    }

    #[test]
    fn test_capacity_truncation() {
        let mut registry = ChannelRegistry::new();
        let mut middle = false;
        // One declared frame: capacity TRACK_FRAME_SIZE bytes.
        let big = vec![0u8; TRACK_FRAME_SIZE + 100];
        registry
            .handle_sound_frame(&sound_frame(3, 0, 1, &big), &mut middle)
            .unwrap();
        assert_eq!(registry.get(3).unwrap().pending.len(), TRACK_FRAME_SIZE);
    }

    /// Sink that records queued PCM and track deliveries for inspection.
    #[derive(Default)]
    struct CaptureSink {
        pcm: Vec<Vec<u8>>,
        tracks: Vec<(i32, u32, u8, i8, usize)>,
        streams: Vec<(usize, i32)>,
        fed: Vec<(usize, usize)>,
    }

    impl AudioSink for CaptureSink {
        fn queue_pcm(&mut self, _rate: u32, _stereo: bool, data: Vec<u8>) {
            self.pcm.push(data);
        }

        fn pcm_active(&self) -> bool {
            !self.pcm.is_empty()
        }

        fn pcm_position_ms(&self) -> u64 {
            0
        }

        fn queue_track(&mut self, track_id: i32, rate: u32, volume: u8, pan: i8, data: Vec<u8>) {
            self.tracks.push((track_id, rate, volume, pan, data.len()));
        }

        fn start_stream(&mut self, buffer: usize, volume: i32) -> bool {
            self.streams.push((buffer, volume));
            true
        }

        fn feed_stream(&mut self, buffer: usize, data: &[u8], _paused: bool) {
            self.fed.push((buffer, data.len()));
        }

        fn stream_active(&self, buffer: usize) -> bool {
            self.streams.iter().any(|&(b, _)| b == buffer)
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

    #[test]
    fn test_advance_queues_pending_at_track_rate() {
        let mut registry = ChannelRegistry::new();
        let mut middle = false;
        registry
            .handle_sound_frame(&sound_frame(1, 0, 4, &[1, 2, 3]), &mut middle)
            .unwrap();

        let mut sink = CaptureSink::default();
        registry.advance(&mut sink);
        assert_eq!(sink.tracks, vec![(1, TRACK_RATE, 127, 0, 3)]);

        // Drained channels deliver nothing further.
        registry.advance(&mut sink);
        assert_eq!(sink.tracks.len(), 1);
    }

    /// Builds one complete transform block whose control bytes all shift
    /// the same signed value.
    fn transform_block(shifts: u8, control: u8) -> Vec<u8> {
        let mut payload = vec![shifts];
        payload.extend(std::iter::repeat(control).take(INTERLEAVED_OUTPUT / 2));
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        chunk.extend_from_slice(&payload);
        chunk
    }

    #[test]
    fn test_interleaved_block_decodes_shifted_samples() {
        let mut decoder = InterleavedDecoder::new();
        let mut sink = CaptureSink::default();

        // Both nibble shifts are 4; control byte 2 becomes sample 2 << 4.
        decoder.feed(&transform_block(0x44, 2), &mut sink).unwrap();
        assert_eq!(sink.pcm.len(), 1);
        let out = &sink.pcm[0];
        assert_eq!(out.len(), INTERLEAVED_OUTPUT);
        assert_eq!(&out[..4], &[0, 32, 0, 32]);
    }

    #[test]
    fn test_interleaved_block_split_across_chunks() {
        let mut decoder = InterleavedDecoder::new();
        let mut sink = CaptureSink::default();

        let block = transform_block(0x00, 1);
        let (a, b) = block.split_at(7);
        decoder.feed(a, &mut sink).unwrap();
        assert!(sink.pcm.is_empty());
        decoder.feed(b, &mut sink).unwrap();
        assert_eq!(sink.pcm.len(), 1);
        // Shift 0: control byte 1 is the sample value itself.
        assert_eq!(&sink.pcm[0][..2], &[0, 1]);
    }

    #[test]
    fn test_interleaved_literal_escape() {
        // Hand-build a payload: shift byte, then pairs where the first is a
        // literal escape and the second a plain control byte.
        let mut payload = vec![0x00u8];
        for _ in 0..INTERLEAVED_OUTPUT / 4 {
            payload.extend_from_slice(&[LITERAL_SAMPLE, 0xAB, 0xCD, 3]);
        }
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        chunk.extend_from_slice(&payload);

        let mut decoder = InterleavedDecoder::new();
        let mut sink = CaptureSink::default();
        decoder.feed(&chunk, &mut sink).unwrap();
        assert_eq!(&sink.pcm[0][..4], &[0xAB, 0xCD, 0, 3]);
    }

    #[test]
    fn test_user_id_mapping() {
        assert_eq!(map_user_id(1).unwrap(), (STREAM_SPEECH, 127));
        assert_eq!(map_user_id(100).unwrap(), (STREAM_SPEECH, 0));
        assert_eq!(map_user_id(163).unwrap(), (STREAM_SPEECH, 126));
        assert_eq!(map_user_id(231).unwrap(), (STREAM_MUSIC, 62));
        assert_eq!(map_user_id(363).unwrap(), (STREAM_EFFECTS, 126));
        assert!(map_user_id(50).is_err());
        assert!(map_user_id(400).is_err());
    }

    #[test]
    fn test_stream_demuxer_order_and_magic() {
        let mut demux = StreamDemuxer::new();
        let mut sink = CaptureSink::default();

        // First block must carry the magic.
        assert!(matches!(
            demux.handle_block(1, 0, 10, b"nope", &mut sink),
            Err(Error::MissingStreamMagic)
        ));

        let mut first = b"iMUS".to_vec();
        first.extend_from_slice(&[0; 8]);
        demux.handle_block(1, 0, 10, &first, &mut sink).unwrap();
        assert_eq!(sink.streams, vec![(STREAM_SPEECH, 127)]);

        demux.handle_block(1, 1, 10, &[0; 4], &mut sink).unwrap();
        assert_eq!(sink.fed.len(), 2);

        // A replayed index is dropped silently.
        demux.handle_block(1, 1, 10, &[0; 4], &mut sink).unwrap();
        assert_eq!(sink.fed.len(), 2);
    }
}
