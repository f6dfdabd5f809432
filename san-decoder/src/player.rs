//! Frame orchestration and playback scheduling
//!
//! The player owns the timing loop: it pulls top-level chunks from the
//! stream, dispatches frame sub-chunks to the codec bank, palette manager,
//! audio demuxer and text resolver, decides frame skips under load, applies
//! seek requests, and synchronizes elapsed time against either the wall
//! clock or an active audio channel's playback position.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use san_core::chunk::{self, padded_size, ChunkReader};
use san_core::{Error as CoreError, StringResource};

use crate::audio::{ChannelRegistry, InterleavedDecoder, StreamDemuxer};
use crate::codec::CodecBank;
use crate::host::{AudioSink, Clock, DisplaySurface, EventSource, GlyphRenderer};
use crate::palette::{Palette, PALETTE_SIZE};
use crate::text;
use crate::{Error, Result};

/// Dimensions of the dedicated secondary decode buffer. Frame objects
/// declaring exactly this size are decoded there instead of the main frame
/// buffer.
const SPECIAL_WIDTH: usize = 384;
const SPECIAL_HEIGHT: usize = 242;

/// Consecutive skipped frames before a render is forced.
const MAX_CONSECUTIVE_SKIPS: u32 = 10;

/// Bounded pacing sleep per loop iteration.
const LOOP_DELAY_MS: u64 = 10;

const FOBJ_HEADER: usize = 14;
const IACT_HEADER: usize = 18;

/// Playback lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Priming,
    Playing,
    Draining,
    Released,
}

/// Which interleaved-audio protocol the stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioProtocol {
    /// 2-byte-grouped transform blocks decoded in place.
    #[default]
    Interleaved,
    /// Multiplexed logical buffers selected by user id.
    Streamed,
}

/// Per-play context; replaces any engine-wide globals.
#[derive(Debug, Clone)]
pub struct Playback {
    pub screen_width: usize,
    pub screen_height: usize,
    pub subtitles: bool,
    pub audio_protocol: AudioProtocol,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            screen_width: 640,
            screen_height: 480,
            subtitles: true,
            audio_protocol: AudioProtocol::default(),
        }
    }
}

/// Pending reposition request applied at the top of the next frame pull.
struct SeekRequest {
    file: Option<PathBuf>,
    offset: u64,
    frame: i32,
}

/// Frame-skip back-off: after ten consecutive skips the next frame renders
/// no matter how late it is.
struct SkipTracker {
    skipped: u32,
}

impl SkipTracker {
    fn new() -> Self {
        Self { skipped: 0 }
    }

    fn resolve(&mut self, eligible: bool) -> bool {
        if !eligible {
            self.skipped = 0;
            return false;
        }
        self.skipped += 1;
        if self.skipped > MAX_CONSECUTIVE_SKIPS {
            self.skipped = 0;
            return false;
        }
        true
    }
}

/// Active decode target for frame objects and overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Main,
    Special,
}

type Stream = ChunkReader<BufReader<File>>;

pub struct Player {
    config: Playback,
    state: PlayerState,

    clock: Box<dyn Clock>,
    display: Box<dyn DisplaySurface>,
    audio: Box<dyn AudioSink>,
    glyphs: Box<dyn GlyphRenderer>,
    events: Box<dyn EventSource>,

    base: Option<Stream>,
    base_size: u64,

    codecs: CodecBank,
    palette: Palette,
    registry: ChannelRegistry,
    interleaved: InterleavedDecoder,
    streams: StreamDemuxer,
    strings: Option<StringResource>,

    frame_buffer: Vec<u8>,
    special_buffer: Option<Vec<u8>>,
    stored_frame: Option<Vec<u8>>,
    target: Target,
    width: usize,
    height: usize,

    seek: Option<SeekRequest>,
    skip_next: bool,
    store_frame: bool,
    skip_palette: bool,
    middle_audio: bool,
    companion_track: bool,
    insanity: bool,

    frame: i32,
    nb_frames: i32,
    start_frame: i32,
    start_time: u64,
    speed: i32,

    paused: bool,
    pause_start: u64,
    pause_time: u64,

    end_of_file: bool,
    update_needed: bool,
}

impl Player {
    pub fn new(
        config: Playback,
        clock: Box<dyn Clock>,
        display: Box<dyn DisplaySurface>,
        audio: Box<dyn AudioSink>,
        glyphs: Box<dyn GlyphRenderer>,
        events: Box<dyn EventSource>,
    ) -> Self {
        let frame_buffer = vec![0; config.screen_width * config.screen_height];
        Self {
            config,
            state: PlayerState::Idle,
            clock,
            display,
            audio,
            glyphs,
            events,
            base: None,
            base_size: 0,
            codecs: CodecBank::new(),
            palette: Palette::new(),
            registry: ChannelRegistry::new(),
            interleaved: InterleavedDecoder::new(),
            streams: StreamDemuxer::new(),
            strings: None,
            frame_buffer,
            special_buffer: None,
            stored_frame: None,
            target: Target::Main,
            width: 0,
            height: 0,
            seek: None,
            skip_next: false,
            store_frame: false,
            skip_palette: false,
            middle_audio: false,
            companion_track: false,
            insanity: false,
            frame: 0,
            nb_frames: 0,
            start_frame: 0,
            start_time: 0,
            speed: 12,
            paused: false,
            pause_start: 0,
            pause_time: 0,
            end_of_file: false,
            update_needed: false,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn frame_count(&self) -> i32 {
        self.nb_frames
    }

    /// Syncs elapsed time to the wall clock instead of audio positions;
    /// also lifts the nominal-size filter on frame objects so small
    /// overlay frames draw into the main buffer.
    pub fn set_insanity(&mut self, enabled: bool) {
        self.insanity = enabled;
    }

    pub fn set_palette(&mut self, colors: &[u8; PALETTE_SIZE]) {
        self.palette.set_full(colors);
    }

    pub fn set_palette_entry(&mut self, n: usize, r: u8, g: u8, b: u8) {
        self.palette.set_entry(n, r, g, b);
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.pause_start = self.clock.millis();
        }
    }

    pub fn unpause(&mut self) {
        if self.paused {
            self.paused = false;
            self.pause_time += self.clock.millis() - self.pause_start;
            self.pause_start = 0;
        }
    }

    /// Requests a reposition, optionally into a different file. A nonzero
    /// offset resumes mid-stream: the header is re-read to prime the
    /// palette and frame count, and the next audio delivery bypasses the
    /// sequence check once.
    pub fn seek(&mut self, file: Option<&Path>, offset: u64, resume_frame: i32) {
        self.seek = Some(SeekRequest {
            file: file.map(Path::to_path_buf),
            offset,
            frame: resume_frame,
        });
        self.pause_time = 0;
    }

    /// Plays an animation to completion (or until the host quits).
    ///
    /// Fatal format errors end playback as if the stream had ended; they
    /// are logged, not propagated, and never leave partial frames on the
    /// display.
    pub fn play(&mut self, path: &Path, speed: i32, offset: u64, start_frame: i32) -> Result<()> {
        if !path.exists() {
            warn!(path = %path.display(), "animation file not found");
            return Ok(());
        }

        self.speed = speed.max(1);
        self.strings = load_strings(path);
        self.state = PlayerState::Priming;
        self.end_of_file = false;
        self.update_needed = false;
        self.frame = start_frame;
        self.start_frame = start_frame;
        self.nb_frames = 0;
        self.width = 0;
        self.height = 0;
        self.target = Target::Main;
        self.frame_buffer.fill(0);
        self.skip_next = false;
        self.store_frame = false;
        self.companion_track = false;
        self.paused = false;
        self.pause_time = 0;
        self.palette.mark_dirty(0, 255);
        self.audio.stop_all();
        self.interleaved.reset();
        self.streams.reset();
        self.registry.clear();

        self.seek = Some(SeekRequest {
            file: Some(path.to_path_buf()),
            offset,
            frame: start_frame,
        });
        self.start_time = self.clock.millis();

        let mut skips = SkipTracker::new();
        loop {
            let elapsed = self.elapsed_ms();
            let mut skip_eligible = false;

            if elapsed >= self.frame_target(self.frame) {
                skip_eligible = elapsed >= self.frame_target(self.frame + 1);
                if let Err(err) = self.parse_next_frame() {
                    error!(%err, "fatal playback error, ending stream");
                    break;
                }
            }

            if let Some((min, max)) = self.palette.take_dirty() {
                let colors = &self.palette.colors()[min * 3..(max + 1) * 3];
                self.display.set_palette(colors, min, max - min + 1);
                // A palette flush must reach the screen: it voids any skip.
                skip_eligible = false;
            }

            let skip = skips.resolve(skip_eligible);
            if self.update_needed && !skip {
                let width = self.width.min(self.config.screen_width);
                let height = self.height.min(self.config.screen_height);
                let (buf, pitch) = match self.target {
                    Target::Main => (&self.frame_buffer, self.config.screen_width),
                    Target::Special => (
                        self.special_buffer.as_ref().expect("special target without buffer"),
                        SPECIAL_WIDTH,
                    ),
                };
                self.display.copy_frame(buf, pitch, width, height);
                self.update_needed = false;
            }

            if self.end_of_file {
                break;
            }
            if self.events.should_quit() {
                self.audio.stop_all();
                self.interleaved.reset();
                break;
            }
            self.clock.sleep_ms(LOOP_DELAY_MS);
        }

        self.release();
        Ok(())
    }

    /// Target elapsed milliseconds for frame `n`.
    fn frame_target(&self, n: i32) -> u64 {
        let frames = i64::from(n - self.start_frame);
        (frames * 1000 / i64::from(self.speed)).max(0) as u64
    }

    /// Elapsed playback time. Insanity mode always syncs to the wall
    /// clock; otherwise an active companion track, then an active
    /// interleaved stream, takes precedence.
    fn elapsed_ms(&self) -> u64 {
        if self.insanity {
            self.wall_elapsed()
        } else if self.audio.track_active() {
            self.audio.track_position_ms()
        } else if self.audio.pcm_active() {
            self.audio.pcm_position_ms()
        } else {
            self.wall_elapsed()
        }
    }

    fn wall_elapsed(&self) -> u64 {
        self.clock
            .millis()
            .saturating_sub(self.pause_time)
            .saturating_sub(self.start_time)
    }

    /// Applies any pending seek, then pulls and dispatches the next
    /// top-level chunk.
    fn parse_next_frame(&mut self) -> Result<()> {
        if let Some(request) = self.seek.take() {
            self.apply_seek(request)?;
        }

        let mut base = self.base.take().ok_or(CoreError::NotAnimation)?;
        let result = self.pull_chunk(&mut base);
        self.base = Some(base);
        result
    }

    fn pull_chunk(&mut self, base: &mut Stream) -> Result<()> {
        let end = self.base_size + 8;
        if base.pos()? + 8 > end {
            self.end_of_file = true;
            self.state = PlayerState::Draining;
            return Ok(());
        }

        let (tag, size) = base.read_tag()?;
        let offset = base.pos()?;
        debug!(%tag, size, offset, "top-level chunk");

        match tag {
            // Looping streams may seek back to the header mid-play.
            chunk::AHDR => {
                let payload = base.read_payload(tag, size)?;
                self.handle_anim_header(&payload)?;
            }
            chunk::FRME => self.handle_frame(base, size)?,
            _ => return Err(CoreError::UnknownChunk { tag, offset }.into()),
        }

        base.seek_past(offset, size)?;
        Ok(())
    }

    fn apply_seek(&mut self, request: SeekRequest) -> Result<()> {
        self.state = PlayerState::Priming;
        self.registry.clear();

        let mut offset = request.offset;
        if let Some(file) = &request.file {
            let reader = BufReader::new(File::open(file)?);
            let mut stream = ChunkReader::new(reader)?;
            let (tag, size) = stream.read_tag()?;
            if tag != chunk::ANIM {
                return Err(CoreError::NotAnimation.into());
            }
            self.base_size = u64::from(size);

            if offset > 0 {
                if offset <= 8 {
                    return Err(CoreError::ChunkOutOfBounds {
                        tag: chunk::ANIM,
                        offset,
                    }
                    .into());
                }
                // Resuming mid-stream: prime palette and frame count from
                // the header before jumping, and let the first audio
                // delivery land mid-sequence.
                let (tag, size) = stream.read_tag()?;
                if tag != chunk::AHDR {
                    let at = stream.pos()?;
                    return Err(CoreError::UnknownChunk { tag, offset: at }.into());
                }
                let header_at = stream.pos()?;
                let payload = stream.read_payload(tag, size)?;
                self.handle_anim_header(&payload)?;
                stream.seek_past(header_at, size)?;
                self.middle_audio = true;
                offset -= 8;
            } else {
                self.companion_track = self.audio.play_companion_track(file);
            }
            self.skip_palette = false;
            self.base = Some(stream);
        } else {
            // Seeking within the current stream keeps the live palette.
            self.skip_palette = true;
        }

        let base = self.base.as_mut().ok_or(CoreError::NotAnimation)?;
        base.seek(offset + 8)?;
        self.frame = request.frame;
        self.start_frame = request.frame;
        self.start_time = self.clock.millis();
        self.state = PlayerState::Playing;
        Ok(())
    }

    fn handle_anim_header(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 6 + PALETTE_SIZE {
            return Err(CoreError::WrongChunkSize {
                tag: chunk::AHDR,
                size: payload.len() as u32,
            }
            .into());
        }
        let version = LittleEndian::read_u16(&payload[0..]);
        self.nb_frames = LittleEndian::read_u16(&payload[2..]) as i32;
        debug!(version, frames = self.nb_frames, "animation header");

        if self.skip_palette {
            return Ok(());
        }
        self.palette.set_full(&payload[6..6 + PALETTE_SIZE]);
        Ok(())
    }

    /// Iterates a frame's sub-chunks with exact size and padding
    /// accounting, then flips the frame to the display path.
    fn handle_frame(&mut self, base: &mut Stream, frame_size: u32) -> Result<()> {
        debug!(frame = self.frame, "frame chunk");
        self.skip_next = false;

        let mut remaining = i64::from(frame_size);
        while remaining > 0 {
            let (tag, size) = base.read_tag()?;
            let offset = base.pos()?;
            let payload = base.read_payload(tag, size)?;

            match tag {
                chunk::NPAL => {
                    if payload.len() < PALETTE_SIZE {
                        return Err(CoreError::WrongChunkSize { tag, size }.into());
                    }
                    if !self.skip_palette {
                        self.palette.set_full(&payload);
                    }
                }
                chunk::FOBJ => self.handle_frame_object(&payload)?,
                chunk::ZFOB => self.handle_zlib_frame_object(&payload)?,
                chunk::XPAL => self.palette.handle_delta_chunk(&payload)?,
                chunk::PSAD => {
                    if !self.companion_track {
                        self.registry
                            .handle_sound_frame(&payload, &mut self.middle_audio)?;
                    }
                }
                chunk::IACT => self.handle_interleaved(&payload)?,
                chunk::TRES => self.handle_text(&payload, false)?,
                chunk::TEXT => self.handle_text(&payload, true)?,
                chunk::STOR => {
                    if size < 4 {
                        return Err(CoreError::WrongChunkSize { tag, size }.into());
                    }
                    self.store_frame = true;
                }
                chunk::FTCH => {
                    if size < 6 {
                        return Err(CoreError::WrongChunkSize { tag, size }.into());
                    }
                    self.fetch_stored();
                }
                chunk::SKIP => {
                    if payload.len() >= 2 && LittleEndian::read_u16(&payload) != 0 {
                        self.skip_next = true;
                    }
                }
                _ => return Err(CoreError::UnknownChunk { tag, offset }.into()),
            }

            remaining -= i64::from(padded_size(size));
            base.seek_past(offset, size)?;
        }

        if self.width != 0 && self.height != 0 {
            self.update_needed = true;
        }
        self.registry.advance(self.audio.as_mut());
        self.frame += 1;
        Ok(())
    }

    fn handle_frame_object(&mut self, payload: &[u8]) -> Result<()> {
        if self.skip_next {
            self.skip_next = false;
            return Ok(());
        }
        self.decode_frame_object(payload)
    }

    fn handle_zlib_frame_object(&mut self, payload: &[u8]) -> Result<()> {
        if self.skip_next {
            self.skip_next = false;
            return Ok(());
        }
        if payload.len() < 4 {
            return Err(Error::TruncatedSubChunk);
        }
        let expected = BigEndian::read_u32(payload) as usize;
        let mut decoded = Vec::with_capacity(expected);
        ZlibDecoder::new(&payload[4..])
            .read_to_end(&mut decoded)
            .map_err(|_| Error::ZlibFrame)?;
        if decoded.len() != expected {
            warn!(
                expected,
                got = decoded.len(),
                "zlib frame object size mismatch"
            );
        }
        self.decode_frame_object(&decoded)
    }

    /// Decodes a frame object into the active target buffer, applying the
    /// dimension filters: the special resolution swaps in the secondary
    /// buffer, anything larger than the screen is skipped, and non-nominal
    /// sizes are skipped unless insanity mode permits overlay drawing.
    fn decode_frame_object(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < FOBJ_HEADER {
            return Err(Error::TruncatedSubChunk);
        }
        let codec = LittleEndian::read_u16(&data[0..]);
        let left = LittleEndian::read_u16(&data[2..]) as usize;
        let top = LittleEndian::read_u16(&data[4..]) as usize;
        let width = LittleEndian::read_u16(&data[6..]) as usize;
        let height = LittleEndian::read_u16(&data[8..]) as usize;
        let src = &data[FOBJ_HEADER..];

        let (screen_w, screen_h) = (self.config.screen_width, self.config.screen_height);
        if width == SPECIAL_WIDTH && height == SPECIAL_HEIGHT {
            if self.special_buffer.is_none() {
                self.special_buffer = Some(vec![0; SPECIAL_WIDTH * SPECIAL_HEIGHT]);
            }
            self.target = Target::Special;
            self.width = SPECIAL_WIDTH;
            self.height = SPECIAL_HEIGHT;
        } else if width > screen_w || height > screen_h {
            debug!(width, height, "frame object exceeds screen, skipping");
            return Ok(());
        } else if !self.insanity && (width != screen_w || height != screen_h) {
            // Undersized frames are overlay updates only some streams use;
            // without the overlay mode they are skipped, matching the
            // observed filtering policy.
            debug!(width, height, "non-nominal frame object, skipping");
            return Ok(());
        } else {
            self.target = Target::Main;
            self.width = screen_w;
            self.height = screen_h;
        }

        let (buf, pitch): (&mut Vec<u8>, usize) = match self.target {
            Target::Main => (&mut self.frame_buffer, screen_w),
            Target::Special => (
                self.special_buffer.as_mut().expect("special buffer allocated above"),
                SPECIAL_WIDTH,
            ),
        };
        self.codecs
            .decode(codec, buf, pitch, src, left, top, width, height)?;

        if self.store_frame {
            let snapshot = buf.clone();
            self.stored_frame = Some(snapshot);
            self.store_frame = false;
        }
        Ok(())
    }

    fn fetch_stored(&mut self) {
        let Some(stored) = &self.stored_frame else {
            return;
        };
        let buf = match self.target {
            Target::Main => &mut self.frame_buffer,
            Target::Special => match self.special_buffer.as_mut() {
                Some(buf) => buf,
                None => return,
            },
        };
        let n = stored.len().min(buf.len());
        buf[..n].copy_from_slice(&stored[..n]);
    }

    fn handle_interleaved(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 8 {
            return Err(Error::TruncatedSubChunk);
        }
        let code = LittleEndian::read_u16(&payload[0..]);
        let flags = LittleEndian::read_u16(&payload[2..]);
        let user_id = LittleEndian::read_u16(&payload[6..]);

        if code != 8 || flags != 46 {
            // Interactive-sequence chunks are handled by the host variant
            // layer, not the player.
            debug!(code, flags, "non-audio interleaved chunk, ignoring");
            return Ok(());
        }
        if self.companion_track {
            return Ok(());
        }
        if payload.len() < IACT_HEADER {
            return Err(Error::TruncatedSubChunk);
        }
        let index = LittleEndian::read_u16(&payload[10..]) as i32;
        let frames = LittleEndian::read_u16(&payload[12..]) as i32;
        let data = &payload[IACT_HEADER..];

        match self.config.audio_protocol {
            AudioProtocol::Interleaved => self.interleaved.feed(data, self.audio.as_mut()),
            AudioProtocol::Streamed => {
                self.streams
                    .handle_block(user_id, index, frames, data, self.audio.as_mut())
            }
        }
    }

    fn handle_text(&mut self, payload: &[u8], inline: bool) -> Result<()> {
        let frame_w = if self.width != 0 { self.width } else { self.config.screen_width };
        let frame_h = if self.height != 0 { self.height } else { self.config.screen_height };

        let Some(draw) = text::resolve(
            payload,
            inline,
            self.strings.as_ref(),
            self.config.subtitles,
            frame_w,
            frame_h,
        )?
        else {
            return Ok(());
        };

        match self.target {
            Target::Main => {
                self.glyphs
                    .draw(&mut self.frame_buffer, self.config.screen_width, &draw)
            }
            Target::Special => {
                if let Some(buf) = self.special_buffer.as_mut() {
                    self.glyphs.draw(buf, SPECIAL_WIDTH, &draw);
                }
            }
        }
        Ok(())
    }

    /// Tears down all per-stream state and leaves the player reusable.
    fn release(&mut self) {
        self.state = PlayerState::Released;
        self.base = None;
        self.strings = None;
        self.stored_frame = None;
        self.special_buffer = None;
        self.target = Target::Main;
        self.codecs.reset();
        self.registry.clear();
        self.interleaved.reset();
        self.streams.reset();
        self.audio.stop_all();
        self.update_needed = false;
        self.seek = None;
    }
}

/// Loads the companion `.trs` string resource next to the animation.
/// Missing resources are recoverable: lookups degrade to a placeholder.
fn load_strings(path: &Path) -> Option<StringResource> {
    let trs = path.with_extension("trs");
    match std::fs::read(&trs) {
        Ok(bytes) => Some(StringResource::parse(&bytes)),
        Err(err) => {
            debug!(path = %trs.display(), %err, "no string resource");
            None
        }
    }
}
