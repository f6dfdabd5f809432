//! SAN CLI Tool
//!
//! Command-line interface for inspecting, extracting and playing SAN
//! animation files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use san_core::chunk::{self, padded_size};
use san_core::ChunkReader;
use san_decoder::host::{Clock, DisplaySurface, NullAudio, NullEvents, NullGlyphs, WallClock};
use san_decoder::player::AudioProtocol;
use san_decoder::{Playback, Player};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "san")]
#[command(about = "SAN - chunked animation container inspector and player")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show container structure and header information
    Info {
        /// Input SAN file path
        input: PathBuf,
    },

    /// Decode frames headlessly and save them as PNG images
    Extract {
        /// Input SAN file path
        input: PathBuf,

        /// Output directory for frames
        #[arg(short, long)]
        output: PathBuf,

        /// Extract a single frame by frame number
        #[arg(long)]
        frame: Option<u32>,

        /// Use the multiplexed audio protocol instead of the default
        #[arg(long)]
        streamed_audio: bool,
    },

    /// Play an animation headlessly at its nominal pace
    Play {
        /// Input SAN file path
        input: PathBuf,

        /// Frame rate in frames per second
        #[arg(long, default_value = "12")]
        speed: i32,

        /// Byte offset to resume from
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Frame number matching the resume offset
        #[arg(long, default_value = "0")]
        start_frame: i32,

        /// Disable switchable subtitle text
        #[arg(long)]
        no_subtitles: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { input } => print_info(input)?,

        Commands::Extract {
            input,
            output,
            frame,
            streamed_audio,
        } => extract_frames(input, output, frame, streamed_audio)?,

        Commands::Play {
            input,
            speed,
            offset,
            start_frame,
            no_subtitles,
        } => play_animation(input, speed, offset, start_frame, no_subtitles)?,
    }

    Ok(())
}

fn print_info(input: PathBuf) -> Result<()> {
    let file = File::open(&input).context("Failed to open SAN file")?;
    let mut reader = ChunkReader::new(BufReader::new(file)).context("Failed to read SAN file")?;

    let (tag, size) = reader.read_tag().context("Failed to read container tag")?;
    if tag != chunk::ANIM {
        bail!("{} is not a SAN animation (found '{}')", input.display(), tag);
    }

    println!("=== SAN File Information ===");
    println!("File: {}", input.display());
    println!("Container: {} bytes payload", size);

    let mut frames: Vec<(u64, u32, Vec<(String, u32)>)> = Vec::new();
    let mut sub_tags: BTreeMap<String, u32> = BTreeMap::new();

    while reader.within_bounds()? {
        let (tag, size) = reader.read_tag()?;
        let offset = reader.pos()?;
        match tag {
            chunk::AHDR => {
                let payload = reader.read_payload(tag, size)?;
                if payload.len() >= 6 {
                    let version = u16::from_le_bytes([payload[0], payload[1]]);
                    let declared = u16::from_le_bytes([payload[2], payload[3]]);
                    println!("Header version: {}", version);
                    println!("Declared frames: {}", declared);
                }
            }
            chunk::FRME => {
                let subs = walk_sub_chunks(&mut reader, size, &mut sub_tags)?;
                frames.push((offset - 8, size, subs));
            }
            other => println!("Unexpected top-level chunk '{}' ({} bytes)", other, size),
        }
        reader.seek_past(offset, size)?;
    }

    println!("Frame chunks: {}", frames.len());

    println!("\n=== Frames (first 10) ===");
    for (i, (offset, size, subs)) in frames.iter().take(10).enumerate() {
        let listing: Vec<String> = subs
            .iter()
            .map(|(tag, size)| format!("{} ({})", tag, size))
            .collect();
        println!(
            "  [{}] at {:#x}, {} bytes: {}",
            i,
            offset,
            size,
            listing.join(", ")
        );
    }
    if frames.len() > 10 {
        println!("  ... and {} more frames", frames.len() - 10);
    }

    println!("\n=== Sub-chunk totals ===");
    for (tag, count) in &sub_tags {
        println!("  {}: {}", tag, count);
    }

    Ok(())
}

fn walk_sub_chunks(
    reader: &mut ChunkReader<BufReader<File>>,
    frame_size: u32,
    tally: &mut BTreeMap<String, u32>,
) -> Result<Vec<(String, u32)>> {
    let mut subs = Vec::new();
    let mut remaining = i64::from(frame_size);
    while remaining > 0 {
        let (tag, size) = reader.read_tag()?;
        let offset = reader.pos()?;
        *tally.entry(tag.to_string()).or_insert(0) += 1;
        subs.push((tag.to_string(), size));
        remaining -= i64::from(padded_size(size));
        reader.seek_past(offset, size)?;
    }
    Ok(subs)
}

/// Clock whose sleep advances virtual time, so a paced playback loop runs
/// as fast as decoding allows.
struct TurboClock {
    now: u64,
}

impl Clock for TurboClock {
    fn millis(&self) -> u64 {
        self.now
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.now += ms;
    }
}

/// Display surface that pushes finished frames through the live palette
/// and writes them out as RGB PNGs.
struct PngSink {
    palette: [u8; 768],
    out_dir: PathBuf,
    only: Option<u32>,
    index: u32,
    saved: Rc<Cell<u32>>,
    error: Rc<RefCell<Option<anyhow::Error>>>,
}

impl DisplaySurface for PngSink {
    fn set_palette(&mut self, colors: &[u8], first: usize, count: usize) {
        self.palette[first * 3..(first + count) * 3].copy_from_slice(&colors[..count * 3]);
    }

    fn copy_frame(&mut self, frame: &[u8], pitch: usize, width: usize, height: usize) {
        let n = self.index;
        self.index += 1;
        if self.only.is_some_and(|only| only != n) {
            return;
        }
        if self.error.borrow().is_some() {
            return;
        }

        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = frame[y * pitch + x] as usize * 3;
                img.put_pixel(
                    x as u32,
                    y as u32,
                    image::Rgb([
                        self.palette[idx],
                        self.palette[idx + 1],
                        self.palette[idx + 2],
                    ]),
                );
            }
        }

        let path = self.out_dir.join(format!("frame_{:05}.png", n));
        match img.save(&path) {
            Ok(()) => {
                self.saved.set(self.saved.get() + 1);
            }
            Err(err) => {
                *self.error.borrow_mut() =
                    Some(anyhow::Error::new(err).context(format!("Failed to save {}", path.display())));
            }
        }
    }
}

fn extract_frames(
    input: PathBuf,
    output: PathBuf,
    frame: Option<u32>,
    streamed_audio: bool,
) -> Result<()> {
    std::fs::create_dir_all(&output).context("Failed to create output directory")?;

    let saved = Rc::new(Cell::new(0u32));
    let error = Rc::new(RefCell::new(None));
    let sink = PngSink {
        palette: [0; 768],
        out_dir: output.clone(),
        only: frame,
        index: 0,
        saved: Rc::clone(&saved),
        error: Rc::clone(&error),
    };

    let config = Playback {
        audio_protocol: if streamed_audio {
            AudioProtocol::Streamed
        } else {
            AudioProtocol::Interleaved
        },
        ..Playback::default()
    };
    let mut player = Player::new(
        config,
        Box::new(TurboClock { now: 0 }),
        Box::new(sink),
        Box::new(NullAudio),
        Box::new(NullGlyphs),
        Box::new(NullEvents),
    );

    println!("Extracting frames from {}", input.display());
    player
        .play(&input, 12, 0, 0)
        .context("Playback failed during extraction")?;

    if let Some(err) = error.borrow_mut().take() {
        return Err(err);
    }
    if saved.get() == 0 {
        bail!("No frames were rendered");
    }
    println!("Saved {} frames to {}", saved.get(), output.display());

    Ok(())
}

/// Counts frames delivered to the display without keeping the pixels.
struct CountingSink {
    frames: Rc<Cell<u32>>,
}

impl DisplaySurface for CountingSink {
    fn set_palette(&mut self, _colors: &[u8], _first: usize, _count: usize) {}

    fn copy_frame(&mut self, _frame: &[u8], _pitch: usize, _width: usize, _height: usize) {
        self.frames.set(self.frames.get() + 1);
    }
}

fn play_animation(
    input: PathBuf,
    speed: i32,
    offset: u64,
    start_frame: i32,
    no_subtitles: bool,
) -> Result<()> {
    let frames = Rc::new(Cell::new(0u32));
    let config = Playback {
        subtitles: !no_subtitles,
        ..Playback::default()
    };
    let mut player = Player::new(
        config,
        Box::new(WallClock::new()),
        Box::new(CountingSink {
            frames: Rc::clone(&frames),
        }),
        Box::new(NullAudio),
        Box::new(NullGlyphs),
        Box::new(NullEvents),
    );

    println!("Playing {} at {} fps", input.display(), speed);
    let started = std::time::Instant::now();
    player
        .play(&input, speed, offset, start_frame)
        .context("Playback failed")?;

    println!(
        "Rendered {} of {} frames in {:.2} seconds",
        frames.get(),
        player.frame_count(),
        started.elapsed().as_secs_f64()
    );

    Ok(())
}
