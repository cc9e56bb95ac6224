//! probe_source - check that a source URL opens and yields frames
//!
//! Classifies the URL, opens it with the same capture stack the daemon uses,
//! reads a few frames and reports size and frame rate. Exits non-zero when
//! the source cannot be read.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::thread;
use std::time::{Duration, Instant};

use facestream::ingest::{CaptureOpener, DefaultCaptureOpener, ReconnectPolicy, SourceTarget};
use facestream::PipelineError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a facestream source URL")]
struct Args {
    /// Source URL (rtsp://, http(s):// video file, local path or stub://).
    url: String,

    /// Open attempts before giving up.
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Network timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Frames to read once connected.
    #[arg(long, default_value_t = 5)]
    frames: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.attempts == 0 || args.frames == 0 {
        return Err(anyhow!("--attempts and --frames must be greater than zero"));
    }

    let target = SourceTarget::parse(&args.url)?;
    println!(
        "target: {} ({})",
        target.describe(),
        if target.is_live() { "live" } else { "finite" }
    );

    let opener = DefaultCaptureOpener::new(Duration::from_secs(args.timeout));
    let policy = ReconnectPolicy::default();
    let mut attempt = 0;
    let mut capture = loop {
        attempt += 1;
        match opener.open(&target) {
            Ok(capture) => break capture,
            Err(e) if e.is_retryable() && attempt < args.attempts => {
                let delay = policy.delay(attempt);
                log::warn!("attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                thread::sleep(delay);
            }
            Err(e) => return Err(anyhow!("cannot open {}: {}", args.url, e)),
        }
    };

    match capture.fps() {
        Some(fps) => println!("reported fps: {:.2}", fps),
        None => println!("reported fps: none"),
    }

    let started = Instant::now();
    let mut read = 0u32;
    while read < args.frames {
        match capture.read_frame() {
            Ok(frame) => {
                read += 1;
                println!("frame {}: {}x{}", read, frame.width, frame.height);
            }
            Err(PipelineError::EndOfStream) => {
                println!("end of stream after {} frame(s)", read);
                break;
            }
            Err(e) => return Err(anyhow!("read failed after {} frame(s): {}", read, e)),
        }
    }
    if read == 0 {
        return Err(anyhow!("source opened but produced no frames"));
    }

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        println!("measured read rate: {:.2} frames/s", f64::from(read) / elapsed);
    }
    Ok(())
}
