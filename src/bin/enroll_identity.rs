//! enroll_identity - add or remove a known identity
//!
//! Extracts features from one or more face images with the configured
//! extractor, averages and normalises them, and stores the vector in the
//! identities table of the pipeline database.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use facestream::frame::RawFrame;
use facestream::recognize::{l2_normalize, select_extractor, SqliteIdentityStore};
use facestream::PipelineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Enroll a face identity for recognition")]
struct Args {
    /// Identity name reported on a match.
    identity: String,

    /// Face images (JPEG), ideally tightly cropped.
    images: Vec<PathBuf>,

    /// Remove the identity instead of enrolling it.
    #[arg(long)]
    remove: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let identity = args.identity.trim();
    if identity.is_empty() || identity == facestream::record::UNKNOWN_IDENTITY {
        return Err(anyhow!("identity name must be non-empty and not 'unknown'"));
    }

    let config = PipelineConfig::load()?;
    let store = SqliteIdentityStore::open(&config.db_path)?;

    if args.remove {
        if store.remove(identity)? {
            println!("removed {}", identity);
        } else {
            println!("{} was not enrolled", identity);
        }
        return Ok(());
    }
    if args.images.is_empty() {
        return Err(anyhow!("at least one image is required"));
    }

    let mut extractor = select_extractor(&config.recognition)?;
    let mut sum: Vec<f32> = Vec::new();
    for path in &args.images {
        let bytes =
            std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
        let image = RawFrame::decode_jpeg(&bytes)
            .with_context(|| format!("decode image {}", path.display()))?;
        let features = l2_normalize(extractor.extract(&image)?);
        if sum.is_empty() {
            sum = features;
        } else if sum.len() == features.len() {
            sum.iter_mut().zip(&features).for_each(|(acc, v)| *acc += v);
        } else {
            return Err(anyhow!(
                "{} produced {} features, expected {}",
                path.display(),
                features.len(),
                sum.len()
            ));
        }
    }

    store.enroll(identity, &l2_normalize(sum))?;
    println!(
        "enrolled {} from {} image(s) using the {} extractor",
        identity,
        args.images.len(),
        extractor.name()
    );
    Ok(())
}
