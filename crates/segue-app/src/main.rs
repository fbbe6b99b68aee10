//! # Segue
//!
//! Gapless command line audio player.

mod config;
mod playlist;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use segue_audio::output::list_output_devices;
use segue_audio::AudioPlayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Overrides;
use crate::playlist::Playlist;

#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(about = "Play audio files back to back without gaps")]
#[command(version)]
struct Args {
    /// Audio files, played in order
    #[arg(required_unless_present_any = ["list_devices", "print_config"])]
    files: Vec<PathBuf>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Crossfade between tracks, in seconds
    #[arg(long)]
    crossfade: Option<f64>,

    /// Output volume (0.0 to 1.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Disable loudness normalization
    #[arg(long)]
    no_normalize: bool,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue=info,segue_audio=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting Segue v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        for name in list_output_devices().context("Failed to enumerate output devices")? {
            println!("{name}");
        }
        return Ok(());
    }

    let config_path = match args.config.clone() {
        Some(path) => Some(path),
        None => config::default_config_path(),
    };
    let overrides = Overrides {
        crossfade_secs: args.crossfade,
        volume: args.volume,
        loudness_normalization: args.no_normalize.then_some(false),
    };
    let config = overrides.apply(config::load(config_path.as_deref(), args.config.is_some())?)?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    if args.save_config {
        if let Some(path) = &config_path {
            config
                .save(path)
                .with_context(|| format!("Failed to save {}", path.display()))?;
            info!("Saved configuration to {}", path.display());
        }
    }

    let player = AudioPlayer::new(config).context("Failed to start audio output")?;
    playlist::play(&player, Playlist::new(args.files))?;

    info!("Playback finished");
    Ok(())
}
