use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use camkit::camera::detect;
use camkit::{CameraSession, CaptureConfig};

/// camkit command line arguments
#[derive(Parser, Debug)]
#[command(name = "camkit")]
#[command(version, about = "USB camera probing and MJPEG streaming", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for usable capture devices
    Detect {
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream from a device until interrupted
    Stream {
        /// Device index
        #[arg(short = 'd', long, default_value_t = 0)]
        device: u32,

        /// Streaming width
        #[arg(long, default_value_t = 1280)]
        width: u32,

        /// Streaming height
        #[arg(long, default_value_t = 720)]
        height: u32,

        /// Streaming frame rate
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// JPEG quality (1-100)
        #[arg(short = 'q', long, default_value_t = 70)]
        quality: u8,
    },
    /// Take a single high-resolution photo
    Snapshot {
        /// Device index
        #[arg(short = 'd', long, default_value_t = 0)]
        device: u32,

        /// Output file
        #[arg(short = 'o', long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Detect { json } => {
            let cameras = detect();
            if json {
                println!("{}", serde_json::to_string_pretty(&cameras)?);
            } else if cameras.is_empty() {
                println!("No cameras found");
            } else {
                for camera in cameras {
                    println!("{}", camera.label);
                }
            }
        }
        Command::Stream {
            device,
            width,
            height,
            fps,
            quality,
        } => {
            let config = CaptureConfig::for_device(device)
                .with_resolution(width, height)
                .with_fps(fps)
                .with_stream_quality(quality);
            let session = CameraSession::new(config);
            session.start().await?;

            tracing::info!("Streaming, press Ctrl-C to stop");
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        match session.get_frame() {
                            Some(frame) => tracing::info!("Latest frame: {} bytes", frame.len()),
                            None => tracing::warn!("No frame published yet"),
                        }
                    }
                }
            }
            session.stop().await?;
        }
        Command::Snapshot { device, output } => {
            let session = CameraSession::new(CaptureConfig::for_device(device));
            let photo = session.capture_high_res().await?;
            std::fs::write(&output, &photo)?;
            tracing::info!("Wrote {} bytes to {}", photo.len(), output.display());
        }
    }

    Ok(())
}
