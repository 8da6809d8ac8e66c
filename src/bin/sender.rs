//! Host side of the relay
//!
//! Connects to a receiver, announces the stream format and streams the
//! default input device to it. Reconnects until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_relay::{
    audio::device::{list_devices, CpalBackend},
    config::AppConfig,
    network::link,
    session::{PeerSession, Role, SessionEvent},
};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "sender", about = "Stream local audio to a PCM relay receiver")]
struct Args {
    /// Receiver address, e.g. 192.168.1.20:7000
    #[arg(short, long, required_unless_present = "list_devices")]
    target: Option<String>,

    /// Ask the receiver to stream its microphone back
    #[arg(long)]
    mic: bool,

    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print available audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if args.mic {
        config.audio.use_mic = true;
    }
    config.validate()?;

    // Initialize logging; stdout is reserved for events
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let target = args.target.unwrap_or_default();
    tracing::info!("Starting PCM relay sender, target {}", target);

    let running = Arc::new(AtomicBool::new(true));
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || print_events(events_rx));

    let mut worker = tokio::task::spawn_blocking({
        let running = running.clone();
        move || {
            let backend = CpalBackend::new(&config.audio);
            let mut session = PeerSession::new(Role::Host, &config, backend)
                .with_events(events_tx)
                .with_running(running.clone());
            let mut delay = Duration::from_secs(1);

            while running.load(Ordering::SeqCst) {
                match link::connect(&target, &config.network) {
                    Ok(stream) => {
                        delay = Duration::from_secs(1);
                        match session.run(stream, &target) {
                            Ok(summary) => tracing::info!(
                                "Session summary: {}",
                                serde_json::to_string(&summary).unwrap_or_default()
                            ),
                            Err(e) => tracing::warn!("Session failed: {}", e),
                        }
                    }
                    Err(e) => tracing::warn!("Connect failed: {}", e),
                }

                if !running.load(Ordering::SeqCst) {
                    break;
                }

                tracing::info!("Reconnecting in {:?}", delay);
                // Sleep in small increments to allow early exit
                for _ in 0..delay.as_millis() / 100 {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    });

    tokio::select! {
        result = &mut worker => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            running.store(false, Ordering::SeqCst);
            worker.await?;
        }
    }

    Ok(())
}

fn print_events(events: Receiver<SessionEvent>) {
    for event in events {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode event: {}", e),
        }
    }
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();
}
