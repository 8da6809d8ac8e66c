//! Client side of the relay
//!
//! Listens for a sender, plays whatever format it announces and, when the
//! handshake asks for it, streams the microphone back.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_relay::{
    audio::device::{list_devices, CpalBackend},
    config::AppConfig,
    network::link,
    session::{PeerSession, Role, SessionEvent},
};

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Play audio streamed by a PCM relay sender")]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

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
    if let Some(port) = args.port {
        config.network.port = port;
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

    tracing::info!("Starting PCM relay receiver");
    let listener = link::listen(&config.network)?;

    let running = Arc::new(AtomicBool::new(true));
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || print_events(events_rx));

    let mut worker = tokio::task::spawn_blocking({
        let running = running.clone();
        move || {
            let backend = CpalBackend::new(&config.audio);
            let mut session = PeerSession::new(Role::Client, &config, backend)
                .with_events(events_tx)
                .with_running(running.clone());

            link::accept_loop(&listener, &config.network, &running, |stream, peer| {
                match session.run(stream, &peer.to_string()) {
                    Ok(summary) => tracing::info!(
                        "Session summary: {}",
                        serde_json::to_string(&summary).unwrap_or_default()
                    ),
                    Err(e) => tracing::warn!("Session with {} failed: {}", peer, e),
                }
            })
        }
    });

    tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            running.store(false, Ordering::SeqCst);
            worker.await??;
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
