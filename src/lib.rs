//! # PCM Relay
//!
//! Real-time mono PCM relay between two peers over one connected byte
//! stream (TCP, or a unix socket tunneled over USB).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── HOST (sender) ───────────────────────────────┐
//! │  ┌─────────────┐    ┌──────────────────┐    ┌──────────────────────────────┐ │
//! │  │ Input device│───▶│ AudioCapture      │───▶│ FrameSender (0x20 frames)    │ │
//! │  │ (cpal tick) │    │ reusable buffer   │    │ handshake 0x19 / 0x21 first  │ │
//! │  └─────────────┘    └──────────────────┘    └──────────────┬───────────────┘ │
//! │                                                            │                 │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌──────────────┴───────────────┐ │
//! │  │Output device│◀───│ AudioRelay       │◀───│ FrameReader (mic, optional)  │ │
//! │  └─────────────┘    └──────────────────┘    └──────────────▲───────────────┘ │
//! └────────────────────────────────────────────────────────────┼─────────────────┘
//!                                                              │ TCP / USB tunnel
//! ┌──────────────────────────────── CLIENT (receiver) ─────────┼─────────────────┐
//! │                                             ┌──────────────▼───────────────┐ │
//! │  ┌─────────────┐    ┌──────────────────┐    │ FrameReader                  │ │
//! │  │Output device│◀───│ AudioRelay       │◀───│ resync on bad headers        │ │
//! │  │ (cpal tick) │    │ RingBuffer+drift │    └──────────────────────────────┘ │
//! │  └─────────────┘    └──────────────────┘                                     │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌──────────────────────────────┐ │
//! │  │ Microphone  │───▶│ AudioCapture      │───▶│ FrameSender (when 0x21)      │ │
//! │  └─────────────┘    └──────────────────┘    └──────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Name used for the config directory
    pub const APP_NAME: &str = "pcm-relay";

    /// Port the client listens on
    pub const DEFAULT_PORT: u16 = 7000;

    /// Default stream sample rate
    pub const DEFAULT_SAMPLE_RATE: f64 = 48000.0;

    /// Playback ring capacity in bytes
    pub const RING_BUFFER_BYTES: usize = 8192 * 300;

    /// Largest device tick served in one drain or captured into one packet
    pub const MAX_FRAMES_PER_TICK: usize = 4096;

    /// Device buffer size in frames (~10 ms at 48 kHz)
    pub const IO_BUFFER_FRAMES: u32 = 512;

    /// Sanity limit on a frame's declared payload length
    pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
}
