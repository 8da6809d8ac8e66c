//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{Error, Result};
use crate::protocol::{AudioFormat, SampleKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}

/// Stream connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Consecutive read timeouts before the peer is declared dead
    pub max_idle_timeouts: u32,
    pub nodelay: bool,
    pub keepalive_secs: Option<u64>,
    /// Upper bound on a frame's declared payload length
    pub max_payload_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: constants::DEFAULT_PORT,
            connect_timeout_ms: 2000,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            max_idle_timeouts: 10,
            nodelay: true,
            keepalive_secs: Some(5),
            max_payload_len: constants::MAX_PAYLOAD_LEN,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Audio path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: f64,
    pub sample_format: SampleKind,
    /// Playback ring capacity in bytes
    pub ring_buffer_bytes: usize,
    /// Largest tick served in one drain / captured into one packet
    pub max_frames_per_tick: usize,
    /// Fixed device buffer size, device default when unset
    pub io_buffer_frames: Option<u32>,
    /// Host side: ask the client to stream its microphone back
    pub use_mic: bool,
    /// Microphone stream rate, `sample_rate` when unset
    pub mic_sample_rate: Option<f64>,
    /// Microphone sample encoding, `sample_format` when unset
    pub mic_sample_format: Option<SampleKind>,
    pub output_device: Option<String>,
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: constants::DEFAULT_SAMPLE_RATE,
            sample_format: SampleKind::F32,
            ring_buffer_bytes: constants::RING_BUFFER_BYTES,
            max_frames_per_tick: constants::MAX_FRAMES_PER_TICK,
            io_buffer_frames: Some(constants::IO_BUFFER_FRAMES),
            use_mic: false,
            mic_sample_rate: None,
            mic_sample_format: None,
            output_device: None,
            input_device: None,
        }
    }
}

impl AudioConfig {
    /// The format this side streams
    pub fn stream_format(&self) -> AudioFormat {
        AudioFormat::mono(self.sample_rate, self.sample_format)
    }

    /// The format the host asks the client's microphone to stream back
    pub fn mic_format(&self) -> AudioFormat {
        AudioFormat::mono(
            self.mic_sample_rate.unwrap_or(self.sample_rate),
            self.mic_sample_format.unwrap_or(self.sample_format),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the default location); a missing file yields defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", constants::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        let mut formats = vec![audio.stream_format()];
        if audio.use_mic {
            formats.push(audio.mic_format());
        }
        for format in &formats {
            format.validate().map_err(|e| Error::Config(e.to_string()))?;
        }

        if audio.max_frames_per_tick == 0 {
            return Err(Error::Config("audio.max_frames_per_tick must be > 0".into()));
        }
        if audio.io_buffer_frames == Some(0) {
            return Err(Error::Config("audio.io_buffer_frames must be > 0".into()));
        }

        let tick_bytes = formats
            .iter()
            .map(|f| f.frames_to_bytes(audio.max_frames_per_tick))
            .max()
            .unwrap_or(0);
        if audio.ring_buffer_bytes < 4 * tick_bytes {
            return Err(Error::Config(format!(
                "audio.ring_buffer_bytes ({}) must hold at least 4 ticks ({} bytes)",
                audio.ring_buffer_bytes,
                4 * tick_bytes
            )));
        }

        let network = &self.network;
        if network.max_payload_len < crate::protocol::AudioFormat::SIZE * 2 {
            return Err(Error::Config(
                "network.max_payload_len is too small for a handshake".into(),
            ));
        }
        if network.connect_timeout_ms == 0 {
            return Err(Error::Config("network.connect_timeout_ms must be > 0".into()));
        }

        Ok(())
    }
}
