//! Peer session orchestration
//!
//! One session per connected stream. The receive loop runs on the calling
//! thread; device callbacks run on the backend's threads and reach the
//! network only through the ring buffer (playback) or the shared
//! [`FrameSender`] (capture).

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::buffer::RingStats;
use crate::audio::capture::{AudioCapture, BoxedSink, PacketSink};
use crate::audio::device::{AudioBackend, StreamHandle};
use crate::audio::playback::{AudioRelay, OutputRenderer};
use crate::config::{AppConfig, AudioConfig};
use crate::network::transport::{
    Connection, DisconnectReason, FrameSender, FramedTransport, ReceiveStats, SendStats,
    TransportHandler, TransportOptions,
};
use crate::protocol::{AudioFormat, Handshake};

/// Which end of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sends the handshake and streams its audio to the peer
    Host,
    /// Waits for the handshake and plays what the host streams
    Client,
}

/// Lifecycle events for whatever displays connection status
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        session_id: Uuid,
        peer: String,
        at: DateTime<Utc>,
    },
    FormatNegotiated {
        session_id: Uuid,
        output: AudioFormat,
        input: Option<AudioFormat>,
        has_mic: bool,
        at: DateTime<Utc>,
    },
    Disconnected {
        session_id: Uuid,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    },
}

/// What a finished session did
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub role: Role,
    pub peer: String,
    pub reason: DisconnectReason,
    pub negotiated: Option<(AudioFormat, Option<AudioFormat>)>,
    pub received: ReceiveStats,
    pub sent: SendStats,
    pub ring: Option<RingStats>,
}

/// Runs sessions for one role over whatever connections it is handed
pub struct PeerSession<B> {
    role: Role,
    audio: AudioConfig,
    transport: TransportOptions,
    backend: B,
    events: Option<Sender<SessionEvent>>,
    running: Option<Arc<AtomicBool>>,
}

impl<B: AudioBackend> PeerSession<B> {
    pub fn new(role: Role, config: &AppConfig, backend: B) -> Self {
        Self {
            role,
            audio: config.audio.clone(),
            transport: TransportOptions::from(&config.network),
            backend,
            events: None,
            running: None,
        }
    }

    /// Publish lifecycle events on `tx`
    pub fn with_events(mut self, tx: Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// End the receive loop (at its next read timeout) when `running` clears
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Serve one connection until it closes or fails.
    pub fn run<C: Connection>(&mut self, conn: C, peer: &str) -> crate::Result<SessionSummary> {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("session", id = %session_id, peer, role = ?self.role);
        let _enter = span.enter();

        let transport = FramedTransport::new(conn, self.transport)?;
        let (reader, sender) = transport.split();
        let mut reader = match &self.running {
            Some(running) => reader.with_running(running.clone()),
            None => reader,
        };
        // A host without a microphone never hears from its peer
        if self.role == Role::Host && !self.audio.use_mic {
            reader = reader.without_idle_limit();
        }

        let mut state = SessionState {
            session_id,
            role: self.role,
            audio: &self.audio,
            backend: &mut self.backend,
            sender: sender.clone(),
            events: self.events.clone(),
            negotiated: None,
            relay: None,
            playback: None,
            capture: None,
            ring_stats: None,
            reason: None,
        };

        tracing::info!("Session started");
        state.emit(SessionEvent::Connected {
            session_id,
            peer: peer.to_string(),
            at: Utc::now(),
        });

        if self.role == Role::Host {
            let handshake = Handshake::new(
                state.audio.stream_format(),
                state.audio.use_mic.then(|| state.audio.mic_format()),
            );
            if let Err(e) = state.open(handshake) {
                state.on_terminated(&DisconnectReason::Failed(e.to_string()));
                sender.close();
                return Err(e);
            }
        }

        let result = reader.receive_loop(&mut state);
        sender.close();

        let received = match result {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("Session ended with error: {}", e);
                return Err(e);
            }
        };

        let summary = SessionSummary {
            session_id,
            role: self.role,
            peer: peer.to_string(),
            reason: state.reason.take().unwrap_or(DisconnectReason::PeerClosed),
            negotiated: state.negotiated.map(|h| (h.output, h.input)),
            received,
            sent: sender.stats(),
            ring: state.ring_stats.take(),
        };
        tracing::info!(
            frames = summary.received.frames,
            resyncs = summary.received.resyncs,
            sent = summary.sent.frames_sent,
            "Session finished: {}",
            summary.reason
        );
        Ok(summary)
    }
}

/// Per-connection state; the receive loop's handler
struct SessionState<'a, B> {
    session_id: Uuid,
    role: Role,
    audio: &'a AudioConfig,
    backend: &'a mut B,
    sender: FrameSender,
    events: Option<Sender<SessionEvent>>,
    negotiated: Option<Handshake>,
    relay: Option<AudioRelay>,
    playback: Option<Box<dyn StreamHandle>>,
    capture: Option<Box<dyn StreamHandle>>,
    ring_stats: Option<RingStats>,
    reason: Option<DisconnectReason>,
}

impl<B: AudioBackend> SessionState<'_, B> {
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Host: announce the formats, then start the local streams
    fn open(&mut self, handshake: Handshake) -> crate::Result<()> {
        self.sender.send_handshake(&handshake)?;
        self.configure(handshake)
    }

    /// (Re)start device streams for a negotiated format pair
    fn configure(&mut self, handshake: Handshake) -> crate::Result<()> {
        handshake.output.validate()?;
        if let Some(input) = &handshake.input {
            input.validate()?;
        }
        self.stop_streams();

        // The host plays the peer's microphone and captures what it streams;
        // the client does the reverse.
        let (play, capture) = match self.role {
            Role::Host => (handshake.input, Some(handshake.output)),
            Role::Client => (Some(handshake.output), handshake.input),
        };

        if let Some(format) = play {
            let relay = AudioRelay::new(format, self.audio.ring_buffer_bytes);
            let renderer = OutputRenderer::new(relay.clone(), self.audio.max_frames_per_tick)?;
            self.playback = Some(self.backend.start_playback(renderer)?);
            self.relay = Some(relay);
        }

        if let Some(format) = capture {
            let mut sender = self.sender.clone();
            let sink: BoxedSink = Box::new(move |pcm: &[u8]| sender.packet_ready(pcm));
            let capture = AudioCapture::new(format, self.audio.max_frames_per_tick, sink)?;
            self.capture = Some(self.backend.start_capture(capture)?);
        }

        tracing::info!(
            sample_rate = handshake.output.sample_rate,
            has_mic = handshake.has_mic(),
            "Format negotiated"
        );
        self.negotiated = Some(handshake);
        self.emit(SessionEvent::FormatNegotiated {
            session_id: self.session_id,
            output: handshake.output,
            input: handshake.input,
            has_mic: handshake.has_mic(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Callbacks stop before the ring they read from is released
    fn stop_streams(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(relay) = self.relay.take() {
            self.ring_stats = Some(relay.stats());
        }
    }
}

impl<B: AudioBackend> TransportHandler for SessionState<'_, B> {
    fn on_handshake(&mut self, handshake: Handshake) -> crate::Result<()> {
        if self.role == Role::Host {
            tracing::warn!("Ignoring handshake sent to the host side");
            return Ok(());
        }
        if self.negotiated == Some(handshake) {
            tracing::debug!("Repeated handshake with unchanged formats");
            return Ok(());
        }
        if self.negotiated.is_some() {
            tracing::info!("Formats changed, reconfiguring devices");
        }
        self.configure(handshake)
    }

    fn on_data(&mut self, pcm: &[u8]) -> crate::Result<()> {
        match &self.relay {
            Some(relay) => relay.enqueue(pcm),
            None => tracing::trace!(len = pcm.len(), "data with no playback path, dropped"),
        }
        Ok(())
    }

    fn on_terminated(&mut self, reason: &DisconnectReason) {
        self.stop_streams();
        if let Some(stats) = &self.ring_stats {
            tracing::debug!(
                underruns = stats.underruns,
                overflows = stats.overflows,
                drift_skips = stats.drift_skips,
                "Ring stats"
            );
        }
        tracing::info!("Disconnected: {}", reason);
        self.reason = Some(reason.clone());
        self.emit(SessionEvent::Disconnected {
            session_id: self.session_id,
            reason: reason.clone(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = SessionEvent::Disconnected {
            session_id: Uuid::nil(),
            reason: DisconnectReason::Failed("write failed".into()),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "disconnected");
        assert_eq!(json["reason"]["kind"], "failed");
        assert_eq!(json["reason"]["detail"], "write failed");
    }

    #[test]
    fn test_negotiated_event_carries_formats() {
        let output = AudioFormat::mono_f32(48000.0);
        let event = SessionEvent::FormatNegotiated {
            session_id: Uuid::nil(),
            output,
            input: None,
            has_mic: false,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "format_negotiated");
        assert_eq!(json["output"]["sample_rate"], 48000.0);
        assert_eq!(json["has_mic"], false);
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"host\"");
        let role: Role = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(role, Role::Client);
    }
}
