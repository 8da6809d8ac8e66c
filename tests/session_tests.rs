//! End-to-end sessions over loopback TCP with a scripted device backend

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pcm_relay::audio::capture::{AudioCapture, BoxedSink};
use pcm_relay::audio::device::{AudioBackend, StreamHandle};
use pcm_relay::audio::playback::OutputRenderer;
use pcm_relay::config::AppConfig;
use pcm_relay::error::AudioError;
use pcm_relay::network::DisconnectReason;
use pcm_relay::protocol::{
    encode_frame, AudioFormat, Handshake, PacketHeader, PacketTag, SampleKind, HEADER_LEN,
};
use pcm_relay::session::{PeerSession, Role, SessionEvent};

#[derive(Default)]
struct Devices {
    renderers: Vec<OutputRenderer>,
    captures: Vec<AudioCapture<BoxedSink>>,
    stopped: Vec<&'static str>,
    /// Events already published when each stream was stopped
    events_at_stop: Vec<usize>,
}

/// Keeps the callbacks instead of running them, so tests can tick by hand
#[derive(Clone, Default)]
struct FakeBackend {
    devices: Arc<Mutex<Devices>>,
    events: Option<Receiver<SessionEvent>>,
}

impl FakeBackend {
    fn handle(&self, kind: &'static str) -> Box<dyn StreamHandle> {
        Box::new(FakeHandle {
            kind,
            devices: self.devices.clone(),
            events: self.events.clone(),
            running: true,
        })
    }
}

impl AudioBackend for FakeBackend {
    fn start_playback(
        &mut self,
        renderer: OutputRenderer,
    ) -> Result<Box<dyn StreamHandle>, AudioError> {
        self.devices.lock().renderers.push(renderer);
        Ok(self.handle("playback"))
    }

    fn start_capture(
        &mut self,
        capture: AudioCapture<BoxedSink>,
    ) -> Result<Box<dyn StreamHandle>, AudioError> {
        self.devices.lock().captures.push(capture);
        Ok(self.handle("capture"))
    }
}

struct FakeHandle {
    kind: &'static str,
    devices: Arc<Mutex<Devices>>,
    events: Option<Receiver<SessionEvent>>,
    running: bool,
}

impl StreamHandle for FakeHandle {
    fn stop(&mut self) {
        if self.running {
            self.running = false;
            let mut devices = self.devices.lock();
            devices.stopped.push(self.kind);
            let published = self.events.as_ref().map(|rx| rx.len()).unwrap_or(0);
            devices.events_at_stop.push(published);
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.audio.ring_buffer_bytes = 64 * 1024;
    config.audio.max_frames_per_tick = 256;
    config
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn read_frame(stream: &mut TcpStream) -> (PacketTag, Vec<u8>) {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).unwrap();
    let header = PacketHeader::parse(&raw).unwrap();
    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload).unwrap();
    (header.tag, payload)
}

fn buffered_in(devices: &Arc<Mutex<Devices>>, index: usize) -> Option<usize> {
    devices
        .lock()
        .renderers
        .get(index)
        .map(|r| r.relay().buffered())
}

/// Bind a listener and run one session of `role` on the accepted stream
fn spawn_listening_session(
    role: Role,
    config: AppConfig,
    backend: FakeBackend,
    events: crossbeam_channel::Sender<SessionEvent>,
) -> (
    std::net::SocketAddr,
    thread::JoinHandle<pcm_relay::Result<pcm_relay::session::SessionSummary>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut session = PeerSession::new(role, &config, backend).with_events(events);
        session.run(stream, &peer.to_string())
    });
    (addr, handle)
}

#[test]
fn client_plays_host_stream() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let backend = FakeBackend {
        events: Some(rx.clone()),
        ..Default::default()
    };
    let devices = backend.devices.clone();
    let (addr, session) = spawn_listening_session(Role::Client, test_config(), backend, tx);

    let mut host = TcpStream::connect(addr).unwrap();
    let format = AudioFormat::mono_i16(48000.0);
    host.write_all(&encode_frame(PacketTag::Handshake, &format.to_bytes()).unwrap())
        .unwrap();
    let pcm: Vec<u8> = (0..64i16).flat_map(|s| (s * 100).to_le_bytes()).collect();
    host.write_all(&encode_frame(PacketTag::Data, &pcm).unwrap()).unwrap();

    wait_for("pcm in the ring", || buffered_in(&devices, 0) == Some(128));
    {
        let mut devices = devices.lock();
        let mut out = [0f32; 128];
        devices.renderers[0].render_interleaved(&mut out, 2);
        for (i, frame) in out.chunks_exact(2).enumerate() {
            let expected = (i as i16 * 100) as f32 / 32768.0;
            assert_eq!(frame, [expected, expected]);
        }
    }

    drop(host);
    let summary = session.join().unwrap().unwrap();
    assert_eq!(summary.reason, DisconnectReason::PeerClosed);
    assert_eq!(summary.negotiated, Some((format, None)));
    assert_eq!(summary.received.data_bytes, 128);
    assert_eq!(summary.ring.unwrap().underruns, 0);

    let events: Vec<SessionEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SessionEvent::Connected { .. }));
    assert!(matches!(
        events[1],
        SessionEvent::FormatNegotiated { has_mic: false, .. }
    ));
    assert!(matches!(
        events[2],
        SessionEvent::Disconnected {
            reason: DisconnectReason::PeerClosed,
            ..
        }
    ));

    // Playback stopped before the disconnect went out
    let devices = devices.lock();
    assert_eq!(devices.stopped, vec!["playback"]);
    assert_eq!(devices.events_at_stop, vec![2]);
}

#[test]
fn host_streams_capture_and_plays_mic() {
    let mut config = test_config();
    config.audio.use_mic = true;
    config.audio.sample_rate = 16000.0;
    config.audio.sample_format = SampleKind::I16;
    config.audio.mic_sample_rate = Some(8000.0);
    config.audio.mic_sample_format = Some(SampleKind::F32);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = FakeBackend::default();
    let devices = backend.devices.clone();
    let (tx, rx) = crossbeam_channel::unbounded();

    let host = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut session = PeerSession::new(Role::Host, &config, backend).with_events(tx);
        session.run(stream, &addr.to_string())
    });

    let (mut client, _) = listener.accept().unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let (tag, payload) = read_frame(&mut client);
    assert_eq!(tag, PacketTag::HandshakeWithMic);
    let handshake = Handshake::decode(tag, &payload).unwrap();
    assert_eq!(handshake.output, AudioFormat::mono_i16(16000.0));
    assert_eq!(handshake.input, Some(AudioFormat::mono_f32(8000.0)));

    // The host captures in its stream format and plays the mic format
    wait_for("host capture", || devices.lock().captures.len() == 1);
    {
        let devices = devices.lock();
        assert_eq!(devices.captures[0].format(), &AudioFormat::mono_i16(16000.0));
        assert_eq!(devices.renderers[0].relay().format(), &AudioFormat::mono_f32(8000.0));
    }

    // One capture tick on the host turns into one data frame
    devices.lock().captures[0].on_tick(4, |buf| {
        buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        Some(buf.len())
    });
    assert_eq!(
        read_frame(&mut client),
        (PacketTag::Data, vec![1, 2, 3, 4, 5, 6, 7, 8])
    );

    // Microphone audio flows back into the host's relay
    client
        .write_all(&encode_frame(PacketTag::Data, &[9u8; 32]).unwrap())
        .unwrap();
    wait_for("mic pcm in the host ring", || buffered_in(&devices, 0) == Some(32));

    drop(client);
    let summary = host.join().unwrap().unwrap();
    assert_eq!(summary.role, Role::Host);
    assert_eq!(summary.sent.frames_sent, 2);
    assert_eq!(summary.received.data_bytes, 32);

    let negotiated = rx
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::FormatNegotiated { has_mic: true, .. }))
        .count();
    assert_eq!(negotiated, 1);

    let mut stopped = devices.lock().stopped.clone();
    stopped.sort();
    assert_eq!(stopped, vec!["capture", "playback"]);
}

#[test]
fn client_resyncs_and_reconfigures() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let backend = FakeBackend::default();
    let devices = backend.devices.clone();
    let (addr, session) = spawn_listening_session(Role::Client, test_config(), backend, tx);

    let first = AudioFormat::mono_f32(48000.0);
    let second = AudioFormat::mono_i16(44100.0);

    let mut host = TcpStream::connect(addr).unwrap();
    host.write_all(&[0x00, 0x13, 0x69, 0x42, 0x99]).unwrap();
    host.write_all(&encode_frame(PacketTag::Handshake, &first.to_bytes()).unwrap())
        .unwrap();
    host.write_all(&encode_frame(PacketTag::Handshake, &first.to_bytes()).unwrap())
        .unwrap();
    host.write_all(&encode_frame(PacketTag::Data, &[0u8; 16]).unwrap())
        .unwrap();
    host.write_all(&encode_frame(PacketTag::Handshake, &second.to_bytes()).unwrap())
        .unwrap();
    host.write_all(&encode_frame(PacketTag::Data, &[1u8; 8]).unwrap())
        .unwrap();

    wait_for("second relay filled", || buffered_in(&devices, 1) == Some(8));
    assert_eq!(devices.lock().renderers[1].relay().format(), &second);

    drop(host);
    let summary = session.join().unwrap().unwrap();
    assert_eq!(summary.received.resyncs, 1);
    assert_eq!(summary.received.bytes_skipped, 5);
    assert_eq!(summary.received.handshakes, 3);
    assert_eq!(summary.negotiated, Some((second, None)));

    let negotiated = rx
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::FormatNegotiated { .. }))
        .count();
    assert_eq!(negotiated, 2);
    assert_eq!(devices.lock().renderers.len(), 2);
    assert_eq!(devices.lock().stopped, vec!["playback", "playback"]);
}

#[test]
fn quiet_peer_keeps_host_without_mic_connected() {
    let mut config = test_config();
    config.network.max_idle_timeouts = 3;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();

    let host = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut session =
            PeerSession::new(Role::Host, &config, FakeBackend::default()).with_events(tx);
        session.run(stream, &addr.to_string())
    });

    let (mut client, _) = listener.accept().unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (tag, _) = read_frame(&mut client);
    assert_eq!(tag, PacketTag::Handshake);

    // Well past 3 read timeouts of 50 ms with nothing sent back
    thread::sleep(Duration::from_millis(500));
    assert!(!host.is_finished());
    assert!(!rx
        .try_iter()
        .any(|e| matches!(e, SessionEvent::Disconnected { .. })));

    drop(client);
    let summary = host.join().unwrap().unwrap();
    assert_eq!(summary.reason, DisconnectReason::PeerClosed);
    assert_eq!(summary.received.frames, 0);
}

#[test]
fn vanished_peer_disconnects_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();

    let host = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut session =
            PeerSession::new(Role::Host, &test_config(), FakeBackend::default()).with_events(tx);
        session.run(stream, &addr.to_string())
    });

    let (client, _) = listener.accept().unwrap();
    drop(client);

    // Depending on timing the handshake write or the first read sees the
    // closure; either way the session ends exactly once.
    let _ = host.join().unwrap();
    let disconnects = rx
        .try_iter()
        .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}
