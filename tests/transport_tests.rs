//! Framed transport over real sockets

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use pcm_relay::network::{
    link, DisconnectReason, FramedTransport, TransportHandler, TransportOptions,
};
use pcm_relay::protocol::{AudioFormat, Handshake};
use pcm_relay::{config::NetworkConfig, Error};

#[derive(Default)]
struct Collect {
    handshakes: Vec<Handshake>,
    data: Vec<Vec<u8>>,
    terminated: Vec<DisconnectReason>,
}

impl TransportHandler for Collect {
    fn on_handshake(&mut self, handshake: Handshake) -> pcm_relay::Result<()> {
        self.handshakes.push(handshake);
        Ok(())
    }

    fn on_data(&mut self, pcm: &[u8]) -> pcm_relay::Result<()> {
        self.data.push(pcm.to_vec());
        Ok(())
    }

    fn on_terminated(&mut self, reason: &DisconnectReason) {
        self.terminated.push(reason.clone());
    }
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let config = NetworkConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let listener: TcpListener = link::listen(&config).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = link::connect(&addr.to_string(), &config).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[test]
fn frames_cross_a_tcp_connection() {
    let (a, b) = tcp_pair();
    let sender = FramedTransport::new(a, TransportOptions::default())
        .unwrap()
        .sender();
    let (mut reader, _) = FramedTransport::new(b, TransportOptions::default())
        .unwrap()
        .split();

    let receiver = thread::spawn(move || {
        let mut collect = Collect::default();
        let stats = reader.receive_loop(&mut collect).unwrap();
        (collect, stats)
    });

    let handshake = Handshake::new(AudioFormat::mono_f32(48000.0), None);
    sender.send_handshake(&handshake).unwrap();
    let pcm: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    for chunk in pcm.chunks(1000) {
        sender.send_data(chunk).unwrap();
    }
    sender.close();

    let (collect, stats) = receiver.join().unwrap();
    assert_eq!(collect.handshakes, vec![handshake]);
    assert_eq!(collect.data.concat(), pcm);
    assert_eq!(stats.data_frames, 5);
    assert_eq!(collect.terminated, vec![DisconnectReason::PeerClosed]);
}

#[test]
fn local_close_wakes_reader_and_fails_later_sends() {
    let (a, _b) = tcp_pair();
    let (mut reader, sender) = FramedTransport::new(a, TransportOptions::default())
        .unwrap()
        .split();

    let handle = thread::spawn(move || {
        let mut collect = Collect::default();
        let result = reader.receive_loop(&mut collect);
        (result.is_ok(), collect.terminated)
    });

    thread::sleep(Duration::from_millis(50));
    sender.close();

    let (ok, terminated) = handle.join().unwrap();
    assert!(ok);
    assert_eq!(terminated, vec![DisconnectReason::PeerClosed]);
    assert!(matches!(
        sender.send_data(&[1, 2, 3]),
        Err(Error::Network(pcm_relay::error::NetworkError::Closed))
    ));
}

#[cfg(unix)]
#[test]
fn frames_cross_a_unix_socket() {
    use std::os::unix::net::UnixStream;

    let (a, b) = UnixStream::pair().unwrap();
    let sender = FramedTransport::new(a, TransportOptions::default())
        .unwrap()
        .sender();
    let (mut reader, _) = FramedTransport::new(b, TransportOptions::default())
        .unwrap()
        .split();

    let handshake = Handshake::new(
        AudioFormat::mono_i16(16000.0),
        Some(AudioFormat::mono_i16(16000.0)),
    );
    sender.send_handshake(&handshake).unwrap();
    sender.send_data(&[]).unwrap();
    sender.send_data(&[42]).unwrap();
    sender.close();

    let mut collect = Collect::default();
    reader.receive_loop(&mut collect).unwrap();
    assert_eq!(collect.handshakes, vec![handshake]);
    assert_eq!(collect.data, vec![Vec::<u8>::new(), vec![42u8]]);
    assert_eq!(collect.terminated.len(), 1);
}
