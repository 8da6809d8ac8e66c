//! Framed stream transport
//!
//! Turns a connected byte stream into typed events (handshake, data,
//! terminated) and outbound audio into frames. The read half runs a
//! blocking receive loop on the network thread; the write half is a
//! cloneable [`FrameSender`] shared between the handshake path and the
//! capture callback.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::capture::PacketSink;
use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, ProtocolError};
use crate::protocol::{
    wire_len, AudioFormat, Handshake, PacketHeader, PacketTag, HEADER_LEN, MAGIC,
};

/// A connected, bidirectional byte stream
pub trait Connection: Read + Write + Send + 'static {
    /// Another handle to the same stream
    fn try_clone_stream(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Shut down both directions, waking any blocked reader
    fn close(&self) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Receive/send tuning
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Declared lengths above this are treated as desynchronization
    pub max_payload_len: usize,
    /// Consecutive read (or write) timeouts tolerated before the peer is
    /// considered dead. Zero disables the limit.
    pub max_idle_timeouts: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_payload_len: 1024 * 1024,
            max_idle_timeouts: 10,
        }
    }
}

impl From<&NetworkConfig> for TransportOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_payload_len: config.max_payload_len,
            max_idle_timeouts: config.max_idle_timeouts,
        }
    }
}

/// Why a receive loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The peer closed the stream (or it was shut down locally)
    PeerClosed,
    /// The loop was asked to stop
    Stopped,
    /// Fatal read, timeout or handler failure
    Failed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::Stopped => write!(f, "stopped"),
            DisconnectReason::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Callbacks driven by [`FrameReader::receive_loop`]
pub trait TransportHandler {
    fn on_handshake(&mut self, handshake: Handshake) -> crate::Result<()>;

    /// `pcm` borrows the reader's reusable payload buffer
    fn on_data(&mut self, pcm: &[u8]) -> crate::Result<()>;

    /// Called exactly once when the loop exits, whatever the cause
    fn on_terminated(&mut self, reason: &DisconnectReason);
}

/// Receive loop counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiveStats {
    pub frames: u64,
    pub handshakes: u64,
    pub data_frames: u64,
    pub data_bytes: u64,
    pub resyncs: u64,
    pub bytes_skipped: u64,
    pub malformed: u64,
    pub bytes_read: u64,
}

/// Reasons the receive loop stops reading
enum Halt {
    Closed,
    Stopped,
    Fatal(Error),
}

/// Exact-count reads over a stream, with a small pushback queue used when
/// a rejected header has to be rescanned.
struct ByteSource<R> {
    reader: R,
    pending: VecDeque<u8>,
    max_idle_timeouts: u32,
    idle_timeouts: u32,
    bytes_read: u64,
    running: Option<Arc<AtomicBool>>,
}

impl<R: Read> ByteSource<R> {
    fn is_stopped(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn push_back(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.pending.push_front(b);
        }
    }

    fn next_byte(&mut self) -> Result<u8, Halt> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(b);
        }
        let mut byte = [0u8; 1];
        self.read_stream(&mut byte)?;
        Ok(byte[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Halt> {
        let from_pending = self.pending.len().min(buf.len());
        for (slot, b) in buf.iter_mut().zip(self.pending.drain(..from_pending)) {
            *slot = b;
        }
        self.read_stream(&mut buf[from_pending..])
    }

    /// Loop on partial reads until `buf` is full or the stream ends
    fn read_stream(&mut self, buf: &mut [u8]) -> Result<(), Halt> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(Halt::Closed),
                Ok(n) => {
                    filled += n;
                    self.bytes_read += n as u64;
                    self.idle_timeouts = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    if self.is_stopped() {
                        return Err(Halt::Stopped);
                    }
                    self.idle_timeouts += 1;
                    if self.max_idle_timeouts > 0 && self.idle_timeouts >= self.max_idle_timeouts {
                        return Err(Halt::Fatal(
                            NetworkError::Timeout(self.idle_timeouts).into(),
                        ));
                    }
                    tracing::trace!(idle = self.idle_timeouts, "read timeout");
                }
                Err(e) if is_closed(&e) => return Err(Halt::Closed),
                Err(e) => {
                    return Err(Halt::Fatal(NetworkError::ReceiveFailed(e.to_string()).into()))
                }
            }
        }
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Read half: parses frames and drives a [`TransportHandler`]
pub struct FrameReader<R> {
    source: ByteSource<R>,
    max_payload_len: usize,
    /// Reused for every payload
    payload: Vec<u8>,
    stats: ReceiveStats,
    last_report: Instant,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, options: TransportOptions) -> Self {
        Self {
            source: ByteSource {
                reader,
                pending: VecDeque::with_capacity(HEADER_LEN),
                max_idle_timeouts: options.max_idle_timeouts,
                idle_timeouts: 0,
                bytes_read: 0,
                running: None,
            },
            max_payload_len: options.max_payload_len,
            payload: Vec::new(),
            stats: ReceiveStats::default(),
            last_report: Instant::now(),
        }
    }

    /// Stop the loop (at the next read timeout) once `running` is cleared
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.source.running = Some(running);
        self
    }

    /// Treat every read timeout as transient, for a side that expects no
    /// inbound traffic. A dead peer is then left to TCP keepalive.
    pub fn without_idle_limit(mut self) -> Self {
        self.source.max_idle_timeouts = 0;
        self
    }

    pub fn stats(&self) -> ReceiveStats {
        let mut stats = self.stats.clone();
        stats.bytes_read = self.source.bytes_read;
        stats
    }

    /// Read frames until the stream ends, dispatching each to `handler`.
    ///
    /// Closure and stop requests return `Ok`; timeouts, read errors and
    /// handler errors return `Err`. `on_terminated` fires once either way.
    pub fn receive_loop<H: TransportHandler>(
        &mut self,
        handler: &mut H,
    ) -> crate::Result<ReceiveStats> {
        let halt = loop {
            if self.source.is_stopped() {
                break Halt::Stopped;
            }
            if let Err(halt) = self.next_frame(handler) {
                break halt;
            }
            self.maybe_report();
        };

        let stats = self.stats();
        let (reason, result) = match halt {
            Halt::Closed => (DisconnectReason::PeerClosed, Ok(stats)),
            Halt::Stopped => (DisconnectReason::Stopped, Ok(stats)),
            Halt::Fatal(e) => (DisconnectReason::Failed(e.to_string()), Err(e)),
        };
        tracing::info!(%reason, frames = self.stats.frames, "receive loop finished");
        handler.on_terminated(&reason);
        result
    }

    fn next_frame<H: TransportHandler>(&mut self, handler: &mut H) -> Result<(), Halt> {
        let header = self.read_header()?;
        let len = header.len as usize;
        if self.payload.len() < len {
            self.payload.resize(len, 0);
        }
        self.source.read_exact(&mut self.payload[..len])?;
        self.stats.frames += 1;
        let payload = &self.payload[..len];

        match header.tag {
            PacketTag::Data => {
                self.stats.data_frames += 1;
                self.stats.data_bytes += len as u64;
                tracing::trace!(len, "data frame");
                handler.on_data(payload).map_err(Halt::Fatal)
            }
            tag => {
                let expected = match tag {
                    PacketTag::HandshakeWithMic => 2 * AudioFormat::SIZE,
                    _ => AudioFormat::SIZE,
                };
                if len != expected {
                    self.stats.malformed += 1;
                    tracing::warn!(?tag, len, expected, "dropping handshake with bad length");
                    return Ok(());
                }
                match Handshake::decode(tag, payload) {
                    Ok(handshake) => {
                        self.stats.handshakes += 1;
                        tracing::debug!(?tag, "handshake frame");
                        handler.on_handshake(handshake).map_err(Halt::Fatal)
                    }
                    Err(e) => {
                        self.stats.malformed += 1;
                        tracing::warn!("dropping undecodable handshake: {}", e);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Read the next acceptable header, resynchronizing past anything that
    /// does not look like one.
    fn read_header(&mut self) -> Result<PacketHeader, Halt> {
        let mut raw = [0u8; HEADER_LEN];
        self.source.read_exact(&mut raw)?;

        loop {
            match self.classify(&raw) {
                Ok(header) => return Ok(header),
                Err(e) => {
                    self.stats.resyncs += 1;
                    tracing::debug!("header rejected ({}), resynchronizing", e);
                    // Everything after the first byte may still hold the magic
                    self.source.push_back(&raw[1..]);
                    let skipped = self.resync(&mut raw)?;
                    self.stats.bytes_skipped += skipped;
                    if skipped > 1 {
                        tracing::warn!(skipped, "skipped bytes to regain frame alignment");
                    }
                }
            }
        }
    }

    fn classify(&self, raw: &[u8; HEADER_LEN]) -> Result<PacketHeader, ProtocolError> {
        let header = PacketHeader::parse(raw)?;
        if header.len as usize > self.max_payload_len {
            return Err(ProtocolError::PayloadTooLarge(header.len as usize));
        }
        Ok(header)
    }

    /// Scan for the two magic bytes, then fill in the remaining six header
    /// bytes. Returns how many bytes were discarded, counting the first
    /// byte of the rejected header.
    fn resync(&mut self, raw: &mut [u8; HEADER_LEN]) -> Result<u64, Halt> {
        let mut skipped = 1u64;
        let mut byte = self.source.next_byte()?;
        loop {
            if byte != MAGIC[0] {
                skipped += 1;
                byte = self.source.next_byte()?;
                continue;
            }
            let next = self.source.next_byte()?;
            if next == MAGIC[1] {
                break;
            }
            skipped += 1;
            // A repeated first magic byte is a new candidate
            byte = next;
        }

        raw[..2].copy_from_slice(&MAGIC);
        self.source.read_exact(&mut raw[2..])?;
        Ok(skipped)
    }

    fn maybe_report(&mut self) {
        if self.last_report.elapsed().as_secs() >= 10 {
            tracing::debug!(
                frames = self.stats.frames,
                data_bytes = self.stats.data_bytes,
                resyncs = self.stats.resyncs,
                "receive stats"
            );
            self.last_report = Instant::now();
        }
    }
}

/// Send counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SendStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

struct WriterState {
    writer: Box<dyn Write + Send>,
    shutdown: Option<Box<dyn FnMut() + Send>>,
    closed: bool,
    max_retries: u32,
    stats: SendStats,
}

impl WriterState {
    /// Header and payload go out with vectored writes; partial writes and
    /// timeouts are retried until the frame is complete.
    fn write_frame(&mut self, header: &[u8; HEADER_LEN], payload: &[u8]) -> io::Result<()> {
        let total = HEADER_LEN + payload.len();
        let mut written = 0;
        let mut retries = 0;

        while written < total {
            let result = if written < HEADER_LEN {
                self.writer.write_vectored(&[
                    IoSlice::new(&header[written..]),
                    IoSlice::new(payload),
                ])
            } else {
                self.writer.write(&payload[written - HEADER_LEN..])
            };

            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => {
                    retries += 1;
                    if self.max_retries > 0 && retries >= self.max_retries {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.writer.flush()
    }

    fn fail(&mut self) {
        self.closed = true;
        if let Some(mut shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}

/// Write half. Clones share one writer; a frame is written entirely while
/// the lock is held, so frames from different threads never interleave.
#[derive(Clone)]
pub struct FrameSender {
    inner: Arc<Mutex<WriterState>>,
}

impl FrameSender {
    pub fn new<W: Write + Send + 'static>(writer: W, options: TransportOptions) -> Self {
        Self::build(Box::new(writer), None, options)
    }

    /// `shutdown` runs once, on the first write failure or [`close`](Self::close)
    pub fn with_shutdown<W, F>(writer: W, options: TransportOptions, shutdown: F) -> Self
    where
        W: Write + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        Self::build(Box::new(writer), Some(Box::new(shutdown)), options)
    }

    fn build(
        writer: Box<dyn Write + Send>,
        shutdown: Option<Box<dyn FnMut() + Send>>,
        options: TransportOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterState {
                writer,
                shutdown,
                closed: false,
                max_retries: options.max_idle_timeouts,
                stats: SendStats::default(),
            })),
        }
    }

    pub fn send_handshake(&self, handshake: &Handshake) -> crate::Result<()> {
        tracing::debug!(has_mic = handshake.has_mic(), "sending handshake");
        self.send_frame(handshake.tag(), &handshake.encode_payload())
    }

    pub fn send_data(&self, pcm: &[u8]) -> crate::Result<()> {
        self.send_frame(PacketTag::Data, pcm)
    }

    fn send_frame(&self, tag: PacketTag, payload: &[u8]) -> crate::Result<()> {
        let len = wire_len(payload.len())?;
        let header = PacketHeader::new(tag, len).encode();

        let mut state = self.inner.lock();
        if state.closed {
            return Err(NetworkError::Closed.into());
        }

        match state.write_frame(&header, payload) {
            Ok(()) => {
                state.stats.frames_sent += 1;
                state.stats.bytes_sent += (HEADER_LEN + payload.len()) as u64;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Frame write failed, closing connection: {}", e);
                state.fail();
                Err(NetworkError::SendFailed(e.to_string()).into())
            }
        }
    }

    /// Shut the connection down; later sends fail with `Closed`
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if !state.closed {
            state.fail();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> SendStats {
        self.inner.lock().stats.clone()
    }
}

impl PacketSink for FrameSender {
    fn packet_ready(&mut self, pcm: &[u8]) {
        if let Err(e) = self.send_data(pcm) {
            tracing::trace!("dropping captured packet: {}", e);
        }
    }
}

/// A connection split into its read loop and shared sender
pub struct FramedTransport<C> {
    reader: FrameReader<C>,
    sender: FrameSender,
}

impl<C: Connection> FramedTransport<C> {
    pub fn new(conn: C, options: TransportOptions) -> crate::Result<Self> {
        let read_half = conn.try_clone_stream()?;
        let closer = conn.try_clone_stream()?;
        let sender = FrameSender::with_shutdown(conn, options, move || {
            if let Err(e) = closer.close() {
                tracing::debug!("shutdown after write failure: {}", e);
            }
        });

        Ok(Self {
            reader: FrameReader::new(read_half, options),
            sender,
        })
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn split(self) -> (FrameReader<C>, FrameSender) {
        (self.reader, self.sender)
    }
}
