//! Playback relay: network PCM in, hardware render ticks out.
//!
//! The network thread calls [`AudioRelay::enqueue`] with every received
//! payload. The output device calls into an [`OutputRenderer`] on each
//! render tick, which drains exactly one tick's worth of bytes from the ring
//! (or silence) and writes it to every output channel.

use crate::audio::buffer::{create_shared_buffer, DrainOutcome, RingStats, SharedRingBuffer};
use crate::audio::sample::decode_sample;
use crate::error::AudioError;
use crate::protocol::{AudioFormat, SampleKind};

/// Ring-buffer-backed relay for one negotiated mono stream
#[derive(Clone)]
pub struct AudioRelay {
    ring: SharedRingBuffer,
    format: AudioFormat,
}

impl AudioRelay {
    /// Create a relay with a fresh ring of `capacity` bytes
    pub fn new(format: AudioFormat, capacity: usize) -> Self {
        Self::with_ring(format, create_shared_buffer(capacity))
    }

    pub fn with_ring(format: AudioFormat, ring: SharedRingBuffer) -> Self {
        Self { ring, format }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn ring(&self) -> &SharedRingBuffer {
        &self.ring
    }

    /// Producer side: copy one network payload into the ring
    pub fn enqueue(&self, pcm: &[u8]) {
        self.ring.enqueue(pcm);
    }

    /// Consumer side: fill `out` (a whole number of frames) from the ring
    pub fn drain(&self, out: &mut [u8]) -> DrainOutcome {
        debug_assert_eq!(out.len() % self.format.bytes_per_frame().max(1), 0);
        self.ring.drain(out)
    }

    /// Drain into the first channel buffer and copy it into the others,
    /// for devices that want one mono buffer per channel.
    pub fn render_channels(&self, channels: &mut [&mut [u8]]) -> DrainOutcome {
        let Some((first, rest)) = channels.split_first_mut() else {
            return DrainOutcome::Filled { skipped: 0 };
        };
        let outcome = self.drain(first);
        for channel in rest {
            let n = channel.len().min(first.len());
            channel[..n].copy_from_slice(&first[..n]);
        }
        outcome
    }

    pub fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}

/// Per-stream state owned by the output callback
pub struct OutputRenderer {
    relay: AudioRelay,
    kind: SampleKind,
    scratch: Vec<u8>,
    max_frames: usize,
    ticks: u64,
}

impl OutputRenderer {
    /// `max_frames` bounds the scratch buffer; larger device requests are
    /// served in several drains of at most `max_frames` frames.
    pub fn new(relay: AudioRelay, max_frames: usize) -> Result<Self, AudioError> {
        let format = *relay.format();
        let kind = format
            .sample_kind()
            .ok_or_else(|| AudioError::UnsupportedFormat(format!("{:?}", format)))?;
        let max_frames = max_frames.max(1);

        Ok(Self {
            relay,
            kind,
            scratch: vec![0u8; format.frames_to_bytes(max_frames)],
            max_frames,
            ticks: 0,
        })
    }

    pub fn relay(&self) -> &AudioRelay {
        &self.relay
    }

    /// Render one interleaved device buffer, duplicating the mono stream
    /// into all `channels`.
    pub fn render_interleaved(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let bpf = self.relay.format().bytes_per_frame();
        self.ticks += 1;

        for chunk in data.chunks_mut(self.max_frames * channels) {
            let frames = chunk.len() / channels;
            let pcm = &mut self.scratch[..frames * bpf];
            if let DrainOutcome::Underrun { available } = self.relay.drain(pcm) {
                tracing::trace!(frames, available, "render underrun");
            }

            for (frame, bytes) in chunk.chunks_exact_mut(channels).zip(pcm.chunks_exact(bpf)) {
                frame.fill(decode_sample(self.kind, bytes));
            }
            chunk[frames * channels..].fill(0.0);
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
