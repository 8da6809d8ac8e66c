//! Capture forwarding: hardware capture ticks in, PCM packets out.
//!
//! Each tick renders exactly one buffer of frames into a single reusable
//! buffer and hands it synchronously to the registered [`PacketSink`]. There
//! is no queue in between; back-pressure belongs to the sink.

use serde::Serialize;

use crate::audio::sample::encode_sample;
use crate::error::AudioError;
use crate::protocol::{AudioFormat, SampleKind};

/// Receiver of captured PCM packets
pub trait PacketSink: Send {
    fn packet_ready(&mut self, pcm: &[u8]);
}

impl<F> PacketSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn packet_ready(&mut self, pcm: &[u8]) {
        self(pcm)
    }
}

/// Type-erased sink handed across the device boundary
pub type BoxedSink = Box<dyn FnMut(&[u8]) + Send>;

/// Capture statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub ticks: u64,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub dropped_ticks: u64,
}

/// Capture state owned by the input callback
pub struct AudioCapture<S: PacketSink> {
    format: AudioFormat,
    kind: SampleKind,
    /// Reused on every tick, sized for `max_frames`
    buffer: Vec<u8>,
    max_frames: usize,
    sink: S,
    stats: CaptureStats,
}

impl<S: PacketSink> AudioCapture<S> {
    pub fn new(format: AudioFormat, max_frames: usize, sink: S) -> Result<Self, AudioError> {
        let kind = format
            .sample_kind()
            .ok_or_else(|| AudioError::UnsupportedFormat(format!("{:?}", format)))?;
        let max_frames = max_frames.max(1);

        Ok(Self {
            format,
            kind,
            buffer: vec![0u8; format.frames_to_bytes(max_frames)],
            max_frames,
            sink,
            stats: CaptureStats::default(),
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Run one capture tick for `frames` frames (capped at `max_frames`).
    ///
    /// `render` fills the buffer and returns how many bytes it produced, or
    /// `None` when the device had nothing. Only produced data reaches the
    /// sink; a failed tick is counted and dropped.
    pub fn on_tick<F>(&mut self, frames: usize, render: F)
    where
        F: FnOnce(&mut [u8]) -> Option<usize>,
    {
        self.stats.ticks += 1;
        let len = self.format.frames_to_bytes(frames.min(self.max_frames));

        match render(&mut self.buffer[..len]) {
            Some(produced) if produced > 0 => {
                let produced = produced.min(len);
                self.sink.packet_ready(&self.buffer[..produced]);
                self.stats.packets_forwarded += 1;
                self.stats.bytes_forwarded += produced as u64;
            }
            _ => {
                self.stats.dropped_ticks += 1;
                tracing::trace!(frames, "capture tick produced no data");
            }
        }
    }

    /// cpal input path: encode channel 0 of each interleaved frame into the
    /// wire format and forward it, one packet per `max_frames` frames.
    pub fn capture_interleaved(&mut self, data: &[f32], channels: usize) {
        let channels = channels.max(1);
        if data.len() < channels {
            self.on_tick(0, |_| None);
            return;
        }

        let kind = self.kind;
        let bpf = self.format.bytes_per_frame();
        for chunk in data.chunks(self.max_frames * channels) {
            let frames = chunk.len() / channels;
            self.on_tick(frames, |buf| {
                for (frame, out) in chunk.chunks_exact(channels).zip(buf.chunks_exact_mut(bpf)) {
                    encode_sample(kind, frame[0], out);
                }
                Some(frames * bpf)
            });
        }
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_tick_forwards_rendered_bytes() {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let format = AudioFormat::mono_i16(48000.0);
        let mut capture = AudioCapture::new(format, 128, move |pcm: &[u8]| {
            let _ = tx.send(pcm.to_vec());
        })
        .unwrap();

        capture.on_tick(4, |buf| {
            assert_eq!(buf.len(), 8);
            buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
            Some(buf.len())
        });

        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(capture.stats().packets_forwarded, 1);
        assert_eq!(capture.stats().bytes_forwarded, 8);
    }

    #[test]
    fn test_failed_tick_is_dropped() {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let mut capture = AudioCapture::new(AudioFormat::mono_f32(48000.0), 128, move |pcm: &[u8]| {
            let _ = tx.send(pcm.to_vec());
        })
        .unwrap();

        capture.on_tick(32, |_| None);
        capture.on_tick(32, |_| Some(0));

        assert!(rx.try_recv().is_err());
        assert_eq!(capture.stats().ticks, 2);
        assert_eq!(capture.stats().dropped_ticks, 2);
    }

    #[test]
    fn test_tick_is_capped_to_buffer() {
        let mut seen = 0;
        let mut capture =
            AudioCapture::new(AudioFormat::mono_f32(48000.0), 16, |_: &[u8]| {}).unwrap();
        capture.on_tick(1000, |buf| {
            seen = buf.len();
            Some(buf.len())
        });
        assert_eq!(seen, 16 * 4);
    }

    #[test]
    fn test_interleaved_takes_first_channel() {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let mut capture = AudioCapture::new(AudioFormat::mono_f32(48000.0), 2, move |pcm: &[u8]| {
            let _ = tx.send(pcm.to_vec());
        })
        .unwrap();

        // Three stereo frames with max 2 frames per packet: packets of 2 and 1
        capture.capture_interleaved(&[0.25, -1.0, 0.5, -1.0, 0.75, -1.0], 2);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let decode = |bytes: &[u8]| -> Vec<f32> {
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
                .collect()
        };
        assert_eq!(decode(&first), vec![0.25, 0.5]);
        assert_eq!(decode(&second), vec![0.75]);
    }
}
