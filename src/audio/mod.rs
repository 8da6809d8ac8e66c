//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod sample;

pub use buffer::{DrainOutcome, RingBuffer, RingStats, SharedRingBuffer};
pub use capture::{AudioCapture, BoxedSink, CaptureStats, PacketSink};
pub use device::{list_devices, AudioBackend, CpalBackend, DeviceInfo, StreamHandle};
pub use playback::{AudioRelay, OutputRenderer};
