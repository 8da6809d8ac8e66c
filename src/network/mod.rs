//! Network subsystem: framed stream transport and peer link

pub mod link;
pub mod transport;

pub use transport::{
    Connection, DisconnectReason, FrameReader, FrameSender, FramedTransport, ReceiveStats,
    SendStats, TransportHandler, TransportOptions,
};
