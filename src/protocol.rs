//! Wire protocol definitions
//!
//! Every frame on the stream is laid out as:
//!
//! ```text
//! ┌──────┬──────┬──────┬──────────┬──────────────────────┬─────────────────┐
//! │ 0x69 │ 0x04 │ tag  │ reserved │ payload length (LE)  │ payload ...     │
//! │  1B  │  1B  │  1B  │    1B    │         4B           │  length bytes   │
//! └──────┴──────┴──────┴──────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! Tags: `0x19` handshake (one [`AudioFormat`]), `0x21` handshake with
//! microphone (output format followed by input format), `0x20` raw PCM data.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// First two bytes of every frame
pub const MAGIC: [u8; 2] = [0x69, 0x04];

/// Size of the fixed frame header (signature + length)
pub const HEADER_LEN: usize = 8;

/// `'lpcm'`
pub const FORMAT_LINEAR_PCM: u32 = u32::from_be_bytes(*b"lpcm");

/// Format flag bits, matching the peer's stream descriptor
pub mod flags {
    pub const IS_FLOAT: u32 = 1 << 0;
    pub const IS_BIG_ENDIAN: u32 = 1 << 1;
    pub const IS_SIGNED_INTEGER: u32 = 1 << 2;
    pub const IS_PACKED: u32 = 1 << 3;
    pub const IS_NON_INTERLEAVED: u32 = 1 << 5;
}

/// Packet type carried in byte 2 of the signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketTag {
    Handshake = 0x19,
    Data = 0x20,
    HandshakeWithMic = 0x21,
}

impl PacketTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x19 => Some(PacketTag::Handshake),
            0x20 => Some(PacketTag::Data),
            0x21 => Some(PacketTag::HandshakeWithMic),
            _ => None,
        }
    }

    /// The full 4-byte signature for this tag
    pub fn signature(self) -> [u8; 4] {
        [MAGIC[0], MAGIC[1], self as u8, 0]
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub tag: PacketTag,
    pub len: u32,
}

impl PacketHeader {
    pub fn new(tag: PacketTag, len: u32) -> Self {
        Self { tag, len }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.tag.signature());
        out[4..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Parse a raw header. The reserved byte is ignored.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        if raw[..2] != MAGIC {
            return Err(ProtocolError::BadMagic([raw[0], raw[1]]));
        }
        let tag = PacketTag::from_byte(raw[2]).ok_or(ProtocolError::UnknownTag(raw[2]))?;
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Ok(Self { tag, len })
    }
}

/// Payload length as carried in the header
pub fn wire_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge(len))
}

/// Build a complete frame (header + payload)
pub fn encode_frame(tag: PacketTag, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = wire_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&PacketHeader::new(tag, len).encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Sample encoding of a packed mono PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    F32,
    I16,
    I32,
}

impl SampleKind {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleKind::F32 | SampleKind::I32 => 4,
            SampleKind::I16 => 2,
        }
    }
}

/// Linear PCM stream descriptor, exchanged as a fixed 40-byte blob.
///
/// Field order and widths are part of the wire format; the blob is encoded
/// little-endian with fixed-width integers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
    pub reserved: u32,
}

impl AudioFormat {
    /// Serialized size of one descriptor
    pub const SIZE: usize = 40;

    /// Packed mono linear PCM in the given sample encoding
    pub fn mono(sample_rate: f64, kind: SampleKind) -> Self {
        let bytes = kind.bytes_per_sample() as u32;
        let format_flags = match kind {
            SampleKind::F32 => flags::IS_FLOAT | flags::IS_PACKED,
            SampleKind::I16 | SampleKind::I32 => flags::IS_SIGNED_INTEGER | flags::IS_PACKED,
        };
        Self {
            sample_rate,
            format_id: FORMAT_LINEAR_PCM,
            format_flags,
            bytes_per_packet: bytes,
            frames_per_packet: 1,
            bytes_per_frame: bytes,
            channels_per_frame: 1,
            bits_per_channel: bytes * 8,
            reserved: 0,
        }
    }

    pub fn mono_f32(sample_rate: f64) -> Self {
        Self::mono(sample_rate, SampleKind::F32)
    }

    pub fn mono_i16(sample_rate: f64) -> Self {
        Self::mono(sample_rate, SampleKind::I16)
    }

    pub fn mono_i32(sample_rate: f64) -> Self {
        Self::mono(sample_rate, SampleKind::I32)
    }

    pub fn is_float(&self) -> bool {
        self.format_flags & flags::IS_FLOAT != 0
    }

    pub fn is_packed(&self) -> bool {
        self.format_flags & flags::IS_PACKED != 0
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame as usize
    }

    /// Byte count for `frames` frames of this format
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }

    /// Sample encoding, if this is a layout the relay can convert
    pub fn sample_kind(&self) -> Option<SampleKind> {
        if self.format_flags & flags::IS_BIG_ENDIAN != 0 {
            return None;
        }
        match (self.is_float(), self.bits_per_channel) {
            (true, 32) => Some(SampleKind::F32),
            (false, 16) if self.format_flags & flags::IS_SIGNED_INTEGER != 0 => Some(SampleKind::I16),
            (false, 32) if self.format_flags & flags::IS_SIGNED_INTEGER != 0 => Some(SampleKind::I32),
            _ => None,
        }
    }

    /// Reject descriptors the relay cannot play
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.format_id != FORMAT_LINEAR_PCM {
            return Err(ProtocolError::InvalidFormat(format!(
                "format id {:#010x} is not linear PCM",
                self.format_id
            )));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ProtocolError::InvalidFormat(format!(
                "sample rate {}",
                self.sample_rate
            )));
        }
        if self.channels_per_frame != 1 {
            return Err(ProtocolError::InvalidFormat(format!(
                "{} channels, only mono is carried",
                self.channels_per_frame
            )));
        }
        if !self.is_packed() {
            return Err(ProtocolError::InvalidFormat("samples are not packed".into()));
        }
        if self.bytes_per_frame != self.bits_per_channel / 8 * self.channels_per_frame
            || self.bytes_per_frame == 0
        {
            return Err(ProtocolError::InvalidFormat(format!(
                "{} bytes per frame for {} bits x {} channels",
                self.bytes_per_frame, self.bits_per_channel, self.channels_per_frame
            )));
        }
        if self.sample_kind().is_none() {
            return Err(ProtocolError::InvalidFormat(format!(
                "unsupported sample layout (flags {:#x}, {} bits)",
                self.format_flags, self.bits_per_channel
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_f64_le(self.sample_rate);
        for word in [
            self.format_id,
            self.format_flags,
            self.bytes_per_packet,
            self.frames_per_packet,
            self.bytes_per_frame,
            self.channels_per_frame,
            self.bits_per_channel,
            self.reserved,
        ] {
            buf.put_u32_le(word);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::SIZE {
            return Err(ProtocolError::InvalidFormatLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        bincode::deserialize(bytes).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }
}

/// Format negotiation carried by a handshake frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Handshake {
    /// Format of the audio the host streams toward the client
    pub output: AudioFormat,
    /// Format of the microphone audio the client streams back, if enabled
    pub input: Option<AudioFormat>,
}

impl Handshake {
    pub fn new(output: AudioFormat, input: Option<AudioFormat>) -> Self {
        Self { output, input }
    }

    pub fn has_mic(&self) -> bool {
        self.input.is_some()
    }

    pub fn tag(&self) -> PacketTag {
        if self.has_mic() {
            PacketTag::HandshakeWithMic
        } else {
            PacketTag::Handshake
        }
    }

    pub fn payload_len(&self) -> usize {
        if self.has_mic() {
            2 * AudioFormat::SIZE
        } else {
            AudioFormat::SIZE
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload_len());
        buf.put_slice(&self.output.to_bytes());
        if let Some(input) = &self.input {
            buf.put_slice(&input.to_bytes());
        }
        buf.freeze()
    }

    /// Decode a handshake payload. With the mic tag the payload is split in
    /// two equal halves: output format first, input format second.
    pub fn decode(tag: PacketTag, payload: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            PacketTag::Handshake => Ok(Self::new(AudioFormat::from_bytes(payload)?, None)),
            PacketTag::HandshakeWithMic => {
                if payload.len() != 2 * AudioFormat::SIZE {
                    return Err(ProtocolError::InvalidFormatLength {
                        expected: 2 * AudioFormat::SIZE,
                        actual: payload.len(),
                    });
                }
                let (out, inp) = payload.split_at(payload.len() / 2);
                Ok(Self::new(
                    AudioFormat::from_bytes(out)?,
                    Some(AudioFormat::from_bytes(inp)?),
                ))
            }
            PacketTag::Data => Err(ProtocolError::UnknownTag(tag as u8)),
        }
    }
}
