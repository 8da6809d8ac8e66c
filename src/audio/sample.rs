//! Conversion between wire PCM bytes and the f32 samples cpal hands us.
//!
//! All wire layouts are little-endian and packed.

use crate::protocol::SampleKind;

const I16_SCALE: f32 = 32768.0;
const I32_SCALE: f32 = 2_147_483_648.0;

/// Decode one sample from the start of `bytes`
#[inline]
pub fn decode_sample(kind: SampleKind, bytes: &[u8]) -> f32 {
    match kind {
        SampleKind::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleKind::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / I16_SCALE,
        SampleKind::I32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / I32_SCALE
        }
    }
}

/// Encode one sample into the start of `out`, clamping integer layouts
#[inline]
pub fn encode_sample(kind: SampleKind, sample: f32, out: &mut [u8]) {
    match kind {
        SampleKind::F32 => out[..4].copy_from_slice(&sample.to_le_bytes()),
        SampleKind::I16 => {
            let v = (sample.clamp(-1.0, 1.0) * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
            out[..2].copy_from_slice(&(v as i16).to_le_bytes());
        }
        SampleKind::I32 => {
            let v = (sample.clamp(-1.0, 1.0) as f64 * I32_SCALE as f64)
                .clamp(i32::MIN as f64, i32::MAX as f64);
            out[..4].copy_from_slice(&(v as i32).to_le_bytes());
        }
    }
}
