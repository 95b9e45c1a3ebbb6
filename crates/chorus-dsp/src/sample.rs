//! Raw PCM sample access: decode/encode, scaling and saturating mixes.
//!
//! Scaling happens in floating point, clamped to [-1, 1] before
//! requantization; additive mixing saturates at the sample depth. Integer
//! truncation rounds toward zero.

use crate::format::SampleFormat;

const S24_MAX: i32 = 0x007f_ffff;
const S24_MIN: i32 = -0x0080_0000;

/// Fill `bytes` with silence for the given format. All formats are signed
/// except `U8`, whose midpoint is 0x80.
pub fn fill_silence(bytes: &mut [u8], format: SampleFormat) {
    match format {
        SampleFormat::U8 => bytes.fill(0x80),
        _ => bytes.fill(0),
    }
}

/// Decode one sample starting at `bytes` to a float in [-1, 1].
#[inline]
pub fn decode_sample(bytes: &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::U8 => (f32::from(bytes[0]) - 128.0) / 128.0,
        SampleFormat::S16LE => {
            f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32768.0
        },
        SampleFormat::S24LE => {
            let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let val = (raw << 8) >> 8;
            val as f32 / 8_388_608.0
        },
        SampleFormat::S32LE => {
            let val = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            val as f32 / 2_147_483_648.0
        },
    }
}

/// Encode a float in [-1, 1] into `bytes`; values outside are clamped.
#[inline]
pub fn encode_sample(value: f32, bytes: &mut [u8], format: SampleFormat) {
    let value = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => {
            bytes[0] = ((value * 128.0) as i32 + 128).clamp(0, 255) as u8;
        },
        SampleFormat::S16LE => {
            let val = (value * 32768.0) as i32;
            bytes[0..2].copy_from_slice(&(val.clamp(-32768, 32767) as i16).to_le_bytes());
        },
        SampleFormat::S24LE => {
            let val = ((value * 8_388_608.0) as i32).clamp(S24_MIN, S24_MAX);
            bytes[0..4].copy_from_slice(&val.to_le_bytes());
        },
        SampleFormat::S32LE => {
            let val = (value as f64 * 2_147_483_648.0) as i64;
            let val = val.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            bytes[0..4].copy_from_slice(&val.to_le_bytes());
        },
    }
}

/// Decode an interleaved buffer into floats. `out` must hold
/// `bytes.len() / sample_bytes` values.
pub fn decode_buffer(bytes: &[u8], format: SampleFormat, out: &mut [f32]) {
    let sb = format.sample_bytes();
    for (i, slot) in out.iter_mut().enumerate().take(bytes.len() / sb) {
        *slot = decode_sample(&bytes[i * sb..], format);
    }
}

/// Encode floats into an interleaved buffer.
pub fn encode_buffer(values: &[f32], format: SampleFormat, out: &mut [u8]) {
    let sb = format.sample_bytes();
    for (i, &value) in values.iter().enumerate() {
        encode_sample(value, &mut out[i * sb..i * sb + sb], format);
    }
}

/// Additively mix `src` into `dst`, scaling `src` by `scaler` first.
/// Both buffers hold the same format; the sum saturates at sample depth.
pub fn mix_add(dst: &mut [u8], src: &[u8], format: SampleFormat, scaler: f32) {
    let sb = format.sample_bytes();
    let samples = dst.len().min(src.len()) / sb;
    match format {
        SampleFormat::U8 => {
            for i in 0..samples {
                let a = i32::from(dst[i]) - 128;
                let b = ((f32::from(src[i]) - 128.0) * scaler) as i32;
                dst[i] = ((a + b).clamp(-128, 127) + 128) as u8;
            }
        },
        SampleFormat::S16LE => {
            for i in 0..samples {
                let off = i * sb;
                let a = i16::from_le_bytes([dst[off], dst[off + 1]]);
                let b = f32::from(i16::from_le_bytes([src[off], src[off + 1]])) * scaler;
                let sum = i32::from(a) + b as i32;
                let sum = sum.clamp(-32768, 32767) as i16;
                dst[off..off + 2].copy_from_slice(&sum.to_le_bytes());
            }
        },
        SampleFormat::S24LE => {
            for i in 0..samples {
                let off = i * sb;
                let a = (i32::from_le_bytes(dst[off..off + 4].try_into().unwrap()) << 8) >> 8;
                let raw =
                    (i32::from_le_bytes(src[off..off + 4].try_into().unwrap()) << 8) >> 8;
                let sum = i64::from(a) + (raw as f64 * f64::from(scaler)) as i64;
                let sum = sum.clamp(i64::from(S24_MIN), i64::from(S24_MAX)) as i32;
                dst[off..off + 4].copy_from_slice(&sum.to_le_bytes());
            }
        },
        SampleFormat::S32LE => {
            for i in 0..samples {
                let off = i * sb;
                let a = i32::from_le_bytes(dst[off..off + 4].try_into().unwrap());
                let b = i32::from_le_bytes(src[off..off + 4].try_into().unwrap());
                let sum = i64::from(a) + (b as f64 * f64::from(scaler)) as i64;
                let sum = sum.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                dst[off..off + 4].copy_from_slice(&sum.to_le_bytes());
            }
        },
    }
}

/// Scale every sample of `bytes` in place. Used for software volume on
/// devices whose driver cannot apply volume itself.
pub fn scale_buffer(bytes: &mut [u8], format: SampleFormat, scaler: f32) {
    if (scaler - 1.0).abs() < f32::EPSILON {
        return;
    }
    let sb = format.sample_bytes();
    let samples = bytes.len() / sb;
    for i in 0..samples {
        let off = i * sb;
        let value = decode_sample(&bytes[off..], format) * scaler;
        encode_sample(value, &mut bytes[off..off + sb], format);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_sample, encode_sample, fill_silence, mix_add, scale_buffer, SampleFormat,
    };

    #[test]
    fn s16_round_trip_within_one_lsb() {
        for raw in [-32768i16, -12345, -1, 0, 1, 12345, 32767] {
            let src = raw.to_le_bytes();
            let value = decode_sample(&src, SampleFormat::S16LE);
            let mut out = [0u8; 2];
            encode_sample(value, &mut out, SampleFormat::S16LE);
            let back = i16::from_le_bytes(out);
            assert!((i32::from(back) - i32::from(raw)).abs() <= 1, "{raw} -> {back}");
        }
    }

    #[test]
    fn s16_mix_saturates() {
        let mut dst = 30000i16.to_le_bytes().to_vec();
        let src = 10000i16.to_le_bytes().to_vec();
        mix_add(&mut dst, &src, SampleFormat::S16LE, 1.0);
        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), 32767);

        let mut dst = (-30000i16).to_le_bytes().to_vec();
        let src = (-10000i16).to_le_bytes().to_vec();
        mix_add(&mut dst, &src, SampleFormat::S16LE, 1.0);
        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), -32768);
    }

    #[test]
    fn mix_applies_scaler() {
        let mut dst = 0i16.to_le_bytes().to_vec();
        let src = 20000i16.to_le_bytes().to_vec();
        mix_add(&mut dst, &src, SampleFormat::S16LE, 0.5);
        let got = i16::from_le_bytes([dst[0], dst[1]]);
        assert!((i32::from(got) - 10000).abs() <= 1);
    }

    #[test]
    fn u8_silence_is_midpoint() {
        let mut buf = [0u8; 4];
        fill_silence(&mut buf, SampleFormat::U8);
        assert_eq!(buf, [0x80; 4]);
        fill_silence(&mut buf, SampleFormat::S16LE);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn s24_uses_24_bit_range() {
        let raw: i32 = 0x007f_ffff;
        let bytes = raw.to_le_bytes();
        let value = decode_sample(&bytes, SampleFormat::S24LE);
        assert!((value - 1.0).abs() < 1e-6);

        let mut dst = raw.to_le_bytes().to_vec();
        let src = raw.to_le_bytes().to_vec();
        mix_add(&mut dst, &src, SampleFormat::S24LE, 1.0);
        assert_eq!(i32::from_le_bytes(dst[0..4].try_into().unwrap()), raw);
    }

    #[test]
    fn scale_buffer_halves_amplitude() {
        let mut buf = Vec::new();
        buf.extend(16000i16.to_le_bytes());
        buf.extend((-16000i16).to_le_bytes());
        scale_buffer(&mut buf, SampleFormat::S16LE, 0.5);
        let a = i16::from_le_bytes([buf[0], buf[1]]);
        let b = i16::from_le_bytes([buf[2], buf[3]]);
        assert!((i32::from(a) - 8000).abs() <= 1);
        assert!((i32::from(b) + 8000).abs() <= 1);
    }
}
