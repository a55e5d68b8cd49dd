//! Sample format conversion
//!
//! The pipeline works in interleaved `f32` internally and hands the device
//! either `f32` or signed 16-bit samples, native endian, as raw bytes.

/// Scale between `i16` and normalized `f32`
const S16_SCALE: f32 = 32768.0;

/// Convert a volume in decibels to a linear gain
pub fn db_to_gain(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Append `input` as normalized floats scaled by `gain`
pub fn s16_to_f32(input: &[i16], gain: f32, output: &mut Vec<f32>) {
    let scale = gain / S16_SCALE;
    output.extend(input.iter().map(|&s| f32::from(s) * scale));
}

/// Convert one normalized float to `i16` with saturation
#[inline]
pub fn f32_to_s16_sample(sample: f32) -> i16 {
    (sample * S16_SCALE).clamp(-32768.0, 32767.0) as i16
}

/// Append `input` as saturated `i16` samples
pub fn f32_to_s16(input: &[f32], output: &mut Vec<i16>) {
    output.extend(input.iter().map(|&s| f32_to_s16_sample(s)));
}

/// View a sample slice as its native-endian bytes
pub fn as_bytes<T: bytemuck::Pod>(samples: &[T]) -> &[u8] {
    bytemuck::cast_slice(samples)
}

/// Decode native-endian `i16` bytes into normalized floats (trailing odd byte ignored)
pub fn s16_bytes_to_f32(bytes: &[u8], output: &mut Vec<f32>) {
    output.extend(
        bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_ne_bytes([b[0], b[1]])) / S16_SCALE),
    );
}

/// Decode native-endian `f32` bytes (trailing partial sample ignored)
pub fn f32_bytes_to_f32(bytes: &[u8], output: &mut Vec<f32>) {
    output.extend(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
    );
}
