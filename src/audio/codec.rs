//! # Audio Codec Utilities
//!
//! Stateless conversions between the captured floating-point audio and the
//! agent's wire format, and from received frames back to playable buffers.
//!
//! ## Wire Format:
//! - **Outbound**: 16-bit signed PCM, little-endian, mono, at the transport rate (16kHz)
//! - **Inbound**: 16-bit signed PCM, little-endian, mono, at the output rate (24kHz)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Decoded agent audio ready to be scheduled for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Sample rate the samples are tagged with
    pub sample_rate: u32,
}

impl PlayableBuffer {
    /// Playback duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Resample by block-averaging decimation.
///
/// Each output sample is the mean of the input samples that fall into its
/// window, windows being `from_rate / to_rate` input samples wide with
/// boundaries rounded to the nearest sample.
///
/// ## Edge cases:
/// - `to_rate == from_rate`: the input is returned unchanged
/// - `to_rate > from_rate`: upsampling is unsupported, an empty vector is returned
/// - a zero rate: an empty vector is returned
///
/// ## Example:
/// 4096 samples at 48kHz → 16kHz gives `round(4096 / 3) = 1365` samples.
pub fn downsample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 || to_rate > from_rate {
        return Vec::new();
    }
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len);

    let mut window_start = 0usize;
    for i in 0..out_len {
        let window_end = (((i + 1) as f64) * ratio).round() as usize;
        let window = &samples[window_start.min(samples.len())..window_end.min(samples.len())];

        let value = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|&s| s as f64).sum::<f64>() / window.len() as f64
        };
        output.push(value as f32);

        window_start = window_end;
    }

    output
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Convert float samples in [-1, 1] to 16-bit little-endian PCM bytes.
///
/// Out-of-range input is clamped, never wrapped. Negative values scale by
/// 32768 and positive values by 32767 so both ends of the range are reachable.
pub fn encode_for_transport(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if clamped < 0.0 {
            clamped * 32768.0
        } else {
            clamped * 32767.0
        };
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(scaled as i16);
    }
    bytes
}

/// Wrap raw agent PCM into a playable buffer tagged with `target_sample_rate`.
///
/// Returns `None` for empty input (nothing playable). A trailing odd byte is
/// ignored.
pub fn decode_for_playback(bytes: &[u8], target_sample_rate: u32) -> Option<PlayableBuffer> {
    if bytes.len() < 2 || target_sample_rate == 0 {
        return None;
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    Some(PlayableBuffer {
        samples,
        sample_rate: target_sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_block(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_downsample_capture_block() {
        let block = sine_block(4096, 48000);
        let out = downsample(&block, 48000, 16000);
        assert!(out.len() == 1365 || out.len() == 1366, "got {}", out.len());

        let bytes = encode_for_transport(&out);
        assert_eq!(bytes.len(), out.len() * 2);
    }

    #[test]
    fn test_downsample_is_deterministic() {
        let block = sine_block(4096, 44100);
        let first = downsample(&block, 44100, 16000);
        let second = downsample(&block, 44100, 16000);
        assert_eq!(first, second);
    }

    #[test]
    fn test_downsample_averages_windows() {
        let samples = [0.0, 0.3, 0.6, 0.9, 0.9, 0.9];
        let out = downsample(&samples, 48000, 16000);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_rejects_upsampling() {
        assert!(downsample(&[0.1, 0.2], 16000, 48000).is_empty());
        assert_eq!(downsample(&[0.1, 0.2], 16000, 16000), vec![0.1, 0.2]);
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode_for_transport(&[2.0, -2.0, 0.0, 1.0, -1.0]);
        let mut cursor = Cursor::new(bytes);
        let values: Vec<i16> = (0..5)
            .map(|_| cursor.read_i16::<LittleEndian>().unwrap())
            .collect();
        assert_eq!(values, vec![32767, -32768, 0, 32767, -32768]);
    }

    #[test]
    fn test_decode_empty_is_not_playable() {
        assert!(decode_for_playback(&[], 24000).is_none());
        assert!(decode_for_playback(&[7], 24000).is_none());
    }

    #[test]
    fn test_decode_tags_output_rate() {
        let pcm: Vec<u8> = [0i16, 16384, -16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let buffer = decode_for_playback(&pcm, 24000).unwrap();
        assert_eq!(buffer.sample_rate, 24000);
        assert_eq!(buffer.samples, vec![0.0, 0.5, -0.5]);
        assert!((buffer.duration_seconds() - 3.0 / 24000.0).abs() < 1e-12);
    }

    #[test]
    fn test_to_mono_averages_frames() {
        assert_eq!(to_mono(&[0.2, 0.4, -1.0, 1.0], 2), vec![0.3, 0.0]);
        assert_eq!(to_mono(&[0.2, 0.4], 1), vec![0.2, 0.4]);
    }
}
