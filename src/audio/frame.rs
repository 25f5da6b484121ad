//! # PCM Audio Frames
//!
//! The wire format of the live session is raw 16-bit signed little-endian
//! PCM, mono, base64-wrapped inside JSON: 16 kHz for microphone audio going
//! out, 24 kHz for persona audio coming back. This module owns every
//! conversion along that path.
//!
//! ## Key Functions:
//! - **Float → PCM**: capture blocks in [-1.0, 1.0] become i16 samples
//! - **PCM → Float**: decoded payloads become playable samples
//! - **Base64 packing/unpacking**: the transmittable form of a frame
//! - **Truncation policy**: odd trailing bytes are discarded, never an error

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Sample rate of microphone audio sent to the backend (fixed by the
/// backend's contract).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of persona audio received from the backend (fixed by the
/// backend's contract).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture block handed to the transport (256 ms at 16 kHz).
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

/// A fixed-rate, mono buffer of 16-bit signed PCM samples.
///
/// Frames are transient: they exist between the microphone callback and the
/// transport on the way out, and between the transport and the playback
/// scheduler on the way in. An empty frame is valid and every operation on
/// it is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Create a frame from raw samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Convert a block of floating-point samples in [-1.0, 1.0] to PCM.
    ///
    /// Each sample is scaled by 32768, rounded, and clamped to the i16
    /// range, so +1.0 maps to 32767 rather than wrapping.
    pub fn from_f32(block: &[f32], sample_rate: u32) -> Self {
        let samples = block
            .iter()
            .map(|&s| (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
            .collect();
        Self {
            samples,
            sample_rate,
        }
    }

    /// Reinterpret little-endian bytes as PCM samples.
    ///
    /// A buffer of odd length is truncated to `floor(len / 2)` whole
    /// samples; the trailing byte is dropped rather than treated as a
    /// decode error.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let mut cursor = Cursor::new(bytes);
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a base64 payload into a frame.
    ///
    /// Only the base64 text itself can fail here; the PCM reinterpretation
    /// afterwards follows the odd-byte truncation policy and never errors.
    pub fn from_base64(data: &str, sample_rate: u32) -> Result<Self, base64::DecodeError> {
        let bytes = BASE64.decode(data)?;
        Ok(Self::from_le_bytes(&bytes, sample_rate))
    }

    /// Encode the frame as base64 over its little-endian byte packing.
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        BASE64.encode(&bytes)
    }

    /// Convert samples to 32-bit floats in [-1.0, 1.0].
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    /// The PCM samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// The frame's sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of the frame in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Peak amplitude of the frame, normalized to [0.0, 1.0].
    ///
    /// Used for the host-facing microphone level meter.
    pub fn peak_level(&self) -> f32 {
        self.samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs())
            .max()
            .map(|peak| (peak as f32 / 32768.0).min(1.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_round_trip_stays_within_one_quantization_step() {
        let input = vec![0.0f32, 0.5, -0.5, 0.9999, -1.0, 1.0, 0.123_456, -0.987_654];
        let frame = AudioFrame::from_f32(&input, CAPTURE_SAMPLE_RATE);
        let output = frame.to_f32();

        for (original, decoded) in input.iter().zip(output.iter()) {
            let diff = (original - decoded).abs();
            assert!(
                diff <= 1.0 / 32768.0,
                "round-trip error too large: {} vs {}",
                original,
                decoded
            );
        }
    }

    #[test]
    fn full_scale_positive_clamps_instead_of_wrapping() {
        let frame = AudioFrame::from_f32(&[1.0], CAPTURE_SAMPLE_RATE);
        assert_eq!(frame.samples(), &[32767]);

        let frame = AudioFrame::from_f32(&[-1.0], CAPTURE_SAMPLE_RATE);
        assert_eq!(frame.samples(), &[-32768]);
    }

    #[test]
    fn odd_byte_buffers_truncate_to_whole_samples() {
        let bytes = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let frame = AudioFrame::from_le_bytes(&bytes, PLAYBACK_SAMPLE_RATE);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.samples(), &[0x0201, 0x0403]);
    }

    #[test]
    fn empty_payload_decodes_to_empty_frame() {
        let frame = AudioFrame::from_le_bytes(&[], PLAYBACK_SAMPLE_RATE);
        assert!(frame.is_empty());
        assert_eq!(frame.duration_seconds(), 0.0);
        assert_eq!(frame.peak_level(), 0.0);
    }

    #[test]
    fn base64_round_trip_preserves_samples() {
        let frame = AudioFrame::new(vec![0, 1000, -1000, 32767, -32768], CAPTURE_SAMPLE_RATE);
        let encoded = frame.to_base64();
        let decoded = AudioFrame::from_base64(&encoded, CAPTURE_SAMPLE_RATE)
            .expect("valid base64 should decode");
        assert_eq!(decoded.samples(), frame.samples());
    }

    #[test]
    fn malformed_base64_is_an_error_not_a_panic() {
        assert!(AudioFrame::from_base64("not//valid!!", PLAYBACK_SAMPLE_RATE).is_err());
    }

    #[test]
    fn duration_reflects_sample_rate() {
        let frame = AudioFrame::new(vec![0; 12_000], PLAYBACK_SAMPLE_RATE);
        assert!((frame.duration_seconds() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn peak_level_tracks_loudest_sample() {
        let frame = AudioFrame::new(vec![100, -16384, 42], CAPTURE_SAMPLE_RATE);
        assert!((frame.peak_level() - 0.5).abs() < 1e-4);
    }
}
