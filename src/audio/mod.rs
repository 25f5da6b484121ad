//! # Audio Pipeline
//!
//! The two directions of the live session's audio path:
//! - **Capture**: microphone → fixed float blocks → PCM frames → transport
//! - **Playback**: transport → PCM frames → gap-free scheduled output
//!
//! with the shared frame codec in between.
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16 kHz, 16-bit PCM, mono, little-endian, base64-wrapped
//! - **Inbound**: 24 kHz, 16-bit PCM, mono, little-endian, base64-wrapped
//!
//! Both rates are dictated by the voice backend's contract and are not a
//! degree of freedom.

pub mod capture;
pub mod frame;
pub mod playback;

pub use capture::{CaptureSource, CaptureStage, MicSource};
pub use frame::{AudioFrame, CAPTURE_BLOCK_SAMPLES, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
pub use playback::{DeviceClock, DeviceSink, OutputClock, PlaybackScheduler, PlaybackSink};
