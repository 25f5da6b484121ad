//! # Council Voice Bridge
//!
//! Live audio session bridge between a microphone/speaker pair and a
//! generative-AI voice backend, for hosts that present AI personas.
//!
//! ## Pipeline:
//! microphone → capture stage → transport (outbound) ⇄ backend ⇄ transport
//! (inbound) → playback scheduler → speaker, with a transcript side channel.
//!
//! ## Public Surface:
//! - [`LiveSession::start`] / [`LiveSessionHandle::stop`]: the whole
//!   session contract
//! - [`SessionStatus`] and transcript events for host rendering
//! - [`Persona`] roster and [`SettingsStore`] lookup
//! - [`AppConfig`] for file/environment configuration

pub mod audio;
pub mod config;
pub mod error;
pub mod persona;
pub mod session;
pub mod transport;

pub use audio::frame::{AudioFrame, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
pub use config::AppConfig;
pub use error::{BridgeError, BridgeResult};
pub use persona::{council_roster, Persona, SettingsStore, DEFAULT_PERSONA_ID};
pub use session::{
    LiveSession, LiveSessionConfig, LiveSessionHandle, SessionParts, SessionStatus,
    TranscriptEvent,
};
pub use transport::{SessionTransport, TransportConfig, TransportEvent};
