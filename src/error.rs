//! # Error Handling
//!
//! Custom error types for the voice bridge. The variants mirror the failure
//! taxonomy a host needs to act on: permission problems and missing hardware
//! get their own variants because the user-facing remedy differs (grant
//! microphone access vs. plug in a device), while transport and audio
//! failures are terminal for the current session but never for the host.
//!
//! ## Error Categories:
//! - **PermissionDenied**: microphone access was refused by the OS
//! - **NoInputDevice**: no usable capture device exists
//! - **Audio**: capture/playback backend failures (device lost, stream error)
//! - **Handshake**: the live session never reached the open state
//! - **Transport**: WebSocket-level failures after open
//! - **Config / Settings**: configuration or settings-store problems

use std::fmt;

/// Errors produced by the live voice bridge.
#[derive(Debug)]
pub enum BridgeError {
    /// Microphone permission was denied by the operating system.
    PermissionDenied(String),

    /// No microphone is available (none connected, or the named device
    /// does not exist).
    NoInputDevice(String),

    /// Audio backend failure outside the permission/device cases.
    Audio(String),

    /// The session handshake with the voice backend failed.
    Handshake(String),

    /// WebSocket transport failure on an established session.
    Transport(String),

    /// Configuration file or environment variable problems.
    Config(String),

    /// The persisted settings blob could not be read or parsed.
    Settings(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::PermissionDenied(msg) => {
                write!(f, "Microphone permission denied: {}", msg)
            }
            BridgeError::NoInputDevice(msg) => write!(f, "No input device: {}", msg),
            BridgeError::Audio(msg) => write!(f, "Audio error: {}", msg),
            BridgeError::Handshake(msg) => write!(f, "Session handshake failed: {}", msg),
            BridgeError::Transport(msg) => write!(f, "Transport error: {}", msg),
            BridgeError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BridgeError::Settings(msg) => write!(f, "Settings store error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Settings(format!("JSON parsing error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Audio(err.to_string())
    }
}

/// Classify an audio-backend error message into the bridge taxonomy.
///
/// cpal reports permission refusals as backend-specific errors whose text
/// varies by platform, so classification is by message content. Anything
/// that does not look like a permission or missing-device problem stays a
/// generic [`BridgeError::Audio`].
pub fn classify_capture_error(message: String) -> BridgeError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        BridgeError::PermissionDenied(message)
    } else if lower.contains("no device") || lower.contains("device not available") {
        BridgeError::NoInputDevice(message)
    } else {
        BridgeError::Audio(message)
    }
}

/// Type alias for Results that use the bridge error type.
pub type BridgeResult<T> = Result<T, BridgeError>;
