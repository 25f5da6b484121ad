//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_BACKEND__MODEL, APP_SESSION__PERSONA, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The API key never lives here: it is resolved at session start from the
//! settings blob or the environment variable named by `backend.key_env`.

use crate::audio::frame::CAPTURE_BLOCK_SAMPLES;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Voice-backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// WebSocket endpoint of the live voice service.
    pub endpoint: String,

    /// Model identifier requested in the session setup.
    pub model: String,

    /// Environment variable consulted for the API key when the settings
    /// blob has none saved.
    pub key_env: String,
}

/// Capture-side audio settings. The sample rates themselves are fixed by
/// the backend's contract and are not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Samples per capture block handed to the transport.
    pub block_samples: usize,

    /// Input device name; `None` selects the system default microphone.
    pub input_device: Option<String>,
}

/// Session behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Persona selected when neither the caller nor the settings blob
    /// names one.
    pub persona: String,

    /// Whether persona audio is scheduled for playback. When false the
    /// session still surfaces transcripts but drops audio payloads.
    pub auto_play: bool,

    /// Path of the application's persisted settings blob.
    pub settings_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                endpoint:
                    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                        .to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                key_env: "GEMINI_API_KEY".to_string(),
            },
            audio: AudioConfig {
                block_samples: CAPTURE_BLOCK_SAMPLES,
                input_device: None,
            },
            session: SessionConfig {
                persona: crate::persona::DEFAULT_PERSONA_ID.to_string(),
                auto_play: true,
                settings_path: "settings.json".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration in priority order: defaults, then `config.toml`
    /// if present, then `APP_`-prefixed environment variables (`__`
    /// separates nesting levels, e.g. `APP_BACKEND__MODEL`).
    pub fn load() -> BridgeResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.backend.endpoint.is_empty() {
            return Err(BridgeError::Config(
                "backend endpoint cannot be empty".to_string(),
            ));
        }
        if !self.backend.endpoint.starts_with("ws://")
            && !self.backend.endpoint.starts_with("wss://")
        {
            return Err(BridgeError::Config(format!(
                "backend endpoint must be a ws:// or wss:// URL, got '{}'",
                self.backend.endpoint
            )));
        }
        if self.backend.model.is_empty() {
            return Err(BridgeError::Config(
                "backend model cannot be empty".to_string(),
            ));
        }
        if self.audio.block_samples == 0 {
            return Err(BridgeError::Config(
                "audio block size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
