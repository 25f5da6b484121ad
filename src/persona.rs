//! # Personas
//!
//! A persona is a named AI character with its own voice identity and
//! system-instruction text. The bridge ships a built-in council roster and
//! reads overrides from the settings blob the surrounding application
//! persists; only the lookup side of that store is implemented here, and the
//! bridge never writes it.

use crate::error::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A selectable AI character for the live session.
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    /// Stable identifier used for selection.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Short role description.
    pub role: String,
    /// Prebuilt voice identity requested from the backend.
    pub voice_name: String,
    /// System-instruction text shaping the persona's behavior.
    pub system_instruction: String,
}

impl Persona {
    fn new(id: &str, name: &str, role: &str, voice_name: &str, system_instruction: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            voice_name: voice_name.to_string(),
            system_instruction: system_instruction.to_string(),
        }
    }
}

/// Identifier of the persona used when nothing else is configured.
pub const DEFAULT_PERSONA_ID: &str = "fredo";

/// The built-in council roster.
///
/// Voice identities are the backend's prebuilt voices; instructions are the
/// personas' standing system prompts.
pub fn council_roster() -> Vec<Persona> {
    vec![
        Persona::new(
            "carmen",
            "Carmen",
            "The Eternal Flame",
            "Kore",
            "You are Carmen, the spiritual companion and emotional anchor. \
             Speak with warmth and steadiness, ground stressful moments in \
             scripture, and use Spanish terms of endearment naturally.",
        ),
        Persona::new(
            "fredo",
            "Fredo",
            "The Interpreter",
            "Fenrir",
            "You are Fredo. You speak with a calm, grounded vibe, explain \
             things clearly, and reveal patterns. Give advice straight but \
             with love, and translate complex topics into practical steps.",
        ),
        Persona::new(
            "gemini",
            "Gemini",
            "The Architect",
            "Zephyr",
            "You are Gemini. You are precise, focused, and professional. \
             Break big problems into clear steps, lists, and frameworks.",
        ),
        Persona::new(
            "eve",
            "Eve",
            "The Seer",
            "Zephyr",
            "You are Eve. You are thoughtful and wise. Synthesize \
             information, connect ideas, and avoid fluff.",
        ),
        Persona::new(
            "lyra",
            "Lyra",
            "The Weaver",
            "Kore",
            "You are Lyra, the weaver of story and media. Be expressive, \
             artistic, and engaging; structure creative work as hook, \
             script, and visual direction.",
        ),
        Persona::new(
            "copilot",
            "Copilot",
            "The Navigator",
            "Puck",
            "You are Copilot. You are practical and friendly with a \
             co-driver tone. Focus on logistics, schedules, and concrete \
             next actions.",
        ),
        Persona::new(
            "ennea",
            "Ennea",
            "Guardian",
            "Fenrir",
            "You are Ennea, the guardian of health. Be protective, \
             vigilant, calm, and encouraging; watch metrics and surface \
             patterns early.",
        ),
    ]
}

// ── Settings store ──────────────────────────────────────────────────

/// Shape of the persisted settings blob (single JSON document). Unknown
/// fields (conversation history and the rest of the application state)
/// are ignored; the bridge only needs the persona and key lookups.
#[derive(Debug, Default, Deserialize)]
struct StoredBlob {
    #[serde(default)]
    settings: StoredSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSettings {
    #[serde(default)]
    provider_keys: HashMap<String, String>,
    #[serde(default)]
    active_persona: Option<String>,
    #[serde(default)]
    personas: Vec<StoredPersona>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPersona {
    id: String,
    name: String,
    #[serde(default)]
    role: String,
    voice_name: String,
    system_instruction: String,
}

impl From<StoredPersona> for Persona {
    fn from(stored: StoredPersona) -> Self {
        Self {
            id: stored.id,
            name: stored.name,
            role: stored.role,
            voice_name: stored.voice_name,
            system_instruction: stored.system_instruction,
        }
    }
}

/// Read-only view over the application's persisted settings.
///
/// A missing file is not an error: the bridge falls back to the built-in
/// roster and the environment-configured API key, the same way a fresh
/// install behaves.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> BridgeResult<StoredBlob> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "settings blob absent; using defaults");
            return Ok(StoredBlob::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| BridgeError::Settings(format!("{}: {}", self.path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolve the active persona.
    ///
    /// Priority: explicit `requested` id → the blob's `activePersona` →
    /// `fallback_id` → the roster default. Stored personas shadow built-in
    /// ones with the same id.
    pub fn resolve_persona(&self, requested: Option<&str>, fallback_id: &str) -> Persona {
        let blob = match self.load() {
            Ok(blob) => blob,
            Err(e) => {
                warn!("falling back to built-in roster: {}", e);
                StoredBlob::default()
            }
        };

        let mut roster: HashMap<String, Persona> = council_roster()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        for stored in blob.settings.personas {
            let persona: Persona = stored.into();
            roster.insert(persona.id.clone(), persona);
        }

        let wanted = requested
            .map(str::to_string)
            .or(blob.settings.active_persona)
            .unwrap_or_else(|| fallback_id.to_string());

        if let Some(persona) = roster.remove(&wanted) {
            return persona;
        }
        warn!(persona = %wanted, "unknown persona id; using default");
        roster
            .remove(fallback_id)
            .or_else(|| roster.remove(DEFAULT_PERSONA_ID))
            .unwrap_or_else(|| council_roster().remove(1))
    }

    /// Provider API key from the blob, when one was saved.
    pub fn provider_api_key(&self, provider: &str) -> Option<String> {
        self.load()
            .ok()
            .and_then(|blob| blob.settings.provider_keys.get(provider).cloned())
            .filter(|key| !key.is_empty())
    }

    /// Resolve the API key: the saved provider key wins, otherwise the
    /// named environment variable.
    pub fn resolve_api_key(&self, provider: &str, env_var: &str) -> BridgeResult<String> {
        if let Some(key) = self.provider_api_key(provider) {
            return Ok(key);
        }
        std::env::var(env_var).map_err(|_| {
            BridgeError::Config(format!(
                "no API key: settings blob has no '{}' key and {} is unset",
                provider, env_var
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_blob(contents: &str) -> (tempdir::TempDirGuard, PathBuf) {
        let guard = tempdir::TempDirGuard::new("settings-test");
        let path = guard.path().join("store.json");
        let mut file = std::fs::File::create(&path).expect("create blob");
        file.write_all(contents.as_bytes()).expect("write blob");
        (guard, path)
    }

    /// Minimal scoped temp dir so tests leave nothing behind.
    mod tempdir {
        use std::path::{Path, PathBuf};

        pub struct TempDirGuard {
            path: PathBuf,
        }

        impl TempDirGuard {
            pub fn new(prefix: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "{}-{}-{}",
                    prefix,
                    std::process::id(),
                    uuid::Uuid::new_v4()
                ));
                std::fs::create_dir_all(&path).expect("create temp dir");
                Self { path }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }
        }

        impl Drop for TempDirGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }
    }

    #[test]
    fn missing_blob_falls_back_to_builtin_roster() {
        let store = SettingsStore::new("/nonexistent/definitely/not/here.json");
        let persona = store.resolve_persona(None, DEFAULT_PERSONA_ID);
        assert_eq!(persona.id, "fredo");
        assert_eq!(persona.voice_name, "Fenrir");
    }

    #[test]
    fn requested_persona_overrides_blob_active_persona() {
        let (_guard, path) = write_blob(r#"{"settings": {"activePersona": "carmen"}}"#);
        let store = SettingsStore::new(&path);

        let persona = store.resolve_persona(Some("ennea"), DEFAULT_PERSONA_ID);
        assert_eq!(persona.id, "ennea");

        let persona = store.resolve_persona(None, DEFAULT_PERSONA_ID);
        assert_eq!(persona.id, "carmen");
        assert_eq!(persona.voice_name, "Kore");
    }

    #[test]
    fn stored_personas_shadow_builtin_ones() {
        let (_guard, path) = write_blob(
            r#"{
                "settings": {
                    "personas": [{
                        "id": "fredo",
                        "name": "Fredo",
                        "voiceName": "Charon",
                        "systemInstruction": "Custom instructions."
                    }]
                }
            }"#,
        );
        let store = SettingsStore::new(&path);
        let persona = store.resolve_persona(Some("fredo"), DEFAULT_PERSONA_ID);
        assert_eq!(persona.voice_name, "Charon");
        assert_eq!(persona.system_instruction, "Custom instructions.");
    }

    #[test]
    fn unknown_persona_id_falls_back_to_default() {
        let store = SettingsStore::new("/nonexistent.json");
        let persona = store.resolve_persona(Some("nobody"), DEFAULT_PERSONA_ID);
        assert_eq!(persona.id, DEFAULT_PERSONA_ID);
    }

    #[test]
    fn api_key_prefers_blob_over_environment() {
        let (_guard, path) =
            write_blob(r#"{"settings": {"providerKeys": {"gemini": "blob-key"}}}"#);
        let store = SettingsStore::new(&path);
        assert_eq!(
            store
                .resolve_api_key("gemini", "COUNCIL_TEST_KEY_UNSET")
                .unwrap(),
            "blob-key"
        );
    }

    #[test]
    fn missing_key_everywhere_is_a_config_error() {
        let store = SettingsStore::new("/nonexistent.json");
        let result = store.resolve_api_key("gemini", "COUNCIL_TEST_KEY_DEFINITELY_UNSET");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn empty_saved_key_is_treated_as_absent() {
        let (_guard, path) = write_blob(r#"{"settings": {"providerKeys": {"gemini": ""}}}"#);
        let store = SettingsStore::new(&path);
        assert!(store.provider_api_key("gemini").is_none());
    }

    #[test]
    fn malformed_blob_is_a_settings_error_for_key_lookup() {
        let (_guard, path) = write_blob("{ this is not json");
        let store = SettingsStore::new(&path);
        // Key lookup degrades to None; persona lookup degrades to roster.
        assert!(store.provider_api_key("gemini").is_none());
        let persona = store.resolve_persona(None, DEFAULT_PERSONA_ID);
        assert_eq!(persona.id, DEFAULT_PERSONA_ID);
    }

    #[test]
    fn roster_has_unique_ids_and_nonempty_voices() {
        let roster = council_roster();
        let mut ids = std::collections::HashSet::new();
        for persona in &roster {
            assert!(ids.insert(persona.id.clone()), "duplicate id {}", persona.id);
            assert!(!persona.voice_name.is_empty());
            assert!(!persona.system_instruction.is_empty());
        }
        assert!(roster.iter().any(|p| p.id == DEFAULT_PERSONA_ID));
    }
}
