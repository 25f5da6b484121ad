//! # Council Voice Bridge - Terminal Host
//!
//! A minimal host standing in for the UI shell: loads configuration,
//! resolves the active persona and API key, runs one live voice session
//! (microphone → backend → speaker), and renders status changes and
//! transcript fragments as log lines until Ctrl-C.

use anyhow::Result;
use council_voice_bridge::config::AppConfig;
use council_voice_bridge::persona::SettingsStore;
use council_voice_bridge::session::{LiveSession, LiveSessionConfig, SessionStatus};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    info!(
        "Starting council-voice-bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = SettingsStore::new(&config.session.settings_path);
    let persona = store.resolve_persona(None, &config.session.persona);
    let api_key = store.resolve_api_key("gemini", &config.backend.key_env)?;

    info!(
        persona = %persona.name,
        role = %persona.role,
        voice = %persona.voice_name,
        "persona selected"
    );

    let session_config = LiveSessionConfig::from_app_config(&config, persona, api_key);
    let mut handle = LiveSession::start(session_config).await;
    let mut status = handle.watch_status();
    let mut transcripts = handle
        .take_transcripts()
        .expect("freshly started session has its transcript receiver");
    let mut last_status = handle.status();
    info!(session = %handle.id(), status = last_status.as_str(), "session started");

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                if current != last_status {
                    info!(status = current.as_str(), "session status changed");
                    last_status = current;
                }
                if current.is_terminal() {
                    break;
                }
            }
            fragment = transcripts.recv() => {
                match fragment {
                    Some(event) => {
                        let speaker = if event.is_user { "you" } else { "persona" };
                        info!(speaker, "{}", event.text);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping session...");
                handle.stop();
                break;
            }
        }
    }

    let final_status = handle.status();
    if final_status.is_terminal() && final_status != SessionStatus::Closed {
        error!(status = final_status.as_str(), "session ended abnormally");
    } else {
        info!("Session stopped gracefully");
    }
    Ok(())
}

/// Initialize structured logging; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "council_voice_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
