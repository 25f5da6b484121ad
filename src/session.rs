//! # Live Session Management
//!
//! Manages the lifecycle of one live voice session: microphone capture,
//! the transport connection, playback scheduling, and the guarantee that
//! everything acquired along the way is released exactly once on every exit
//! path: explicit stop, transport error, remote close, or a stop racing an
//! in-flight open.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: handshake with the voice backend in progress
//! 2. **Listening**: open, microphone streaming, no persona audio in flight
//! 3. **Speaking**: at least one scheduled playback frame has not finished
//! 4. **Closed / Error / PermissionDenied / NoDevice**: terminal
//!
//! The public surface is exactly `start(config) → handle` and
//! `handle.stop()`; everything else reaches the host through watch and
//! event channels.

use crate::audio::capture::{CaptureSource, CaptureStage, MicSource};
use crate::audio::frame::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::audio::playback::{
    DeviceClock, DeviceSink, OutputClock, PlaybackScheduler, PlaybackSink,
};
use crate::config::AppConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::persona::Persona;
use crate::transport::{SessionTransport, TransportConfig, TransportEvent};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transcript fragments buffered for the host.
const TRANSCRIPT_EVENT_BUFFER: usize = 256;

/// Current status of a live session, consumed by the host for rendering.
///
/// Permission and device failures are deliberately distinct from generic
/// errors: the user-facing remedy differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Handshake with the voice backend in progress.
    Connecting,
    /// Session open; microphone audio streaming out.
    Listening,
    /// Persona audio currently playing.
    Speaking,
    /// Microphone permission was denied (terminal).
    PermissionDenied,
    /// No usable microphone exists (terminal).
    NoDevice,
    /// Transport or audio failure ended the session (terminal).
    Error,
    /// The session ended normally (terminal).
    Closed,
}

impl SessionStatus {
    /// Stable string form for host rendering and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Listening => "listening",
            SessionStatus::Speaking => "speaking",
            SessionStatus::PermissionDenied => "permission_denied",
            SessionStatus::NoDevice => "no_device",
            SessionStatus::Error => "error",
            SessionStatus::Closed => "closed",
        }
    }

    /// Whether the session can never leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::PermissionDenied
                | SessionStatus::NoDevice
                | SessionStatus::Error
                | SessionStatus::Closed
        )
    }
}

/// Map a startup failure to its session status.
fn status_for(error: &BridgeError) -> SessionStatus {
    match error {
        BridgeError::PermissionDenied(_) => SessionStatus::PermissionDenied,
        BridgeError::NoInputDevice(_) => SessionStatus::NoDevice,
        _ => SessionStatus::Error,
    }
}

/// A transcript fragment from either side of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    /// True for fragments transcribed from the microphone; false for the
    /// persona's speech.
    pub is_user: bool,
}

/// Everything a live session needs to know before it starts.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    pub persona: Persona,
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub auto_play: bool,
    pub block_samples: usize,
    pub input_device: Option<String>,
}

impl LiveSessionConfig {
    /// Assemble a session config from the application config plus the
    /// resolved persona and API key.
    pub fn from_app_config(config: &AppConfig, persona: Persona, api_key: String) -> Self {
        Self {
            persona,
            endpoint: config.backend.endpoint.clone(),
            model: config.backend.model.clone(),
            api_key,
            auto_play: config.session.auto_play,
            block_samples: config.audio.block_samples,
            input_device: config.audio.input_device.clone(),
        }
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            voice_name: self.persona.voice_name.clone(),
            system_instruction: self.persona.system_instruction.clone(),
        }
    }
}

/// The injectable hardware seams of a session: where audio comes from,
/// where it goes, and the clock playback is scheduled against.
pub struct SessionParts {
    pub source: Box<dyn CaptureSource>,
    pub sink: Box<dyn PlaybackSink>,
    pub clock: Arc<dyn OutputClock>,
}

impl SessionParts {
    /// Real devices: default (or named) microphone, default speaker.
    ///
    /// The output side is opened first; if the microphone is later refused,
    /// teardown releases the already-acquired output resources.
    pub fn from_devices(config: &LiveSessionConfig) -> BridgeResult<Self> {
        let sink = DeviceSink::open()?;
        Ok(Self {
            source: Box::new(MicSource::new(
                config.input_device.clone(),
                config.block_samples,
            )),
            sink: Box::new(sink),
            clock: Arc::new(DeviceClock::new()),
        })
    }
}

/// Every resource a session may hold, tracked in one place so teardown is
/// a release-everything loop.
struct Resources {
    source: Option<Box<dyn CaptureSource>>,
    transport: Option<SessionTransport>,
    scheduler: Option<Arc<Mutex<PlaybackScheduler>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct SessionInner {
    id: String,
    started_at: DateTime<Utc>,
    torn_down: AtomicBool,
    resources: Mutex<Resources>,
    status_tx: watch::Sender<SessionStatus>,
    transcript_tx: mpsc::Sender<TranscriptEvent>,
    running_transcript: Mutex<String>,
}

impl SessionInner {
    /// Release every tracked resource exactly once and publish the final
    /// status. Safe to call repeatedly, from any exit path, and before
    /// setup completed: each handle is checked for existence before
    /// release, and later calls are no-ops.
    fn teardown(&self, final_status: SessionStatus) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut resources = self.resources.lock().unwrap();
        if let Some(mut source) = resources.source.take() {
            source.stop();
        }
        if let Some(scheduler) = resources.scheduler.take() {
            scheduler.lock().unwrap().clear();
        }
        if let Some(transport) = resources.transport.take() {
            transport.close();
        }
        for task in resources.tasks.drain(..) {
            task.abort();
        }
        drop(resources);

        let _ = self.status_tx.send(final_status);
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        info!(
            session = %self.id,
            status = final_status.as_str(),
            elapsed_ms = elapsed.num_milliseconds(),
            "live session torn down"
        );
    }

    fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Publish a non-terminal status, unless teardown already won.
    fn set_live_status(&self, status: SessionStatus) {
        if !self.torn_down() {
            let _ = self.status_tx.send(status);
        }
    }
}

/// Entry point for live sessions.
pub struct LiveSession;

impl LiveSession {
    /// Start a live session on the real microphone and speaker.
    ///
    /// Returns the handle immediately with status `Connecting`; setup
    /// failures (permission denied, no device, handshake refusal) surface
    /// through the status watch as their distinct terminal statuses.
    pub async fn start(config: LiveSessionConfig) -> LiveSessionHandle {
        match SessionParts::from_devices(&config) {
            Ok(parts) => Self::start_with_parts(config, parts).await,
            Err(e) => {
                // Hand back a handle that is already terminal.
                warn!("session never started: {}", e);
                Self::stillborn(status_for(&e))
            }
        }
    }

    /// Start a live session over injected capture/playback parts.
    ///
    /// The returned handle is live immediately; connection and microphone
    /// acquisition continue in the background. A `stop()` racing that setup
    /// is honored: the open is not cancellable mid-flight, but its result
    /// is released as soon as it resolves.
    pub async fn start_with_parts(
        config: LiveSessionConfig,
        parts: SessionParts,
    ) -> LiveSessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_EVENT_BUFFER);
        let (level_tx, level_rx) = watch::channel(0.0f32);

        let scheduler = PlaybackScheduler::new(parts.clock.clone(), parts.sink);
        let activity_rx = scheduler.subscribe_activity();
        let scheduler = Arc::new(Mutex::new(scheduler));

        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            torn_down: AtomicBool::new(false),
            resources: Mutex::new(Resources {
                source: Some(parts.source),
                transport: None,
                scheduler: Some(scheduler.clone()),
                tasks: Vec::new(),
            }),
            status_tx,
            transcript_tx,
            running_transcript: Mutex::new(String::new()),
        });

        info!(
            session = %inner.id,
            persona = %config.persona.name,
            voice = %config.persona.voice_name,
            "starting live session"
        );

        let setup_inner = inner.clone();
        tokio::spawn(async move {
            run_setup(setup_inner, config, scheduler, activity_rx, level_tx).await;
        });

        LiveSessionHandle {
            inner,
            status_rx,
            transcript_rx: Some(transcript_rx),
            level_rx,
        }
    }

    /// A handle for a session that failed before anything was acquired.
    fn stillborn(status: SessionStatus) -> LiveSessionHandle {
        let (status_tx, status_rx) = watch::channel(status);
        let (transcript_tx, transcript_rx) = mpsc::channel(1);
        let (_level_tx, level_rx) = watch::channel(0.0f32);
        LiveSessionHandle {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                torn_down: AtomicBool::new(true),
                resources: Mutex::new(Resources {
                    source: None,
                    transport: None,
                    scheduler: None,
                    tasks: Vec::new(),
                }),
                status_tx,
                transcript_tx,
                running_transcript: Mutex::new(String::new()),
            }),
            status_rx,
            transcript_rx: Some(transcript_rx),
            level_rx,
        }
    }
}

/// Connect, acquire the microphone, and hand control to the event loop.
async fn run_setup(
    inner: Arc<SessionInner>,
    config: LiveSessionConfig,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    activity_rx: watch::Receiver<bool>,
    level_tx: watch::Sender<f32>,
) {
    // Network-bound suspension. Not cancellable mid-flight: a stop() racing
    // this open is honored right after it resolves.
    let (transport, events) = match SessionTransport::connect(&config.transport_config()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(session = %inner.id, "session setup failed: {}", e);
            inner.teardown(status_for(&e));
            return;
        }
    };

    if inner.torn_down() {
        debug!(session = %inner.id, "stopped before open completed; releasing transport");
        transport.close();
        return;
    }

    let audio_tx = transport.audio_sender();
    let stage = CaptureStage::new(audio_tx, level_tx);

    // Hardware-bound suspension: the microphone may be refused. Everything
    // acquired so far (output sink, transport) is released on that path,
    // and the failure keeps its distinct status.
    let start_result = {
        let mut resources = inner.resources.lock().unwrap();
        match resources.source.as_mut() {
            Some(source) => source.start(stage.into_sink()),
            // A concurrent teardown already emptied the slot.
            None => {
                transport.close();
                return;
            }
        }
    };
    if let Err(e) = start_result {
        warn!(session = %inner.id, "microphone acquisition failed: {}", e);
        transport.close();
        inner.teardown(status_for(&e));
        return;
    }

    inner.resources.lock().unwrap().transport = Some(transport);
    if inner.torn_down() {
        // stop() landed between the capture start and the transport
        // registration; finish its job.
        let transport = inner.resources.lock().unwrap().transport.take();
        if let Some(transport) = transport {
            transport.close();
        }
        return;
    }

    inner.set_live_status(SessionStatus::Listening);
    info!(session = %inner.id, "live session open and listening");

    // Map the scheduler's activity flag onto the listening/speaking states.
    let activity_inner = inner.clone();
    let activity_task = tokio::spawn(async move {
        let mut activity_rx = activity_rx;
        while activity_rx.changed().await.is_ok() {
            let speaking = *activity_rx.borrow();
            activity_inner.set_live_status(if speaking {
                SessionStatus::Speaking
            } else {
                SessionStatus::Listening
            });
        }
    });

    let event_inner = inner.clone();
    let auto_play = config.auto_play;
    let event_task = tokio::spawn(async move {
        run_event_loop(event_inner, scheduler, events, auto_play).await;
    });

    {
        let mut resources = inner.resources.lock().unwrap();
        resources.tasks.push(activity_task);
        resources.tasks.push(event_task);
    }
    if inner.torn_down() {
        // Teardown ran while the tasks were being registered; it cannot
        // have seen them, so abort here.
        let mut resources = inner.resources.lock().unwrap();
        for task in resources.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Drive inbound transport events until the connection ends.
async fn run_event_loop(
    inner: Arc<SessionInner>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    mut events: ReceiverStream<TransportEvent>,
    auto_play: bool,
) {
    while let Some(event) = events.next().await {
        match event {
            TransportEvent::Audio(data) => {
                if !auto_play {
                    continue;
                }
                let frame = match AudioFrame::from_base64(&data, PLAYBACK_SAMPLE_RATE) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Malformed payloads never surface to the host.
                        warn!(session = %inner.id, "skipping undecodable audio payload: {}", e);
                        continue;
                    }
                };

                let scheduled = {
                    let mut scheduler = scheduler.lock().unwrap();
                    scheduler
                        .schedule(frame)
                        .map(|buffer| (buffer, scheduler.seconds_until_end(&buffer)))
                };
                if let Some((buffer, remaining)) = scheduled {
                    let completion_scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(remaining)).await;
                        completion_scheduler.lock().unwrap().complete(buffer.id);
                    });
                }
            }
            TransportEvent::Transcript { text, is_user } => {
                {
                    let mut running = inner.running_transcript.lock().unwrap();
                    if !running.is_empty() {
                        running.push(' ');
                    }
                    running.push_str(&text);
                }
                if inner
                    .transcript_tx
                    .try_send(TranscriptEvent { text, is_user })
                    .is_err()
                {
                    debug!(session = %inner.id, "dropping transcript fragment for slow host");
                }
            }
            TransportEvent::TurnComplete => {
                inner.running_transcript.lock().unwrap().clear();
            }
            TransportEvent::Closed { reason } => {
                let status = if inner.torn_down() || reason.is_none() {
                    SessionStatus::Closed
                } else {
                    SessionStatus::Error
                };
                inner.teardown(status);
                return;
            }
        }
    }
    // The stream ended without its terminal event; clean up anyway.
    inner.teardown(SessionStatus::Closed);
}

/// Owning handle for one live session.
///
/// Dropping the handle stops the session.
pub struct LiveSessionHandle {
    inner: Arc<SessionInner>,
    status_rx: watch::Receiver<SessionStatus>,
    transcript_rx: Option<mpsc::Receiver<TranscriptEvent>>,
    level_rx: watch::Receiver<f32>,
}

impl LiveSessionHandle {
    /// Unique id of this session, for logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// When the session was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Current session status.
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Microphone peak level in [0, 1], for rendering a meter.
    pub fn mic_level(&self) -> f32 {
        *self.level_rx.borrow()
    }

    /// Next transcript fragment, or `None` once the session ended and the
    /// buffer drained (or the receiver was detached).
    pub async fn next_transcript(&mut self) -> Option<TranscriptEvent> {
        match self.transcript_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Detach the transcript receiver, for hosts that poll it alongside
    /// other events. Subsequent [`next_transcript`] calls return `None`.
    ///
    /// [`next_transcript`]: Self::next_transcript
    pub fn take_transcripts(&mut self) -> Option<mpsc::Receiver<TranscriptEvent>> {
        self.transcript_rx.take()
    }

    /// The running transcript of the current turn. Resets when a turn
    /// completes.
    pub fn current_transcript(&self) -> String {
        self.inner.running_transcript.lock().unwrap().clone()
    }

    /// Stop the session: capture halts, scheduled playback is hard-stopped,
    /// the transport closes, and every tracked resource is released.
    /// Idempotent; extra calls (or a stop before setup finished) are safe.
    pub fn stop(&self) {
        self.inner.teardown(SessionStatus::Closed);
    }
}

impl Drop for LiveSessionHandle {
    fn drop(&mut self) {
        self.inner.teardown(SessionStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::testing::ScriptedSource;
    use crate::audio::playback::testing::{ManualClock, RecordingSink};
    use crate::persona::council_roster;
    use crate::transport::testing::{spawn_server, ServerScript};
    use std::time::Duration;

    fn test_persona() -> Persona {
        council_roster()
            .into_iter()
            .find(|p| p.id == "fredo")
            .expect("roster has fredo")
    }

    fn test_config(endpoint: String) -> LiveSessionConfig {
        LiveSessionConfig {
            persona: test_persona(),
            endpoint,
            model: "models/test-voice".to_string(),
            api_key: String::new(),
            auto_play: true,
            block_samples: 4,
            input_device: None,
        }
    }

    fn test_parts(source: ScriptedSource) -> (SessionParts, RecordingSink, ManualClock) {
        let sink = RecordingSink::default();
        let clock = ManualClock::default();
        let parts = SessionParts {
            source: Box::new(source),
            sink: Box::new(sink.clone()),
            clock: Arc::new(clock.clone()),
        };
        (parts, sink, clock)
    }

    /// Wait until the session reaches `wanted`, or fail after the timeout.
    async fn wait_for_status(
        rx: &mut watch::Receiver<SessionStatus>,
        wanted: SessionStatus,
    ) -> SessionStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *rx.borrow_and_update();
                if current == wanted {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return current;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for status {:?}", wanted))
    }

    #[tokio::test]
    async fn session_opens_and_reaches_listening() {
        let (url, mut seen) = spawn_server(ServerScript::Serve { messages: vec![] }).await;
        let source = ScriptedSource::new(vec![vec![0.25f32; 4]]);
        let started = source.started.clone();
        let (parts, _sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        wait_for_status(&mut status, SessionStatus::Listening).await;
        assert!(started.load(Ordering::SeqCst));

        // The scripted source pushed one block through the stage; it shows
        // up at the server as a realtimeInput frame after the setup.
        let setup = seen.recv().await.expect("setup frame");
        assert!(setup.contains("\"setup\""));
        let frame = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("frame should arrive")
            .expect("channel open");
        assert!(frame.contains("realtimeInput"));

        handle.stop();
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_releases_each_resource_once() {
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![] }).await;
        let source = ScriptedSource::new(vec![]);
        let stop_calls = source.stop_calls.clone();
        let (parts, sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        wait_for_status(&mut status, SessionStatus::Listening).await;

        handle.stop();
        handle.stop();
        handle.stop();

        assert_eq!(handle.status(), SessionStatus::Closed);
        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
        // The hard stop silenced the sink exactly once.
        assert_eq!(*sink.stopped.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_before_open_completes_is_safe_and_cleans_up() {
        let (url, _seen) = spawn_server(ServerScript::SlowSetup { delay_ms: 300 }).await;
        let source = ScriptedSource::new(vec![]);
        let started = source.started.clone();
        let (parts, _sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        // Stop immediately, long before setupComplete arrives.
        handle.stop();
        assert_eq!(handle.status(), SessionStatus::Closed);

        // Once the open resolves, the setup path notices the teardown and
        // releases the transport instead of starting the microphone.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(handle.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn permission_denial_surfaces_as_its_own_status() {
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![] }).await;
        let source = ScriptedSource::failing(|| {
            BridgeError::PermissionDenied("microphone access blocked".to_string())
        });
        let (parts, sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        let status = wait_for_status(&mut status, SessionStatus::PermissionDenied).await;
        assert_eq!(status, SessionStatus::PermissionDenied);
        assert_eq!(status.as_str(), "permission_denied");
        // The already-acquired output side was released too.
        assert_eq!(*sink.stopped.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_device_is_distinct_from_generic_error() {
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![] }).await;
        let source =
            ScriptedSource::failing(|| BridgeError::NoInputDevice("nothing plugged in".to_string()));
        let (parts, _sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        assert_eq!(
            wait_for_status(&mut status, SessionStatus::NoDevice).await,
            SessionStatus::NoDevice
        );
    }

    #[tokio::test]
    async fn refused_handshake_ends_in_error_status() {
        let (url, _seen) = spawn_server(ServerScript::RefuseSetup).await;
        let source = ScriptedSource::new(vec![]);
        let (parts, _sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        assert_eq!(
            wait_for_status(&mut status, SessionStatus::Error).await,
            SessionStatus::Error
        );
    }

    #[tokio::test]
    async fn persona_audio_drives_speaking_then_listening() {
        // 0.05 s of audio at the playback rate.
        let audio = AudioFrame::new(vec![500i16; 1200], PLAYBACK_SAMPLE_RATE).to_base64();
        let content = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
            audio
        );
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![content] }).await;
        let source = ScriptedSource::new(vec![]);
        let (parts, sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        wait_for_status(&mut status, SessionStatus::Speaking).await;

        // The frame reached the sink at the cursor origin.
        {
            let played = sink.played.lock().unwrap();
            assert_eq!(played.len(), 1);
            assert_eq!(played[0], (0.0, 1200));
        }

        // The completion timer fires after the frame's duration and the
        // status falls back to listening.
        wait_for_status(&mut status, SessionStatus::Listening).await;
        handle.stop();
    }

    #[tokio::test]
    async fn auto_play_off_drops_audio_but_keeps_transcripts() {
        let audio = AudioFrame::new(vec![500i16; 1200], PLAYBACK_SAMPLE_RATE).to_base64();
        let content = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}},"outputTranscription":{{"text":"quietly"}}}}}}"#,
            audio
        );
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![content] }).await;
        let source = ScriptedSource::new(vec![]);
        let (parts, sink, _clock) = test_parts(source);
        let mut config = test_config(url);
        config.auto_play = false;

        let mut handle = LiveSession::start_with_parts(config, parts).await;
        let event = tokio::time::timeout(Duration::from_secs(5), handle.next_transcript())
            .await
            .expect("transcript should arrive")
            .expect("channel open");
        assert_eq!(event.text, "quietly");
        assert!(!event.is_user);

        assert!(sink.played.lock().unwrap().is_empty());
        assert_ne!(handle.status(), SessionStatus::Speaking);
        handle.stop();
    }

    #[tokio::test]
    async fn transcripts_accumulate_per_turn_and_reset_on_completion() {
        let messages = vec![
            r#"{"serverContent":{"outputTranscription":{"text":"good"}}}"#.to_string(),
            r#"{"serverContent":{"outputTranscription":{"text":"morning"}}}"#.to_string(),
            r#"{"serverContent":{"inputTranscription":{"text":"hello there"}}}"#.to_string(),
            r#"{"serverContent":{"turnComplete":true}}"#.to_string(),
        ];
        let (url, _seen) = spawn_server(ServerScript::Serve { messages }).await;
        let source = ScriptedSource::new(vec![]);
        let (parts, _sink, _clock) = test_parts(source);

        let mut handle = LiveSession::start_with_parts(test_config(url), parts).await;

        let first = handle.next_transcript().await.expect("first fragment");
        assert_eq!(first.text, "good");
        assert!(!first.is_user);
        let second = handle.next_transcript().await.expect("second fragment");
        assert_eq!(second.text, "morning");
        let third = handle.next_transcript().await.expect("third fragment");
        assert!(third.is_user);

        // The running transcript drains once the turn completes.
        let cleared = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.current_transcript().is_empty() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or(false);
        assert!(cleared, "running transcript should reset on turn complete");

        handle.stop();
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_session() {
        let (url, _seen) = spawn_server(ServerScript::Serve { messages: vec![] }).await;
        let source = ScriptedSource::new(vec![]);
        let stop_calls = source.stop_calls.clone();
        let (parts, _sink, _clock) = test_parts(source);

        let handle = LiveSession::start_with_parts(test_config(url), parts).await;
        let mut status = handle.watch_status();
        wait_for_status(&mut status, SessionStatus::Listening).await;

        drop(handle);
        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_strings_match_the_host_contract() {
        assert_eq!(SessionStatus::Connecting.as_str(), "connecting");
        assert_eq!(SessionStatus::Listening.as_str(), "listening");
        assert_eq!(SessionStatus::Speaking.as_str(), "speaking");
        assert_eq!(SessionStatus::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(SessionStatus::NoDevice.as_str(), "no_device");
        assert!(SessionStatus::Closed.is_terminal());
        assert!(!SessionStatus::Speaking.is_terminal());
    }
}
