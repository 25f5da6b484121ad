//! # Playback Scheduling
//!
//! Converts inbound PCM frames into continuous audible output regardless of
//! network jitter. The scheduler keeps a monotonically non-decreasing cursor
//! (`next_start_time`) on the output clock: each frame starts at
//! `max(now, next_start_time)`, so frames that arrive faster than they play
//! queue back-to-back with no gap, and frames that arrive late start
//! immediately instead of being scheduled in the past.
//!
//! ## Key Properties:
//! - **FIFO**: frames play strictly in arrival order, never reordered
//! - **No drift**: consecutive starts satisfy `start(n+1) = start(n) + dur(n)`
//!   while the queue stays ahead of the clock
//! - **Activity flag**: "speaking" exactly while at least one scheduled frame
//!   has not finished; reverts to quiet when the in-flight set empties
//!
//! The scheduler itself is pure bookkeeping over a [`OutputClock`] and a
//! [`PlaybackSink`]; the device realization at the bottom of this module
//! feeds a rodio sink from a dedicated playback thread.

use crate::audio::frame::AudioFrame;
use crate::error::{BridgeError, BridgeResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Monotonic time source for playback scheduling, in seconds.
///
/// The device implementation is the wall clock of the output stream; tests
/// use a manually advanced clock so scheduling decisions are deterministic.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Destination for scheduled audio.
///
/// `play` receives the frame together with the absolute start time the
/// scheduler computed. Implementations may realize the start time however
/// their backend allows; the rodio sink relies on queue order, which matches
/// the scheduler's back-to-back guarantee.
pub trait PlaybackSink: Send {
    fn play(&mut self, frame: &AudioFrame, start_time: f64) -> BridgeResult<()>;

    /// Hard-stop everything queued or playing. Used on session teardown;
    /// partial playback is not allowed to drain.
    fn stop_all(&mut self);
}

/// Identifier of one scheduled frame, unique within a scheduler.
pub type BufferId = u64;

/// A frame accepted by the scheduler, with its computed timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
}

/// Gap-free playback scheduler over an output clock.
pub struct PlaybackScheduler {
    clock: Arc<dyn OutputClock>,
    sink: Box<dyn PlaybackSink>,
    next_start_time: f64,
    in_flight: HashSet<BufferId>,
    next_id: BufferId,
    activity_tx: watch::Sender<bool>,
}

impl PlaybackScheduler {
    /// Create a scheduler with its cursor at zero.
    pub fn new(clock: Arc<dyn OutputClock>, sink: Box<dyn PlaybackSink>) -> Self {
        let (activity_tx, _) = watch::channel(false);
        Self {
            clock,
            sink,
            next_start_time: 0.0,
            in_flight: HashSet::new(),
            next_id: 0,
            activity_tx,
        }
    }

    /// Watch the speaking/quiet activity flag.
    ///
    /// `true` while at least one scheduled frame is in flight.
    pub fn subscribe_activity(&self) -> watch::Receiver<bool> {
        self.activity_tx.subscribe()
    }

    /// Schedule a frame for playback.
    ///
    /// Returns `None` for an empty frame (a no-op, not an error). On a sink
    /// failure the frame is dropped and the cursor is left untouched so the
    /// next frame schedules as if this one never arrived.
    pub fn schedule(&mut self, frame: AudioFrame) -> Option<ScheduledBuffer> {
        if frame.is_empty() {
            return None;
        }

        let start_time = self.clock.now().max(self.next_start_time);
        let duration = frame.duration_seconds();

        if let Err(e) = self.sink.play(&frame, start_time) {
            warn!("dropping playback frame after sink error: {}", e);
            return None;
        }

        self.next_start_time = start_time + duration;

        let id = self.next_id;
        self.next_id += 1;
        self.in_flight.insert(id);
        if self.in_flight.len() == 1 {
            let _ = self.activity_tx.send(true);
        }

        debug!(
            id,
            start_time,
            duration,
            queued = self.in_flight.len(),
            "scheduled playback frame"
        );

        Some(ScheduledBuffer {
            id,
            start_time,
            duration,
        })
    }

    /// Mark a scheduled frame as finished.
    ///
    /// When the in-flight set empties the activity flag reverts to quiet.
    /// That is the only externally observable transition of this component.
    pub fn complete(&mut self, id: BufferId) {
        if self.in_flight.remove(&id) && self.in_flight.is_empty() {
            let _ = self.activity_tx.send(false);
        }
    }

    /// Whether at least one scheduled frame has not finished.
    pub fn is_speaking(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Current value of the playback cursor.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Seconds of output-clock time until a scheduled frame finishes.
    ///
    /// Drives the completion timer registered for each frame.
    pub fn seconds_until_end(&self, buffer: &ScheduledBuffer) -> f64 {
        (buffer.start_time + buffer.duration - self.clock.now()).max(0.0)
    }

    /// Hard-stop playback: silence the sink, forget every in-flight frame,
    /// and drop the activity flag. Safe to call repeatedly.
    pub fn clear(&mut self) {
        self.sink.stop_all();
        if !self.in_flight.is_empty() {
            self.in_flight.clear();
            let _ = self.activity_tx.send(false);
        }
    }
}

// ── Device realizations ─────────────────────────────────────────────

/// Output clock backed by a monotonic [`Instant`], starting at zero when the
/// session's playback side is created.
pub struct DeviceClock {
    origin: Instant,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for DeviceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock for DeviceClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Commands for the playback thread.
enum SinkCommand {
    Play { samples: Vec<i16>, sample_rate: u32 },
    StopAll,
    Shutdown,
}

/// Speaker output through rodio.
///
/// `rodio::OutputStream` is not `Send`, so the stream and its sink live on a
/// dedicated thread and the handle only carries a command channel. Appended
/// buffers play back-to-back in queue order, which is exactly the
/// back-to-back contract the scheduler maintains; a frame arriving after the
/// queue drained starts immediately.
pub struct DeviceSink {
    commands: std::sync::mpsc::Sender<SinkCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceSink {
    /// Open the default output device.
    ///
    /// Fails if no output device exists or the stream cannot be built; the
    /// error is reported before any session resource is considered acquired.
    pub fn open() -> BridgeResult<Self> {
        let (commands, command_rx) = std::sync::mpsc::channel::<SinkCommand>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<BridgeResult<()>>();

        let thread = std::thread::Builder::new()
            .name("playback-sink".to_string())
            .spawn(move || {
                let (stream, handle) = match rodio::OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx
                            .send(Err(BridgeError::Audio(format!("output stream: {}", e))));
                        return;
                    }
                };
                let sink = match rodio::Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ =
                            ready_tx.send(Err(BridgeError::Audio(format!("output sink: {}", e))));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive for the lifetime of the thread.
                let _stream = stream;
                while let Ok(command) = command_rx.recv() {
                    match command {
                        SinkCommand::Play {
                            samples,
                            sample_rate,
                        } => {
                            sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
                        }
                        SinkCommand::StopAll => sink.stop(),
                        SinkCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| BridgeError::Audio(format!("playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::Audio(
                "playback thread exited before reporting readiness".to_string(),
            )),
        }
    }
}

impl PlaybackSink for DeviceSink {
    fn play(&mut self, frame: &AudioFrame, _start_time: f64) -> BridgeResult<()> {
        self.commands
            .send(SinkCommand::Play {
                samples: frame.samples().to_vec(),
                sample_rate: frame.sample_rate(),
            })
            .map_err(|_| BridgeError::Audio("playback thread is gone".to_string()))
    }

    fn stop_all(&mut self) {
        let _ = self.commands.send(SinkCommand::StopAll);
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        let _ = self.commands.send(SinkCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Manually advanced clock for deterministic scheduling tests.
    #[derive(Clone, Default)]
    pub struct ManualClock {
        now: Arc<Mutex<f64>>,
    }

    impl ManualClock {
        pub fn advance_to(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl OutputClock for ManualClock {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    /// Sink that records every scheduled frame instead of playing it.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub played: Arc<Mutex<Vec<(f64, usize)>>>,
        pub stopped: Arc<Mutex<u32>>,
    }

    impl PlaybackSink for RecordingSink {
        fn play(&mut self, frame: &AudioFrame, start_time: f64) -> BridgeResult<()> {
            self.played.lock().unwrap().push((start_time, frame.len()));
            Ok(())
        }

        fn stop_all(&mut self) {
            *self.stopped.lock().unwrap() += 1;
        }
    }
}
