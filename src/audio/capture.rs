//! # Microphone Capture
//!
//! Turns the continuous microphone signal into discrete encoded frames for
//! the transport. The hardware side is behind the [`CaptureSource`] trait so
//! the session can run against a real cpal device or a synthetic source in
//! tests; the [`CaptureStage`] on top of it is pure conversion: float block →
//! PCM frame → base64 → fire-and-forget hand-off.
//!
//! ## Delivery Policy:
//! Frames are never queued across a closed or congested transport. If the
//! session is not open (channel closed) or the sender cannot keep up
//! (channel full), the block is dropped and counted: accepted loss, not
//! retry.

use crate::audio::frame::{AudioFrame, CAPTURE_SAMPLE_RATE};
use crate::error::{classify_capture_error, BridgeError, BridgeResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Callback invoked with each fixed-size block of mono 16 kHz float samples.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send>;

/// An audio input source producing fixed-size blocks of float samples.
///
/// Object-safe so the session can hold `Box<dyn CaptureSource>` and tests
/// can inject synthetic sources.
pub trait CaptureSource: Send {
    /// Begin capturing, delivering blocks to `sink` until [`stop`] is
    /// called. Returns an error without retaining any resources if the
    /// device cannot be opened.
    ///
    /// [`stop`]: CaptureSource::stop
    fn start(&mut self, sink: BlockSink) -> BridgeResult<()>;

    /// Stop capturing. Idempotent; safe to call without a prior `start`.
    fn stop(&mut self);
}

// ── Capture stage ───────────────────────────────────────────────────

/// Conversion stage between a capture source and the transport.
///
/// Owns the peak-level meter the host renders and the running count of
/// dropped blocks.
pub struct CaptureStage {
    outbound: mpsc::Sender<String>,
    level_tx: watch::Sender<f32>,
    dropped: u64,
}

impl CaptureStage {
    pub fn new(outbound: mpsc::Sender<String>, level_tx: watch::Sender<f32>) -> Self {
        Self {
            outbound,
            level_tx,
            dropped: 0,
        }
    }

    /// Convert one block and hand it to the transport.
    ///
    /// Does not block: delivery is `try_send`, and failure (session not yet
    /// open, already closed, or congested) drops the block.
    pub fn push_block(&mut self, block: &[f32]) {
        let frame = AudioFrame::from_f32(block, CAPTURE_SAMPLE_RATE);
        let _ = self.level_tx.send(frame.peak_level());

        match self.outbound.try_send(frame.to_base64()) {
            Ok(()) => {}
            Err(_) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % 100 == 0 {
                    debug!(dropped = self.dropped, "dropping capture block; session not accepting audio");
                }
            }
        }
    }

    /// Number of blocks dropped so far.
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped
    }

    /// Consume the stage into a [`BlockSink`] for a capture source.
    pub fn into_sink(mut self) -> BlockSink {
        Box::new(move |block: &[f32]| self.push_block(block))
    }
}

// ── Microphone source (cpal) ────────────────────────────────────────

/// Microphone capture through cpal.
///
/// The `cpal::Stream` is not `Send` on every platform, so the stream lives
/// on a dedicated thread for its whole lifetime; the handle only carries a
/// stop flag. The device is opened at its native rate and channel count,
/// then downmixed to mono and linearly resampled to 16 kHz before blocks are
/// cut.
pub struct MicSource {
    device_name: Option<String>,
    block_samples: usize,
    stop_flag: Option<Arc<AtomicBool>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MicSource {
    /// Create a microphone source.
    ///
    /// `device_name` selects a specific input device; `None` uses the
    /// system default. `block_samples` is the number of 16 kHz samples per
    /// delivered block.
    pub fn new(device_name: Option<String>, block_samples: usize) -> Self {
        Self {
            device_name,
            block_samples,
            stop_flag: None,
            thread: None,
        }
    }
}

impl CaptureSource for MicSource {
    fn start(&mut self, sink: BlockSink) -> BridgeResult<()> {
        if self.stop_flag.is_some() {
            return Err(BridgeError::Audio("capture already running".to_string()));
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<BridgeResult<()>>();
        let device_name = self.device_name.clone();
        let block_samples = self.block_samples;
        let thread_stop = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                run_capture_thread(device_name, block_samples, sink, thread_stop, ready_tx);
            })
            .map_err(|e| BridgeError::Audio(format!("capture thread: {}", e)))?;

        // The thread reports once the stream is playing (or why it could
        // not be opened). Nothing is considered acquired until then.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_flag = Some(stop_flag);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BridgeError::Audio(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MicSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the capture thread: open the device, build the input stream, and
/// keep it alive until the stop flag flips.
fn run_capture_thread(
    device_name: Option<String>,
    block_samples: usize,
    mut sink: BlockSink,
    stop_flag: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<BridgeResult<()>>,
) {
    let host = cpal::default_host();

    let device = match device_name {
        Some(ref name) => {
            let found = host
                .input_devices()
                .map_err(|e| classify_capture_error(e.to_string()))
                .and_then(|mut devices| {
                    devices
                        .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                        .ok_or_else(|| {
                            BridgeError::NoInputDevice(format!("no device named '{}'", name))
                        })
                });
            match found {
                Ok(device) => device,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            }
        }
        None => match host.default_input_device() {
            Some(device) => device,
            None => {
                let _ = ready_tx.send(Err(BridgeError::NoInputDevice(
                    "no default input device".to_string(),
                )));
                return;
            }
        },
    };

    let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());

    let default_config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready_tx.send(Err(classify_capture_error(e.to_string())));
            return;
        }
    };

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        device = %device_label,
        native_rate,
        channels,
        "opening input device"
    );

    let mut block_buf: Vec<f32> = Vec::with_capacity(block_samples * 2);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
            // Downmix to mono.
            let mono: Vec<f32> = if channels > 1 {
                let ch = channels as usize;
                data.chunks_exact(ch)
                    .map(|frame| frame.iter().sum::<f32>() / ch as f32)
                    .collect()
            } else {
                data.to_vec()
            };

            let resampled = resample_linear(&mono, native_rate, CAPTURE_SAMPLE_RATE);

            block_buf.extend_from_slice(&resampled);
            while block_buf.len() >= block_samples {
                let block: Vec<f32> = block_buf.drain(..block_samples).collect();
                sink(&block);
            }
        },
        |err| {
            warn!("input stream error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(classify_capture_error(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(classify_capture_error(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // The stream captures for as long as it is alive; park here until the
    // session asks us to stop.
    while !stop_flag.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    drop(stream);
    debug!(device = %device_label, "capture stream released");
}

/// Linear resampler between arbitrary rates. Identity when rates match.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}
