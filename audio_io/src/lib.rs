//! Audio capture and playback for aircast
//!
//! This crate is the seam between the session core and whatever produces
//! or consumes audio. The core only ever sees the two traits: a capture it
//! can acquire (and lose, and release) and a sink it can attach a remote
//! stream to. The implementations here are synthetic — a tone generator
//! and a draining monitor — which is all the session logic and tests need;
//! device-backed implementations slot in behind the same traits.

use async_trait::async_trait;
use cast_core::{AudioBuffer, MediaStream, SAMPLE_RATE};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Frame length captures produce
pub const FRAME_MS: u64 = 20;

/// Samples per frame at [`SAMPLE_RATE`], mono
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Frames a slow stream can fall behind by before it skips
const FRAME_BACKLOG: usize = 32;

/// Why the local audio source could not be acquired
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no capture device available")]
    NoDevice,
}

/// Why playback could not start
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("playback requires a user gesture")]
    AutoplayBlocked,
}

/// Whether a sink may start playing on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayPolicy {
    /// Playback starts as soon as it is requested
    #[default]
    Auto,
    /// Playback is blocked until a user gesture arrives (`resume`)
    RequireGesture,
}

/// A local audio source the session can acquire for the duration of a
/// broadcast. Acquisition may prompt the user for permission and is
/// awaited, not assumed.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn acquire(&self) -> Result<CaptureHandle, CaptureError>;
}

/// A playback destination for a remote stream
pub trait AudioSink: Send + Sync {
    fn attach(&self, stream: MediaStream) -> SinkHandle;
}

/// Exclusive handle to an acquired capture.
///
/// Any number of outbound streams can tap the same capture; each one is an
/// independent receiver. Dropping the handle stops the producer and ends
/// every tapped stream.
pub struct CaptureHandle {
    frames: broadcast::Sender<AudioBuffer>,
    producer: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn new(frames: broadcast::Sender<AudioBuffer>, producer: JoinHandle<()>) -> Self {
        Self { frames, producer }
    }

    /// Tap the capture with a fresh outbound stream
    pub fn stream(&self) -> MediaStream {
        MediaStream::new(self.frames.subscribe())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle").finish_non_exhaustive()
    }
}

/// Handle to a sink with a stream attached.
///
/// The drain keeps consuming the stream whether or not playback is
/// audible; `play` opens the gate, or reports that a user gesture is
/// required first. Dropping the handle releases the sink.
pub struct SinkHandle {
    playing: Arc<AtomicBool>,
    frames_seen: Arc<AtomicU64>,
    policy: PlayPolicy,
    drain: JoinHandle<()>,
}

impl SinkHandle {
    pub fn new(
        playing: Arc<AtomicBool>,
        frames_seen: Arc<AtomicU64>,
        policy: PlayPolicy,
        drain: JoinHandle<()>,
    ) -> Self {
        Self {
            playing,
            frames_seen,
            policy,
            drain,
        }
    }

    /// Start playback. Under [`PlayPolicy::RequireGesture`] this fails
    /// until [`resume`](Self::resume) has been called; the stream keeps
    /// flowing either way.
    pub fn play(&self) -> Result<(), SinkError> {
        match self.policy {
            PlayPolicy::Auto => {
                self.playing.store(true, Ordering::Relaxed);
                Ok(())
            }
            PlayPolicy::RequireGesture => {
                if self.playing.load(Ordering::Relaxed) {
                    Ok(())
                } else {
                    Err(SinkError::AutoplayBlocked)
                }
            }
        }
    }

    /// The user gesture: unblock playback
    pub fn resume(&self) {
        self.playing.store(true, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Frames drained from the stream so far
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen.load(Ordering::Relaxed)
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("playing", &self.is_playing())
            .finish_non_exhaustive()
    }
}

/// Tone-generating capture. Produces a steady 440 Hz sine so that frames
/// flowing end-to-end are observable without any audio hardware.
pub struct SyntheticCapture {
    fail_with: Option<CaptureError>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self { fail_with: None }
    }

    /// A capture whose acquisition always fails, for exercising the
    /// microphone-unavailable path
    pub fn failing(error: CaptureError) -> Self {
        Self {
            fail_with: Some(error),
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.2;

#[async_trait]
impl AudioCapture for SyntheticCapture {
    async fn acquire(&self) -> Result<CaptureHandle, CaptureError> {
        if let Some(error) = self.fail_with {
            debug!("Synthetic capture refusing acquisition: {}", error);
            return Err(error);
        }

        let (tx, _) = broadcast::channel(FRAME_BACKLOG);
        let frames = tx.clone();
        let producer = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(FRAME_MS));
            let step = 2.0 * std::f32::consts::PI * TONE_HZ / SAMPLE_RATE as f32;
            let mut phase: f32 = 0.0;
            loop {
                ticker.tick().await;
                let mut frame = Vec::with_capacity(FRAME_SAMPLES);
                for _ in 0..FRAME_SAMPLES {
                    frame.push(phase.sin() * TONE_AMPLITUDE);
                    phase += step;
                    if phase > 2.0 * std::f32::consts::PI {
                        phase -= 2.0 * std::f32::consts::PI;
                    }
                }
                // No receivers yet is fine, keep the clock running
                let _ = tx.send(frame);
            }
        });

        debug!("Synthetic capture acquired");
        Ok(CaptureHandle::new(frames, producer))
    }
}

/// Sink that drains the remote stream and counts frames. Stands in for a
/// playback device; the count is what tests observe.
pub struct MonitorSink {
    policy: PlayPolicy,
}

impl MonitorSink {
    pub fn new() -> Self {
        Self {
            policy: PlayPolicy::Auto,
        }
    }

    pub fn with_policy(policy: PlayPolicy) -> Self {
        Self { policy }
    }
}

impl Default for MonitorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for MonitorSink {
    fn attach(&self, mut stream: MediaStream) -> SinkHandle {
        let playing = Arc::new(AtomicBool::new(false));
        let frames_seen = Arc::new(AtomicU64::new(0));

        let drain = tokio::spawn({
            let playing = playing.clone();
            let frames_seen = frames_seen.clone();
            async move {
                while let Some(frame) = stream.recv().await {
                    let seen = frames_seen.fetch_add(1, Ordering::Relaxed) + 1;
                    if playing.load(Ordering::Relaxed) && seen % 100 == 0 {
                        debug!("Playback alive, {} frames ({} samples each)", seen, frame.len());
                    } else {
                        trace!("Drained frame {} ({} samples)", seen, frame.len());
                    }
                }
                debug!("Remote stream ended, sink drain exiting");
            }
        });

        SinkHandle::new(playing, frames_seen, self.policy, drain)
    }
}
