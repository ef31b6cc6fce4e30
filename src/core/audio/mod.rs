//! Device audio module.
//!
//! Bridges the device microphone and speaker to the realtime protocol layer
//! without blocking either side. Frames are immutable PCM 16-bit mono
//! buffers at 24 kHz, sequence-numbered per source so ordering violations
//! are detectable.
//!
//! # Layout
//!
//! - `device`: the backend trait seam over real hardware
//! - `cpal_backend`: the production cpal implementation
//! - `relay`: capture/playback workers, mute and route state

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

pub mod cpal_backend;
pub mod device;
pub mod relay;

pub use cpal_backend::CpalBackend;
pub use device::{AudioBackend, CaptureDevice, PlaybackDevice};
pub use relay::AudioRelay;

/// Wire and device sample rate in Hz.
pub const SAMPLE_RATE: u32 = 24_000;

/// Bytes per sample (16-bit signed PCM).
pub const BYTES_PER_SAMPLE: usize = 2;

// =============================================================================
// Errors
// =============================================================================

/// Errors from the device audio layer.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The device could not be opened, or is already held
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A capture read failed
    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    /// A playback write failed; the frame was dropped
    #[error("Playback failure: {0}")]
    PlaybackFailure(String),
}

// =============================================================================
// Frames
// =============================================================================

/// Which device a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSource {
    /// Read from the microphone
    Capture,
    /// Queued for the speaker
    Playback,
}

/// One immutable buffer of linear PCM samples (24 kHz, mono, 16-bit signed).
///
/// Sequence numbers are strictly increasing per source. Ownership transfers
/// from producer to consumer; the payload is never mutated after creation.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonically increasing per-source sequence number
    pub seq: u64,
    /// Producing side
    pub source: FrameSource,
    /// Raw PCM16 bytes
    pub pcm: Bytes,
}

impl AudioFrame {
    /// Frame read from the capture device.
    pub fn capture(seq: u64, pcm: Bytes) -> Self {
        Self {
            seq,
            source: FrameSource::Capture,
            pcm,
        }
    }

    /// Frame destined for the playback device.
    pub fn playback(seq: u64, pcm: Bytes) -> Self {
        Self {
            seq,
            source: FrameSource::Playback,
            pcm,
        }
    }

    /// Duration of this frame in milliseconds at the fixed sample rate.
    pub fn duration_ms(&self) -> u64 {
        (self.pcm.len() / BYTES_PER_SAMPLE) as u64 * 1000 / SAMPLE_RATE as u64
    }
}

// =============================================================================
// Audio configuration
// =============================================================================

/// Device-side audio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Capture/playback sample rate in Hz
    pub sample_rate: u32,
    /// Device buffer size as a multiple of the platform minimum
    pub buffer_multiple: u32,
    /// Capture queue depth in frames before drop-oldest kicks in
    pub capture_queue_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            buffer_multiple: 4,
            capture_queue_frames: 32,
        }
    }
}

// =============================================================================
// Bounded drop-oldest frame queue
// =============================================================================

/// Bounded queue between the capture thread and the async forwarder.
///
/// Pushing never blocks: when the consumer stalls and the queue is full the
/// oldest frame is discarded and counted. The capture path stays real-time;
/// dropped frames are observable, not fatal.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<FrameQueueInner>,
}

struct FrameQueueInner {
    frames: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame queue capacity must be non-zero");
        Self {
            inner: Arc::new(FrameQueueInner {
                frames: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Append a frame, discarding the oldest one when full. Callable from a
    /// blocking capture thread.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut frames = self.inner.frames.lock();
            if frames.len() == self.inner.capacity {
                frames.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.inner.notify.notify_one();
    }

    /// Take the oldest frame, waiting until one is available.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.inner.frames.lock().pop_front() {
                return frame;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the oldest frame if one is ready.
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.inner.frames.lock().pop_front()
    }

    /// Frames discarded so far because the consumer stalled.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.frames.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.frames.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
