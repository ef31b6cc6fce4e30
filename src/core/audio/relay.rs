//! Audio relay.
//!
//! Bridges the capture and playback devices to the session layer without
//! blocking either side. Capture runs on a dedicated thread feeding a
//! bounded drop-oldest queue; an async forwarder drains the queue into the
//! channel returned by [`AudioRelay::start_capture`]. Playback runs on a
//! dedicated blocking worker that owns the output device; a failed write
//! drops the frame and is counted, it never tears playback down.
//!
//! The microphone and speaker are exclusive per-process resources: one relay
//! holds them at a time, and `shutdown()` is the release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::device::AudioBackend;
use super::{AudioConfig, AudioError, AudioFrame, BYTES_PER_SAMPLE, FrameQueue};

/// Capture chunk length in milliseconds.
const CAPTURE_CHUNK_MS: usize = 20;

/// Playback worker queue depth in frames.
const PLAYBACK_QUEUE_FRAMES: usize = 64;

enum PlaybackCmd {
    Frame(AudioFrame),
    Route(bool),
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    forwarder: tokio::task::JoinHandle<()>,
    queue: FrameQueue,
}

struct PlaybackWorker {
    tx: mpsc::Sender<PlaybackCmd>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Duplex bridge between device audio and the protocol layer.
pub struct AudioRelay {
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
    capture: Option<CaptureWorker>,
    playback: Option<PlaybackWorker>,
    muted: bool,
    speaker_on: bool,
    // Carried across capture restarts so frame sequence numbers stay
    // strictly increasing for the lifetime of the relay.
    capture_seq: Arc<AtomicU64>,
    capture_drops: Arc<AtomicU64>,
    playback_failures: Arc<AtomicU64>,
    playback_seq: u64,
}

impl AudioRelay {
    /// Create a relay over the given backend. Devices are not opened until
    /// capture starts or the first playback frame arrives.
    pub fn new(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Self {
        Self {
            backend,
            config,
            capture: None,
            playback: None,
            muted: false,
            speaker_on: false,
            capture_seq: Arc::new(AtomicU64::new(0)),
            capture_drops: Arc::new(AtomicU64::new(0)),
            playback_failures: Arc::new(AtomicU64::new(0)),
            playback_seq: 0,
        }
    }

    /// Open the capture device and start delivering sequence-numbered frames
    /// on the returned channel. Delivery never blocks the capture thread: a
    /// stalled consumer costs dropped (counted) frames, not latency.
    ///
    /// Fails with [`AudioError::DeviceUnavailable`] if the device cannot be
    /// opened or capture is already running.
    pub fn start_capture(&mut self) -> Result<mpsc::Receiver<AudioFrame>, AudioError> {
        if self.capture.is_some() {
            return Err(AudioError::DeviceUnavailable(
                "capture already running".into(),
            ));
        }
        if self.muted {
            tracing::debug!("Starting capture while the mute flag is set");
        }

        let mut device = self.backend.open_capture(&self.config)?;
        let queue = FrameQueue::new(self.config.capture_queue_frames);
        let chunk_bytes =
            self.config.sample_rate as usize / 1000 * CAPTURE_CHUNK_MS * BYTES_PER_SAMPLE;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let capture_queue = queue.clone();
        let seq_counter = self.capture_seq.clone();

        let thread = thread::Builder::new()
            .name("capture-relay".into())
            .spawn(move || {
                let mut buf = vec![0u8; chunk_bytes];
                while !stop_flag.load(Ordering::Relaxed) {
                    match device.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            let seq = seq_counter.fetch_add(1, Ordering::Relaxed);
                            capture_queue
                                .push(AudioFrame::capture(seq, Bytes::copy_from_slice(&buf[..n])));
                        }
                        Err(e) => {
                            tracing::error!("Capture read failed, stopping worker: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(self.config.capture_queue_frames);
        let forward_queue = queue.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let frame = forward_queue.pop().await;
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.capture = Some(CaptureWorker {
            stop,
            thread: Some(thread),
            forwarder,
            queue,
        });
        tracing::info!("Capture started");
        Ok(frame_rx)
    }

    /// Stop capture and release the device. Idempotent; safe when not
    /// capturing.
    pub fn stop_capture(&mut self) {
        if let Some(mut worker) = self.capture.take() {
            worker.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
            worker.forwarder.abort();
            self.capture_drops
                .fetch_add(worker.queue.dropped(), Ordering::Relaxed);
            tracing::info!("Capture stopped");
        }
    }

    /// Whether the capture device is held.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Queue a decoded frame for the speaker. The output device is opened
    /// lazily on the first call and persists until [`Self::stop_playback`].
    /// A device error mid-write drops the frame and bumps the failure
    /// counter without tearing playback down.
    pub fn enqueue_playback(&mut self, pcm: Bytes) -> Result<(), AudioError> {
        if self.playback.is_none() {
            self.open_playback()?;
        }
        let seq = self.playback_seq;
        self.playback_seq += 1;
        let frame = AudioFrame::playback(seq, pcm);

        let Some(worker) = self.playback.as_ref() else {
            return Err(AudioError::PlaybackFailure("playback worker gone".into()));
        };
        match worker.tx.try_send(PlaybackCmd::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The blocking device write is the backpressure; a full queue
                // means the device has fallen behind by several frames.
                tracing::debug!(seq, "Playback queue full, dropping frame");
                self.playback_failures.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.playback_failures.fetch_add(1, Ordering::Relaxed);
                Err(AudioError::PlaybackFailure("playback worker gone".into()))
            }
        }
    }

    fn open_playback(&mut self) -> Result<(), AudioError> {
        let mut device = self.backend.open_playback(&self.config)?;
        if let Err(e) = device.set_route(self.speaker_on) {
            tracing::warn!("Failed to apply initial output route: {}", e);
        }

        let (tx, mut rx) = mpsc::channel::<PlaybackCmd>(PLAYBACK_QUEUE_FRAMES);
        let failures = self.playback_failures.clone();
        let thread = thread::Builder::new()
            .name("playback-relay".into())
            .spawn(move || {
                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        PlaybackCmd::Frame(frame) => {
                            if let Err(e) = device.write(&frame.pcm) {
                                failures.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(seq = frame.seq, "Playback write failed: {}", e);
                            }
                        }
                        PlaybackCmd::Route(speaker) => {
                            if let Err(e) = device.set_route(speaker) {
                                tracing::warn!("Failed to switch output route: {}", e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        self.playback = Some(PlaybackWorker {
            tx,
            thread: Some(thread),
        });
        tracing::info!("Playback device opened");
        Ok(())
    }

    /// Stop playback and release the output device. Idempotent.
    pub fn stop_playback(&mut self) {
        if let Some(mut worker) = self.playback.take() {
            drop(worker.tx);
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
            tracing::info!("Playback stopped");
        }
    }

    /// Whether the playback device is held.
    pub fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    /// Set the mute flag. Muting while capturing stops capture and releases
    /// the microphone; unmuting never auto-resumes, the session layer must
    /// restart capture explicitly.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if muted && self.is_capturing() {
            self.stop_capture();
        }
    }

    /// Current mute flag.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Switch the output route. Independent of capture/playback state; takes
    /// effect immediately when the output device is open, otherwise on open.
    pub fn set_speaker_route(&mut self, speaker: bool) {
        self.speaker_on = speaker;
        if let Some(worker) = self.playback.as_ref()
            && worker.tx.try_send(PlaybackCmd::Route(speaker)).is_err()
        {
            tracing::warn!("Route change not delivered to playback worker");
        }
    }

    /// Current output route.
    pub fn is_speaker_on(&self) -> bool {
        self.speaker_on
    }

    /// Frames discarded on the capture path because the consumer stalled.
    pub fn dropped_frames(&self) -> u64 {
        let live = self
            .capture
            .as_ref()
            .map(|w| w.queue.dropped())
            .unwrap_or(0);
        self.capture_drops.load(Ordering::Relaxed) + live
    }

    /// Playback frames lost to device errors or a saturated queue.
    pub fn playback_failures(&self) -> u64 {
        self.playback_failures.load(Ordering::Relaxed)
    }

    /// Release both devices. Safe to call multiple times and from any state.
    pub fn shutdown(&mut self) {
        self.stop_capture();
        self.stop_playback();
    }
}

impl Drop for AudioRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::FrameSource;
    use crate::core::audio::device::{CaptureDevice, PlaybackDevice};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Backend with a scripted capture source and a recording sink.
    struct MockBackend {
        capture_chunks: Vec<Vec<u8>>,
        fail_capture_open: bool,
        written: Arc<Mutex<Vec<u8>>>,
        fail_writes: bool,
        routes: Arc<Mutex<Vec<bool>>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                capture_chunks: vec![vec![1u8; 64], vec![2u8; 64], vec![3u8; 64]],
                fail_capture_open: false,
                written: Arc::new(Mutex::new(Vec::new())),
                fail_writes: false,
                routes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct MockCapture {
        chunks: Vec<Vec<u8>>,
        idx: usize,
    }

    impl CaptureDevice for MockCapture {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
            if self.idx >= self.chunks.len() {
                thread::sleep(Duration::from_millis(5));
                return Ok(0);
            }
            let chunk = &self.chunks[self.idx];
            self.idx += 1;
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    struct MockPlayback {
        written: Arc<Mutex<Vec<u8>>>,
        fail_writes: bool,
        routes: Arc<Mutex<Vec<bool>>>,
    }

    impl PlaybackDevice for MockPlayback {
        fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
            if self.fail_writes {
                return Err(AudioError::PlaybackFailure("mock failure".into()));
            }
            self.written.lock().extend_from_slice(pcm);
            Ok(())
        }

        fn set_route(&mut self, speaker: bool) -> Result<(), AudioError> {
            self.routes.lock().push(speaker);
            Ok(())
        }
    }

    impl AudioBackend for MockBackend {
        fn open_capture(&self, _: &AudioConfig) -> Result<Box<dyn CaptureDevice>, AudioError> {
            if self.fail_capture_open {
                return Err(AudioError::DeviceUnavailable("mock".into()));
            }
            Ok(Box::new(MockCapture {
                chunks: self.capture_chunks.clone(),
                idx: 0,
            }))
        }

        fn open_playback(&self, _: &AudioConfig) -> Result<Box<dyn PlaybackDevice>, AudioError> {
            Ok(Box::new(MockPlayback {
                written: self.written.clone(),
                fail_writes: self.fail_writes,
                routes: self.routes.clone(),
            }))
        }
    }

    fn relay_with(backend: MockBackend) -> AudioRelay {
        AudioRelay::new(Arc::new(backend), AudioConfig::default())
    }

    #[tokio::test]
    async fn test_capture_delivers_ordered_frames() {
        let mut relay = relay_with(MockBackend::new());
        let mut rx = relay.start_capture().unwrap();

        for expected_seq in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame in time")
                .expect("channel open");
            assert_eq!(frame.seq, expected_seq);
            assert_eq!(frame.source, FrameSource::Capture);
        }
        relay.stop_capture();
    }

    #[tokio::test]
    async fn test_sequence_numbers_survive_capture_restart() {
        let mut relay = relay_with(MockBackend::new());

        let mut rx = relay.start_capture().unwrap();
        let mut last_seq = 0;
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame in time")
                .expect("channel open");
            last_seq = frame.seq;
        }
        relay.stop_capture();

        // A restart (e.g. after mute/unmute) must keep seq strictly
        // increasing, never start over.
        let mut rx = relay.start_capture().unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        assert!(
            frame.seq > last_seq,
            "seq went backwards across restart: {} then {}",
            last_seq,
            frame.seq
        );
        relay.stop_capture();
    }

    #[tokio::test]
    async fn test_double_start_capture_rejected() {
        let mut relay = relay_with(MockBackend::new());
        let _rx = relay.start_capture().unwrap();
        match relay.start_capture() {
            Err(AudioError::DeviceUnavailable(_)) => {}
            other => panic!("expected DeviceUnavailable, got {:?}", other.map(|_| ())),
        }
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_capture_open_failure() {
        let backend = MockBackend {
            fail_capture_open: true,
            ..MockBackend::new()
        };
        let mut relay = relay_with(backend);
        assert!(matches!(
            relay.start_capture(),
            Err(AudioError::DeviceUnavailable(_))
        ));
        assert!(!relay.is_capturing());
    }

    #[tokio::test]
    async fn test_stop_capture_idempotent() {
        let mut relay = relay_with(MockBackend::new());
        relay.stop_capture();
        let _rx = relay.start_capture().unwrap();
        relay.stop_capture();
        relay.stop_capture();
        assert!(!relay.is_capturing());
    }

    #[tokio::test]
    async fn test_mute_stops_capture_and_does_not_resume() {
        let mut relay = relay_with(MockBackend::new());
        let _rx = relay.start_capture().unwrap();
        relay.set_muted(true);
        assert!(!relay.is_capturing());
        relay.set_muted(false);
        assert!(!relay.is_capturing(), "unmute must not auto-resume");
    }

    #[tokio::test]
    async fn test_playback_writes_frames() {
        let backend = MockBackend::new();
        let written = backend.written.clone();
        let mut relay = relay_with(backend);

        relay.enqueue_playback(Bytes::from(vec![9u8; 32])).unwrap();
        relay.enqueue_playback(Bytes::from(vec![8u8; 32])).unwrap();
        relay.stop_playback();

        let bytes = written.lock();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..32], &[9u8; 32][..]);
        assert_eq!(&bytes[32..], &[8u8; 32][..]);
    }

    #[tokio::test]
    async fn test_playback_failure_counted_not_fatal() {
        let backend = MockBackend {
            fail_writes: true,
            ..MockBackend::new()
        };
        let mut relay = relay_with(backend);

        relay.enqueue_playback(Bytes::from(vec![1u8; 16])).unwrap();
        relay.stop_playback();
        assert_eq!(relay.playback_failures(), 1);
    }

    #[tokio::test]
    async fn test_speaker_route_forwarded() {
        let backend = MockBackend::new();
        let routes = backend.routes.clone();
        let mut relay = relay_with(backend);

        relay.set_speaker_route(true);
        assert!(relay.is_speaker_on());

        // Route applied at open, then live switches forwarded.
        relay.enqueue_playback(Bytes::from(vec![0u8; 8])).unwrap();
        relay.set_speaker_route(false);
        relay.stop_playback();

        let seen = routes.lock();
        assert_eq!(seen.as_slice(), &[true, false]);
    }

    #[tokio::test]
    async fn test_shutdown_from_any_state() {
        let mut relay = relay_with(MockBackend::new());
        relay.shutdown();
        let _rx = relay.start_capture().unwrap();
        relay.enqueue_playback(Bytes::from(vec![0u8; 8])).unwrap();
        relay.shutdown();
        relay.shutdown();
        assert!(!relay.is_capturing());
        assert!(!relay.is_playing());
    }
}
