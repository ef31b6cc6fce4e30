//! cpal-backed audio devices.
//!
//! cpal streams are callback-driven and not `Send`, so each device owns a
//! dedicated thread that builds the stream and bridges it to the blocking
//! [`CaptureDevice`]/[`PlaybackDevice`] interface: the input callback pushes
//! chunks into a channel, the output callback drains a shared sample deque.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize};
use parking_lot::Mutex;

use super::device::{AudioBackend, CaptureDevice, PlaybackDevice};
use super::{AudioConfig, AudioError};

/// How long a blocking read waits before returning an empty chunk.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Playback deque high-water mark in samples (~1s at 24 kHz). Writes block
/// until the stream drains below this, which is the backpressure the relay
/// relies on.
const PLAYBACK_HIGH_WATER: usize = 24_000;

/// Device worker poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const ROUTE_EARPIECE: u8 = 0;
const ROUTE_SPEAKER: u8 = 1;

/// Production backend using the platform default audio host.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    /// Create a backend on the default host.
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>, AudioError> {
        CpalCapture::open(config).map(|d| Box::new(d) as Box<dyn CaptureDevice>)
    }

    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>, AudioError> {
        CpalPlayback::open(config).map(|d| Box::new(d) as Box<dyn PlaybackDevice>)
    }
}

/// Resolve the stream config: mono PCM16 at the configured rate, with the
/// buffer sized as a multiple of the platform minimum when it is known.
fn stream_config(
    config: &AudioConfig,
    supported_buffer: &SupportedBufferSize,
) -> StreamConfig {
    let buffer_size = match supported_buffer {
        SupportedBufferSize::Range { min, .. } => {
            BufferSize::Fixed(min.saturating_mul(config.buffer_multiple).max(*min))
        }
        SupportedBufferSize::Unknown => BufferSize::Default,
    };
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size,
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// =============================================================================
// Capture
// =============================================================================

struct CpalCapture {
    chunks: std_mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let (chunk_tx, chunk_rx) = std_mpsc::channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let config = config.clone();

        let worker = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(&config, chunk_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !stop_flag.load(Ordering::Relaxed) {
                    thread::sleep(POLL_INTERVAL);
                }
                drop(stream);
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("capture worker died".into()))??;

        Ok(Self {
            chunks: chunk_rx,
            pending: VecDeque::new(),
            stop,
            worker: Some(worker),
        })
    }
}

fn build_input_stream(
    config: &AudioConfig,
    chunk_tx: std_mpsc::Sender<Vec<u8>>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no input device".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    let stream_config = stream_config(config, supported.buffer_size());

    let err_fn = |e: cpal::StreamError| tracing::warn!("Capture stream error: {}", e);

    let stream = match supported.sample_format() {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| {
                let bytes: Vec<u8> = data.iter().flat_map(|s| s.to_le_bytes()).collect();
                let _ = chunk_tx.send(bytes);
            },
            err_fn,
            None,
        ),
        _ => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| {
                let bytes: Vec<u8> = data
                    .iter()
                    .flat_map(|s| f32_to_i16(*s).to_le_bytes())
                    .collect();
                let _ = chunk_tx.send(bytes);
            },
            err_fn,
            None,
        ),
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

impl CaptureDevice for CpalCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.pending.is_empty() {
            match self.chunks.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::CaptureFailure("capture stream gone".into()));
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// =============================================================================
// Playback
// =============================================================================

struct CpalPlayback {
    samples: Arc<Mutex<VecDeque<i16>>>,
    route: Arc<AtomicU8>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalPlayback {
    fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let samples: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let route = Arc::new(AtomicU8::new(ROUTE_EARPIECE));
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

        let worker = {
            let samples = samples.clone();
            let route = route.clone();
            let alive = alive.clone();
            let stop = stop.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    let mut current_route = route.load(Ordering::Relaxed);
                    let mut stream = match build_output_stream(&config, &samples, current_route) {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            Some(stream)
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    while !stop.load(Ordering::Relaxed) {
                        let wanted = route.load(Ordering::Relaxed);
                        if wanted != current_route {
                            // Route change rebuilds the stream on the new output.
                            drop(stream.take());
                            match build_output_stream(&config, &samples, wanted) {
                                Ok(s) => {
                                    current_route = wanted;
                                    stream = Some(s);
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to switch output route: {}", e);
                                    alive.store(false, Ordering::Relaxed);
                                    return;
                                }
                            }
                        }
                        thread::sleep(POLL_INTERVAL);
                    }
                    drop(stream);
                    alive.store(false, Ordering::Relaxed);
                })
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        };

        ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("playback worker died".into()))??;

        Ok(Self {
            samples,
            route,
            alive,
            stop,
            worker: Some(worker),
        })
    }
}

fn build_output_stream(
    config: &AudioConfig,
    samples: &Arc<Mutex<VecDeque<i16>>>,
    route: u8,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();

    // Prefer a device whose name matches the requested route; the default
    // output is the fallback on hosts that expose a single device.
    let wanted = if route == ROUTE_SPEAKER {
        "speaker"
    } else {
        "earpiece"
    };
    let device = host
        .output_devices()
        .ok()
        .and_then(|mut devices| {
            devices.find(|d| {
                d.name()
                    .map(|n| n.to_lowercase().contains(wanted))
                    .unwrap_or(false)
            })
        })
        .or_else(|| host.default_output_device())
        .ok_or_else(|| AudioError::DeviceUnavailable("no output device".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    let stream_config = stream_config(config, supported.buffer_size());

    let err_fn = |e: cpal::StreamError| tracing::warn!("Playback stream error: {}", e);

    let stream = match supported.sample_format() {
        SampleFormat::I16 => {
            let samples = samples.clone();
            device.build_output_stream(
                &stream_config,
                move |out: &mut [i16], _| {
                    let mut queued = samples.lock();
                    for slot in out.iter_mut() {
                        *slot = queued.pop_front().unwrap_or(0);
                    }
                },
                err_fn,
                None,
            )
        }
        _ => {
            let samples = samples.clone();
            device.build_output_stream(
                &stream_config,
                move |out: &mut [f32], _| {
                    let mut queued = samples.lock();
                    for slot in out.iter_mut() {
                        *slot = queued.pop_front().unwrap_or(0) as f32 / i16::MAX as f32;
                    }
                },
                err_fn,
                None,
            )
        }
    }
    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

impl PlaybackDevice for CpalPlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(AudioError::PlaybackFailure("output stream gone".into()));
        }
        {
            let mut queued = self.samples.lock();
            for pair in pcm.chunks_exact(2) {
                queued.push_back(i16::from_le_bytes([pair[0], pair[1]]));
            }
        }
        // Block until the stream drains below the high-water mark.
        while self.samples.lock().len() > PLAYBACK_HIGH_WATER {
            if !self.alive.load(Ordering::Relaxed) {
                return Err(AudioError::PlaybackFailure("output stream gone".into()));
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn set_route(&mut self, speaker: bool) -> Result<(), AudioError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(AudioError::PlaybackFailure("output stream gone".into()));
        }
        let route = if speaker { ROUTE_SPEAKER } else { ROUTE_EARPIECE };
        self.route.store(route, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
