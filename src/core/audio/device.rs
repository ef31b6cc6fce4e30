//! Device trait seam.
//!
//! The relay never talks to hardware directly; it opens devices through
//! [`AudioBackend`]. Production uses [`super::CpalBackend`]; tests plug in
//! scripted devices.

use super::{AudioConfig, AudioError};

/// Blocking microphone handle.
///
/// `read` fills `buf` with PCM16 bytes and returns the byte count, blocking
/// until audio is available. The device is released on drop.
pub trait CaptureDevice: Send {
    /// Read the next chunk of captured audio.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;
}

/// Blocking speaker handle.
///
/// `write` appends PCM16 bytes to the streaming output; backpressure is the
/// write blocking. The device is released on drop.
pub trait PlaybackDevice: Send {
    /// Append PCM bytes to the output stream.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Switch the output route between speaker and earpiece.
    fn set_route(&mut self, speaker: bool) -> Result<(), AudioError>;
}

/// Factory for the exclusive per-process capture and playback devices.
pub trait AudioBackend: Send + Sync {
    /// Open the capture device at the configured rate and buffer size.
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>, AudioError>;

    /// Open the playback device.
    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>, AudioError>;
}
