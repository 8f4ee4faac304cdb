//! Capture supervision: one video feed and one audio feed per instance.
//!
//! The supervisor owns the capture side of a dongle and enforces the two
//! consumer policies:
//!
//! - **Video** is single-consumer with takeover semantics: a new viewer
//!   evicts the current one, who gets to emit one last handoff frame so
//!   the displaced browser shows "stream taken over" instead of a stalled
//!   image.  Arbitration is advisory — an atomic access count plus a
//!   capacity-1 signal channel — because the camera itself does not
//!   corrupt across consumers; only an HTTP response would.
//!
//! - **Audio** is exclusive at the device level: the ALSA node can only
//!   be opened by one recorder, so a new client signals the previous
//!   session to stop and polls for the device to become free.

pub mod audio;
pub mod backend;
pub mod v4l2;
pub mod video;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

pub use audio::{AudioConfig, AudioQuality};
pub use backend::{FormatInfo, Resolution, SizeInfo, VideoBackend, VideoStream};

use crate::error::DeviceError;

/// Capture-side device paths and audio parameters for one instance.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// The UVC capture node, e.g. `/dev/video0`.
    pub video_device: PathBuf,
    /// The ALSA PCM capture node, e.g. `/dev/snd/pcmC1D0c`.
    pub audio_device: PathBuf,
    pub audio: AudioConfig,
}

/// Owns and arbitrates the A/V capture of one instance.
pub struct CaptureSupervisor {
    config: CaptureConfig,
    backend: Arc<dyn VideoBackend>,

    video: Mutex<Option<VideoStream>>,
    capturing: AtomicBool,
    stream_info: parking_lot::Mutex<String>,

    // Video consumer arbitration.  In theory each instance has at most
    // one active viewer; the count is what detects a second one arriving.
    access_count: AtomicUsize,
    takeover_tx: mpsc::Sender<()>,
    takeover_rx: Mutex<mpsc::Receiver<()>>,

    // Audio session control.
    audio_streaming: AtomicBool,
    audio_stop_tx: mpsc::Sender<()>,
    audio_stop_rx: Mutex<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for CaptureSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSupervisor")
            .field("config", &self.config)
            .field("capturing", &self.capturing)
            .field("stream_info", &self.stream_info)
            .field("access_count", &self.access_count)
            .field("audio_streaming", &self.audio_streaming)
            .finish_non_exhaustive()
    }
}

impl CaptureSupervisor {
    pub fn new(config: CaptureConfig, backend: Arc<dyn VideoBackend>) -> Self {
        let (takeover_tx, takeover_rx) = mpsc::channel(1);
        let (audio_stop_tx, audio_stop_rx) = mpsc::channel(1);
        Self {
            config,
            backend,
            video: Mutex::new(None),
            capturing: AtomicBool::new(false),
            stream_info: parking_lot::Mutex::new(String::new()),
            access_count: AtomicUsize::new(0),
            takeover_tx,
            takeover_rx: Mutex::new(takeover_rx),
            audio_streaming: AtomicBool::new(false),
            audio_stop_tx,
            audio_stop_rx: Mutex::new(audio_stop_rx),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Human-readable description of the running video stream.
    pub fn stream_info(&self) -> String {
        self.stream_info.lock().clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Relaxed)
    }

    pub fn is_audio_streaming(&self) -> bool {
        self.audio_streaming.load(Ordering::Relaxed)
    }

    /// Starts video capture at `resolution`.
    ///
    /// Validates the device and the requested mode against the enumerated
    /// capabilities before opening; a mode the device does not advertise
    /// fails with [`DeviceError::UnsupportedResolution`].
    pub async fn start_video(&self, resolution: Resolution) -> Result<(), DeviceError> {
        if self.capturing.load(Ordering::Relaxed) {
            return Err(DeviceError::AlreadyRunning);
        }
        let device = &self.config.video_device;

        if !self.backend.is_capture_device(device).await? {
            return Err(DeviceError::InvalidConfig(
                "device is not a video capture device",
            ));
        }
        let formats = self.backend.formats(device).await?;
        if formats.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "no supported formats found for capture device",
            ));
        }
        if !backend::supports_resolution(&formats, resolution) {
            return Err(DeviceError::UnsupportedResolution {
                width: resolution.width,
                height: resolution.height,
                fps: resolution.fps,
            });
        }

        let stream = self.backend.open(device, resolution).await?;
        *self.stream_info.lock() = stream.description().to_string();
        *self.video.lock().await = Some(stream);
        self.capturing.store(true, Ordering::Relaxed);
        info!(
            device = %device.display(),
            width = resolution.width,
            height = resolution.height,
            fps = resolution.fps,
            "video capture started"
        );
        Ok(())
    }

    /// Cancels the capture context and releases the device.
    pub async fn stop_video(&self) {
        if let Some(mut stream) = self.video.lock().await.take() {
            stream.stop();
        }
        self.capturing.store(false, Ordering::Relaxed);
        self.stream_info.lock().clear();
    }

    /// Stops everything this supervisor runs.
    pub async fn shutdown(&self) {
        self.signal_audio_stop();
        self.stop_video().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
