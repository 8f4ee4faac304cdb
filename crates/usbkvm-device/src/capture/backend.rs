//! The seam to the external V4L2 capture facility.
//!
//! The supervisor does not speak V4L2 itself — it consumes a facility
//! that can (a) enumerate a device's discrete `(resolution, fps)` modes
//! and (b) produce a channel of encoded MJPEG frames once started with a
//! resolution.  Putting that behind a trait keeps the arbitration logic
//! (takeover, exclusivity) testable with a mock that feeds synthetic
//! frames, while production uses the `v4l2-ctl`-based implementation in
//! [`crate::capture::v4l2`].

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::error::DeviceError;

/// Number of frames buffered between the capture source and consumers.
pub const FRAME_BUFFER_DEPTH: usize = 8;

/// A capture mode request: width × height at a frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One discrete frame size and the rates the device supports for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeInfo {
    pub width: u32,
    pub height: u32,
    pub fps: Vec<u32>,
}

/// One pixel format with its supported sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    pub format: String,
    pub sizes: Vec<SizeInfo>,
}

/// Checks whether `resolution` appears in the enumerated formats.
pub fn supports_resolution(formats: &[FormatInfo], resolution: Resolution) -> bool {
    formats.iter().any(|format| {
        format.sizes.iter().any(|size| {
            size.width == resolution.width
                && size.height == resolution.height
                && size.fps.contains(&resolution.fps)
        })
    })
}

/// Total number of discrete sizes across all formats.
///
/// Capture cards advertise a spread of modes; a webcam-style single-mode
/// node is not the HDMI input we are looking for.
pub fn discrete_mode_count(formats: &[FormatInfo]) -> usize {
    formats.iter().map(|f| f.sizes.len()).sum()
}

/// A started capture: a broadcast feed of encoded JPEG frames plus a
/// human-readable description for the instance listing.
pub struct VideoStream {
    description: String,
    frames: broadcast::Sender<Vec<u8>>,
    stop: Option<oneshot::Sender<()>>,
}

impl VideoStream {
    pub fn new(
        description: String,
        frames: broadcast::Sender<Vec<u8>>,
        stop: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            description,
            frames,
            stop,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Attaches a consumer to the frame feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frames.subscribe()
    }

    /// Cancels the capture context; the producing task kills its source.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The external V4L2 facility the supervisor consumes.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    /// Whether the node is a video *capture* device at all.
    async fn is_capture_device(&self, device: &Path) -> Result<bool, DeviceError>;

    /// Enumerates the device's discrete `(format, size, fps)` modes.
    async fn formats(&self, device: &Path) -> Result<Vec<FormatInfo>, DeviceError>;

    /// Whether the node looks like a capture card (several discrete
    /// modes) rather than a plain webcam.
    async fn is_capture_card(&self, device: &Path) -> Result<bool, DeviceError> {
        if !self.is_capture_device(device).await? {
            return Ok(false);
        }
        let formats = self.formats(device).await?;
        Ok(discrete_mode_count(&formats) > 1)
    }

    /// Starts MJPEG capture at `resolution` and returns the frame feed.
    async fn open(&self, device: &Path, resolution: Resolution)
        -> Result<VideoStream, DeviceError>;
}

// ── Mock ──────────────────────────────────────────────────────────────────────

/// Records-and-replays backend for supervisor tests: advertises a fixed
/// format table and lets the test feed frames by hand.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    pub struct MockVideoBackend {
        formats: Vec<FormatInfo>,
        feed: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
    }

    impl MockVideoBackend {
        pub fn new(formats: Vec<FormatInfo>) -> Self {
            Self {
                formats,
                feed: Mutex::new(None),
            }
        }

        /// A backend advertising 1920×1080 and 1280×720 at 25/30 fps —
        /// the shape of a typical MS2109 stick.
        pub fn capture_card() -> Self {
            Self::new(vec![FormatInfo {
                format: "MJPG".to_string(),
                sizes: vec![
                    SizeInfo {
                        width: 1920,
                        height: 1080,
                        fps: vec![25, 30],
                    },
                    SizeInfo {
                        width: 1280,
                        height: 720,
                        fps: vec![25, 30, 60],
                    },
                ],
            }])
        }

        /// Handle for pushing synthetic frames into an opened stream.
        pub fn frame_feed(&self) -> Option<broadcast::Sender<Vec<u8>>> {
            self.feed.lock().clone()
        }
    }

    #[async_trait]
    impl VideoBackend for MockVideoBackend {
        async fn is_capture_device(&self, _device: &Path) -> Result<bool, DeviceError> {
            Ok(true)
        }

        async fn formats(&self, _device: &Path) -> Result<Vec<FormatInfo>, DeviceError> {
            Ok(self.formats.clone())
        }

        async fn open(
            &self,
            device: &Path,
            resolution: Resolution,
        ) -> Result<VideoStream, DeviceError> {
            let (tx, _) = broadcast::channel(FRAME_BUFFER_DEPTH);
            *self.feed.lock() = Some(tx.clone());
            Ok(VideoStream::new(
                format!(
                    "mock {} [{}x{}] {} fps",
                    device.display(),
                    resolution.width,
                    resolution.height,
                    resolution.fps
                ),
                tx,
                None,
            ))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn formats() -> Vec<FormatInfo> {
        vec![FormatInfo {
            format: "MJPG".into(),
            sizes: vec![
                SizeInfo {
                    width: 1920,
                    height: 1080,
                    fps: vec![25, 30],
                },
                SizeInfo {
                    width: 1280,
                    height: 720,
                    fps: vec![60],
                },
            ],
        }]
    }

    #[test]
    fn test_supports_resolution_exact_match_only() {
        let f = formats();
        let hit = Resolution {
            width: 1920,
            height: 1080,
            fps: 25,
        };
        assert!(supports_resolution(&f, hit));

        // Right size, wrong rate.
        assert!(!supports_resolution(
            &f,
            Resolution {
                width: 1920,
                height: 1080,
                fps: 60
            }
        ));
        // Unknown size entirely.
        assert!(!supports_resolution(
            &f,
            Resolution {
                width: 640,
                height: 480,
                fps: 25
            }
        ));
    }

    #[test]
    fn test_discrete_mode_count_sums_all_formats() {
        assert_eq!(discrete_mode_count(&formats()), 2);
        assert_eq!(discrete_mode_count(&[]), 0);
    }

    #[tokio::test]
    async fn test_mock_backend_feeds_subscribers() {
        let backend = mock::MockVideoBackend::capture_card();
        let stream = backend
            .open(
                Path::new("/dev/video0"),
                Resolution {
                    width: 1920,
                    height: 1080,
                    fps: 25,
                },
            )
            .await
            .unwrap();

        let mut rx = stream.subscribe();
        backend.frame_feed().unwrap().send(vec![0xFF, 0xD8]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_mock_backend_is_capture_card() {
        let backend = mock::MockVideoBackend::capture_card();
        assert!(backend
            .is_capture_card(Path::new("/dev/video0"))
            .await
            .unwrap());
    }
}
