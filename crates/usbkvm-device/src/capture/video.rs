//! The multipart video feed and its takeover arbitration.
//!
//! A feed is an HTTP body of `multipart/x-mixed-replace` parts, one JPEG
//! per part.  At most one consumer streams at a time: when a second one
//! connects it signals takeover, the incumbent emits a final bundled
//! "stream taken over" JPEG and exits, and the newcomer picks the feed
//! up at the next frame boundary.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::capture::CaptureSupervisor;
use crate::error::DeviceError;

/// Boundary string for the multipart response.
pub const MULTIPART_BOUNDARY: &str = "usbkvmframe";

/// The JPEG shown as the final part of a displaced stream.
pub static STREAM_TAKEOVER_JPG: &[u8] = include_bytes!("stream_takeover.jpg");

/// Depth of the body-chunk channel between the pump task and the HTTP
/// response writer.
const FEED_CHANNEL_DEPTH: usize = 8;

/// A running video feed: the response content type plus a channel of
/// ready-to-send body chunks.
#[derive(Debug)]
pub struct VideoFeed {
    pub content_type: String,
    pub chunks: mpsc::Receiver<Vec<u8>>,
}

/// Renders one multipart part around a JPEG frame.
///
/// The handoff frame additionally carries `Content-Length`, which lets
/// the browser finish rendering it even though the connection is about
/// to close.
fn jpeg_part(frame: &[u8], with_length: bool) -> Vec<u8> {
    let header = if with_length {
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.len()
        )
    } else {
        format!("--{MULTIPART_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n")
    };
    let mut part = Vec::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part
}

/// Decrements the access count when a consumer exits, however it exits.
struct AccessGuard(Arc<CaptureSupervisor>);

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.0.access_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl CaptureSupervisor {
    /// Opens a video feed, evicting the current consumer if there is one.
    pub async fn video_feed(self: Arc<Self>) -> Result<VideoFeed, DeviceError> {
        let frames = {
            let video = self.video.lock().await;
            let stream = video.as_ref().ok_or(DeviceError::NotRunning)?;
            stream.subscribe()
        };

        // Someone is already streaming: ask them to leave.  The channel
        // has capacity 1, so repeated signals collapse into one.
        if self.access_count.load(Ordering::Relaxed) >= 1 {
            info!("video consumer active; signalling takeover");
            let _ = self.takeover_tx.try_send(());
        }

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(FEED_CHANNEL_DEPTH);
        let supervisor = Arc::clone(&self);

        tokio::spawn(async move {
            // The incumbent holds this lock while streaming; acquiring it
            // means they have emitted their handoff frame and left.
            let mut takeover_rx = supervisor.takeover_rx.lock().await;

            // Drop any stale signal — including our own, if the previous
            // consumer disconnected before consuming it.
            while takeover_rx.try_recv().is_ok() {}

            supervisor.access_count.fetch_add(1, Ordering::Relaxed);
            let _guard = AccessGuard(Arc::clone(&supervisor));

            let mut frames = frames;
            loop {
                let frame = tokio::select! {
                    received = frames.recv() => match received {
                        Ok(frame) => frame,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "video consumer lagged; frames dropped");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("video capture stopped; feed ends");
                            break;
                        }
                    },
                    _ = out_tx.closed() => {
                        debug!("video client disconnected");
                        break;
                    }
                };

                if frame.is_empty() {
                    continue;
                }
                if out_tx.send(jpeg_part(&frame, false)).await.is_err() {
                    break;
                }

                // Checked after each delivered frame, matching the frame
                // boundary the displaced browser can still render at.
                if takeover_rx.try_recv().is_ok() {
                    let _ = out_tx.send(jpeg_part(STREAM_TAKEOVER_JPG, true)).await;
                    info!("video stream taken over by another client");
                    break;
                }
            }
        });

        Ok(VideoFeed {
            content_type: format!("multipart/x-mixed-replace; boundary={MULTIPART_BOUNDARY}"),
            chunks: out_rx,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::mock::MockVideoBackend;
    use crate::capture::backend::Resolution;
    use crate::capture::{AudioConfig, CaptureConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn supervisor_with_mock() -> (Arc<CaptureSupervisor>, Arc<MockVideoBackend>) {
        let backend = Arc::new(MockVideoBackend::capture_card());
        let supervisor = Arc::new(CaptureSupervisor::new(
            CaptureConfig {
                video_device: PathBuf::from("/dev/video0"),
                audio_device: PathBuf::from("/dev/snd/pcmC1D0c"),
                audio: AudioConfig::default(),
            },
            backend.clone() as Arc<dyn crate::capture::VideoBackend>,
        ));
        (supervisor, backend)
    }

    async fn start_default(supervisor: &Arc<CaptureSupervisor>) {
        supervisor
            .start_video(Resolution {
                width: 1920,
                height: 1080,
                fps: 25,
            })
            .await
            .unwrap();
    }

    fn frame(tag: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, tag, 0xFF, 0xD9]
    }

    #[tokio::test]
    async fn test_feed_delivers_frames_as_parts() {
        let (supervisor, backend) = supervisor_with_mock();
        start_default(&supervisor).await;

        let mut feed = supervisor.clone().video_feed().await.unwrap();
        assert!(feed.content_type.contains("multipart/x-mixed-replace"));

        // Give the pump task a moment to subscribe and acquire the lock.
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.frame_feed().unwrap().send(frame(1)).unwrap();

        let part = feed.chunks.recv().await.expect("a part should arrive");
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--usbkvmframe\r\nContent-Type: image/jpeg"));
        assert!(part.windows(5).any(|w| w == frame(1).as_slice()));
    }

    #[tokio::test]
    async fn test_second_consumer_displaces_first_with_handoff() {
        let (supervisor, backend) = supervisor_with_mock();
        start_default(&supervisor).await;

        let mut first = supervisor.clone().video_feed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First consumer streams one frame.
        backend.frame_feed().unwrap().send(frame(1)).unwrap();
        first.chunks.recv().await.expect("first frame");

        // Second consumer arrives and signals takeover.
        let mut second = supervisor.clone().video_feed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The signal is observed at the next frame boundary.
        backend.frame_feed().unwrap().send(frame(2)).unwrap();
        let _regular = first.chunks.recv().await.expect("second frame");
        let handoff = first.chunks.recv().await.expect("handoff part");
        let text = String::from_utf8_lossy(&handoff);
        assert!(
            text.contains("Content-Length"),
            "handoff part must carry Content-Length"
        );
        assert!(
            handoff
                .windows(STREAM_TAKEOVER_JPG.len())
                .any(|w| w == STREAM_TAKEOVER_JPG),
            "handoff part must contain the bundled JPEG"
        );
        // And the stream ends for the displaced consumer.
        assert!(first.chunks.recv().await.is_none());

        // The new consumer now owns the feed.  It subscribed before the
        // displacement completed, so frame 2 may still be buffered ahead
        // of frame 3.
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.frame_feed().unwrap().send(frame(3)).unwrap();
        let mut saw_frame_3 = false;
        for _ in 0..2 {
            let part = second.chunks.recv().await.expect("new consumer frame");
            if part.windows(5).any(|w| w == frame(3).as_slice()) {
                saw_frame_3 = true;
                break;
            }
        }
        assert!(saw_frame_3, "new consumer must receive the live feed");
    }

    #[tokio::test]
    async fn test_feed_without_started_video_fails() {
        let (supervisor, _backend) = supervisor_with_mock();
        assert!(matches!(
            supervisor.clone().video_feed().await.unwrap_err(),
            DeviceError::NotRunning
        ));
    }

    #[tokio::test]
    async fn test_empty_frames_are_skipped() {
        let (supervisor, backend) = supervisor_with_mock();
        start_default(&supervisor).await;
        let mut feed = supervisor.clone().video_feed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let tx = backend.frame_feed().unwrap();
        tx.send(Vec::new()).unwrap();
        tx.send(frame(7)).unwrap();

        let part = feed.chunks.recv().await.expect("non-empty frame");
        assert!(part.windows(5).any(|w| w == frame(7).as_slice()));
    }

    #[test]
    fn test_takeover_jpeg_is_a_jpeg() {
        assert_eq!(&STREAM_TAKEOVER_JPG[..2], &[0xFF, 0xD8]);
        assert_eq!(
            &STREAM_TAKEOVER_JPG[STREAM_TAKEOVER_JPG.len() - 2..],
            &[0xFF, 0xD9]
        );
    }
}
