//! `v4l2-ctl`-based implementation of the capture backend.
//!
//! The V4L2 tooling is treated as the driver boundary: mode enumeration
//! parses `v4l2-ctl --list-formats-ext`, the capture-device probe checks
//! `v4l2-ctl --all`, and the frame source is a long-lived
//! `v4l2-ctl --stream-mmap=8 --stream-to=-` child whose stdout is an
//! MJPEG elementary stream.  That gives the exact capture parameters the
//! MS2109-class sticks want — MJPEG, memory-mapped I/O, an 8-frame ring —
//! without linking a V4L2 stack into the daemon.
//!
//! Frames are recovered from the byte stream by scanning for JPEG
//! start-of-image / end-of-image markers; see [`JpegSplitter`].

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::capture::backend::{
    FormatInfo, Resolution, SizeInfo, VideoBackend, VideoStream, FRAME_BUFFER_DEPTH,
};
use crate::error::DeviceError;

/// Backend speaking to the V4L2 facility through `v4l2-ctl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2CtlBackend;

#[async_trait]
impl VideoBackend for V4l2CtlBackend {
    async fn is_capture_device(&self, device: &Path) -> Result<bool, DeviceError> {
        if tokio::fs::metadata(device).await.is_err() {
            return Err(DeviceError::InvalidConfig(
                "video capture device does not exist",
            ));
        }
        let output = tokio::process::Command::new("v4l2-ctl")
            .arg("--device")
            .arg(device)
            .arg("--all")
            .output()
            .await?;
        // v4l2-ctl exits non-zero for nodes that are not V4L2 devices at
        // all; that is a "no", not a failure.
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(output.status.success() && text.contains("Video Capture"))
    }

    async fn formats(&self, device: &Path) -> Result<Vec<FormatInfo>, DeviceError> {
        let output = tokio::process::Command::new("v4l2-ctl")
            .arg("--list-formats-ext")
            .arg("-d")
            .arg(device)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DeviceError::Tool(format!(
                "v4l2-ctl --list-formats-ext failed for {}",
                device.display()
            )));
        }
        Ok(parse_formats(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn open(
        &self,
        device: &Path,
        resolution: Resolution,
    ) -> Result<VideoStream, DeviceError> {
        let mut child = tokio::process::Command::new("v4l2-ctl")
            .arg("--device")
            .arg(device)
            .arg(format!(
                "--set-fmt-video=width={},height={},pixelformat=MJPG",
                resolution.width, resolution.height
            ))
            .arg(format!("--set-parm={}", resolution.fps))
            .arg(format!("--stream-mmap={FRAME_BUFFER_DEPTH}"))
            .arg("--stream-to=-")
            .arg("--stream-poll")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Tool("v4l2-ctl stdout unavailable".into()))?;

        let (frames_tx, _) = broadcast::channel::<Vec<u8>>(FRAME_BUFFER_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let description = format!(
            "{} - MJPG [{}x{}] {} fps",
            device.display(),
            resolution.width,
            resolution.height,
            resolution.fps
        );

        let device_label = device.display().to_string();
        tokio::spawn(pump_frames(
            child,
            stdout,
            frames_tx.clone(),
            stop_rx,
            device_label,
        ));

        Ok(VideoStream::new(description, frames_tx, Some(stop_tx)))
    }
}

/// Reads the MJPEG stream, splits frames and broadcasts them until the
/// stop signal fires or the child exits.
async fn pump_frames(
    mut child: tokio::process::Child,
    mut stdout: tokio::process::ChildStdout,
    frames_tx: broadcast::Sender<Vec<u8>>,
    mut stop_rx: oneshot::Receiver<()>,
    device_label: String,
) {
    let mut splitter = JpegSplitter::new();
    let mut chunk = vec![0u8; 64 * 1024];
    // The first frame after stream start is undecodable in several
    // browsers on MS2109-series cards; it is dropped at the source so no
    // consumer ever sees it.
    let mut first_frame_discarded = false;

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!(device = %device_label, "video capture stop requested");
                break;
            }
            read = stdout.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => {
                        warn!(device = %device_label, "video stream ended (EOF)");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(device = %device_label, error = %e, "video stream read failed");
                        break;
                    }
                };
                for frame in splitter.push(&chunk[..n]) {
                    if !first_frame_discarded {
                        first_frame_discarded = true;
                        continue;
                    }
                    // A send error only means no consumer is attached
                    // right now; frames are disposable.
                    let _ = frames_tx.send(frame);
                }
            }
        }
    }

    let _ = child.kill().await;
}

// ── Format enumeration parsing ────────────────────────────────────────────────

fn format_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]: '(\S+)'").expect("format regex"))
}

fn size_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Size: Discrete (\d+)x(\d+)").expect("size regex"))
}

fn interval_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Interval: Discrete [0-9.]+s \(([0-9.]+) fps\)").expect("interval regex")
    })
}

/// Parses `v4l2-ctl --list-formats-ext` output into the format table.
///
/// Only discrete sizes and rates are collected; stepwise ranges do not
/// occur on the capture cards this host drives.
pub fn parse_formats(output: &str) -> Vec<FormatInfo> {
    let mut formats: Vec<FormatInfo> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = format_line_regex().captures(line) {
            formats.push(FormatInfo {
                format: caps[1].to_string(),
                sizes: Vec::new(),
            });
            continue;
        }
        if let Some(caps) = size_line_regex().captures(line) {
            if let Some(format) = formats.last_mut() {
                format.sizes.push(SizeInfo {
                    width: caps[1].parse().unwrap_or(0),
                    height: caps[2].parse().unwrap_or(0),
                    fps: Vec::new(),
                });
            }
            continue;
        }
        if let Some(caps) = interval_line_regex().captures(line) {
            if let Some(size) = formats.last_mut().and_then(|f| f.sizes.last_mut()) {
                if let Ok(fps) = caps[1].parse::<f64>() {
                    size.fps.push(fps as u32);
                }
            }
        }
    }

    formats
}

// ── MJPEG frame splitting ─────────────────────────────────────────────────────

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Splits a concatenated MJPEG byte stream into individual JPEG frames.
///
/// Capture cards emit frames back to back with no container; each frame
/// runs from an SOI marker to the next EOI.  Bytes before the first SOI
/// (mid-frame stream start) are discarded.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every complete frame it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, &SOI) else {
                // No frame start in the buffer; drop all but the last
                // byte (it may be the first half of a split marker).
                let keep_from = self.buf.len().saturating_sub(1);
                self.buf.drain(..keep_from);
                break;
            };
            let Some(end) = find_marker(&self.buf[start + 2..], &EOI) else {
                // Frame started but not finished; drop the junk before it
                // and wait for more bytes.
                self.buf.drain(..start);
                break;
            };
            let frame_end = start + 2 + end + 2;
            let frame = self.buf[start..frame_end].to_vec();
            self.buf.drain(..frame_end);
            frames.push(frame);
        }

        frames
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|window| window == marker)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\t\tInterval: Discrete 0.040s (25.000 fps)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.017s (60.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
";

    #[test]
    fn test_parse_formats_full_table() {
        let formats = parse_formats(SAMPLE);
        assert_eq!(formats.len(), 2);

        assert_eq!(formats[0].format, "MJPG");
        assert_eq!(formats[0].sizes.len(), 2);
        assert_eq!(formats[0].sizes[0].width, 1920);
        assert_eq!(formats[0].sizes[0].height, 1080);
        assert_eq!(formats[0].sizes[0].fps, vec![30, 25]);
        assert_eq!(formats[0].sizes[1].fps, vec![60]);

        assert_eq!(formats[1].format, "YUYV");
        assert_eq!(formats[1].sizes[0].width, 640);
    }

    #[test]
    fn test_parse_formats_empty_output() {
        assert!(parse_formats("").is_empty());
        assert!(parse_formats("no formats here\n").is_empty());
    }

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn test_splitter_single_frame() {
        let mut splitter = JpegSplitter::new();
        let frame = jpeg(b"payload");
        let frames = splitter.push(&frame);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_splitter_frame_across_chunks() {
        let mut splitter = JpegSplitter::new();
        let frame = jpeg(&[0x01, 0x02, 0x03, 0x04]);
        let (a, b) = frame.split_at(3);
        assert!(splitter.push(a).is_empty());
        assert_eq!(splitter.push(b), vec![frame]);
    }

    #[test]
    fn test_splitter_two_frames_in_one_chunk() {
        let mut splitter = JpegSplitter::new();
        let f1 = jpeg(&[0x01]);
        let f2 = jpeg(&[0x02, 0x03]);
        let mut chunk = f1.clone();
        chunk.extend_from_slice(&f2);
        assert_eq!(splitter.push(&chunk), vec![f1, f2]);
    }

    #[test]
    fn test_splitter_discards_leading_garbage() {
        let mut splitter = JpegSplitter::new();
        let frame = jpeg(&[0x42]);
        let mut chunk = vec![0x00, 0x11, 0x22]; // mid-frame stream start
        chunk.extend_from_slice(&frame);
        assert_eq!(splitter.push(&chunk), vec![frame]);
    }

    #[test]
    fn test_splitter_marker_split_across_chunks() {
        let mut splitter = JpegSplitter::new();
        // SOI split across two pushes.
        assert!(splitter.push(&[0xFF]).is_empty());
        let frames = splitter.push(&[0xD8, 0xAA, 0xFF, 0xD9]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0xAA, 0xFF, 0xD9]]);
    }
}
