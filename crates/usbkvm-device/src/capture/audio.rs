//! Audio capture sessions and PCM decimation.
//!
//! Audio is captured by an external `arecord` child at 48 kHz / 16-bit /
//! stereo and shipped to the client as raw PCM in binary WebSocket
//! frames.  Three quality levels trade bandwidth for fidelity by simple
//! frame decimation — no codec, just dropping stereo frames:
//!
//! | quality  | kept frames | effective rate |
//! |----------|-------------|----------------|
//! | high     | all         | 48 kHz         |
//! | standard | every 2nd   | 24 kHz         |
//! | low      | every 3rd   | 16 kHz         |
//!
//! One stereo frame is exactly 4 bytes (2 channels × 2 bytes); the
//! decimators preserve that framing and trim any trailing partial frame.
//!
//! The ALSA device is exclusive: a new session detects a holder with a
//! non-blocking open probe, signals the previous session to stop, and
//! polls for the device to come free.

use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::CaptureSupervisor;
use crate::error::DeviceError;

/// How many times to poll for the previous session to release the device.
const RELEASE_POLL_ATTEMPTS: u32 = 5;
/// Delay between release polls.
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bytes per stereo sample frame: 2 channels × 16-bit.
const STEREO_FRAME_BYTES: usize = 4;

/// PCM capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub bytes_per_sample: u32,
    /// Samples per read frame; 1920 is 40 ms at 48 kHz.
    pub frame_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 2,
            frame_size: 1920,
        }
    }
}

impl AudioConfig {
    /// Read buffer unit: `frame_size × channels × bytes_per_sample`.
    pub fn frame_bytes(&self) -> usize {
        (self.frame_size * self.channels * self.bytes_per_sample) as usize
    }
}

/// Client-selected stream quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioQuality {
    Low,
    #[default]
    Standard,
    High,
}

impl AudioQuality {
    /// Parses the `?quality=` parameter; anything unrecognised falls back
    /// to `Standard`.
    pub fn parse(value: &str) -> Self {
        match value {
            "low" => Self::Low,
            "standard" => Self::Standard,
            "high" => Self::High,
            _ => Self::Standard,
        }
    }
}

/// Applies the quality decimation to a captured buffer.
pub fn decimate(buf: &[u8], quality: AudioQuality) -> Vec<u8> {
    match quality {
        AudioQuality::High => {
            let whole = buf.len() - buf.len() % STEREO_FRAME_BYTES;
            buf[..whole].to_vec()
        }
        AudioQuality::Standard => keep_every_nth_frame(buf, 2),
        AudioQuality::Low => keep_every_nth_frame(buf, 3),
    }
}

/// Keeps every `n`-th 4-byte stereo frame, trimming a trailing partial
/// frame first.
fn keep_every_nth_frame(buf: &[u8], n: usize) -> Vec<u8> {
    let whole = buf.len() - buf.len() % STEREO_FRAME_BYTES;
    let buf = &buf[..whole];
    let mut out = Vec::with_capacity(buf.len() / n + STEREO_FRAME_BYTES);
    let mut i = 0;
    while i + STEREO_FRAME_BYTES <= buf.len() {
        out.extend_from_slice(&buf[i..i + STEREO_FRAME_BYTES]);
        i += STEREO_FRAME_BYTES * n;
    }
    out
}

// ── ALSA node helpers ─────────────────────────────────────────────────────────

fn pcm_node_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pcmC(\d+)D(\d+)[cp]").expect("pcm node regex"))
}

/// Converts a PCM node name to the ALSA hardware device string:
/// `pcmC1D0c` → `hw:1,0`.
pub fn pcm_node_to_hw(node: &str) -> Result<String, DeviceError> {
    let caps = pcm_node_regex()
        .captures(node)
        .ok_or(DeviceError::InvalidConfig("invalid PCM device name"))?;
    Ok(format!("hw:{},{}", &caps[1], &caps[2]))
}

/// Non-blocking open probe: a capture node that cannot be opened
/// `O_RDONLY|O_NONBLOCK` is held by another process.
pub fn alsa_device_occupied(dev: &Path) -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(dev)
        .is_err()
}

/// Lists the PCM capture nodes under `/dev/snd` (`pcm*c`).
pub fn list_capture_nodes() -> std::io::Result<Vec<PathBuf>> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir("/dev/snd")?
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("pcm") && name.ends_with('c')
        })
        .map(|entry| entry.path())
        .collect();
    nodes.sort();
    Ok(nodes)
}

/// Locates the PCM capture node of an MS2109/MS2130 stick via
/// `arecord -l`.
pub async fn find_hdmi_capture_pcm() -> Result<String, DeviceError> {
    let output = tokio::process::Command::new("arecord")
        .arg("-l")
        .output()
        .await?;
    if !output.status.success() {
        return Err(DeviceError::Tool("arecord -l failed".into()));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_hdmi_capture_pcm(&text)
        .ok_or_else(|| DeviceError::NotFound("no HDMI capture card".into()))
}

/// Scans `arecord -l` output for an MS2109/MS2130 line such as
/// `card 1: MS2109 [MS2109], device 0: USB Audio [USB Audio]`.
pub fn parse_hdmi_capture_pcm(listing: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)card (\d+): .*(ms2109|ms2130).*device (\d+):").expect("arecord regex")
    });
    re.captures(listing)
        .map(|caps| format!("/dev/snd/pcmC{}D{}c", &caps[1], &caps[3]))
}

// ── Session ───────────────────────────────────────────────────────────────────

impl CaptureSupervisor {
    /// Asks the running audio session (if any) to stop.
    pub fn signal_audio_stop(&self) {
        let _ = self.audio_stop_tx.try_send(());
    }

    /// Runs one audio capture session, writing decimated PCM buffers to
    /// `out` until the client leaves, a stop is signalled, or the
    /// recorder dies.
    ///
    /// The WebSocket adapter owns the socket; this function only produces
    /// the binary payloads.
    pub async fn run_audio_session(
        &self,
        quality: AudioQuality,
        out: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), DeviceError> {
        let device = self.config.audio_device.clone();

        // Evict a previous holder of the ALSA node.
        if alsa_device_occupied(&device) {
            info!(device = %device.display(), "audio device held; stopping previous session");
            self.signal_audio_stop();
            let mut attempts = 0;
            while alsa_device_occupied(&device) {
                attempts += 1;
                if attempts > RELEASE_POLL_ATTEMPTS {
                    return Err(DeviceError::AlreadyRunning);
                }
                tokio::time::sleep(RELEASE_POLL_INTERVAL).await;
            }
        }

        let node_name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hw = pcm_node_to_hw(&node_name)?;
        debug!(%hw, "starting arecord");

        let mut child = tokio::process::Command::new("arecord")
            .args(["-f", "S16_LE"])
            .args(["-r", &self.config.audio.sample_rate.to_string()])
            .args(["-c", &self.config.audio.channels.to_string()])
            .args(["-D", &hw])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Tool("arecord stdout unavailable".into()))?;

        // Take the stop receiver for the duration of this session.
        let mut stop_rx = self.audio_stop_rx.lock().await;
        while stop_rx.try_recv().is_ok() {}

        self.audio_streaming.store(true, Ordering::Relaxed);
        let mut buf = vec![0u8; self.config.audio.frame_bytes() * 2];

        let result = loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!("audio session stop signalled");
                    break Ok(());
                }
                _ = out.closed() => {
                    debug!("audio client gone");
                    break Ok(());
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => {
                        warn!("arecord stream ended");
                        break Ok(());
                    }
                    Ok(n) => {
                        let payload = decimate(&buf[..n], quality);
                        if payload.is_empty() {
                            continue;
                        }
                        if out.send(payload).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(DeviceError::Io(e)),
                },
            }
        };

        self.audio_streaming.store(false, Ordering::Relaxed);
        let _ = child.kill().await;
        info!("audio session finished");
        result
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
