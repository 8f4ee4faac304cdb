//! USB device-tree discovery.
//!
//! Every usbkvm dongle puts the same four functions behind one USB hub
//! chip: a UART bridge (the HID chip), a CDC-ACM port (the aux MCU), a
//! UVC capture interface and a USB audio interface.  The kernel spreads
//! those across `/dev/ttyUSB*`, `/dev/ttyACM*`, `/dev/video*` and
//! `/dev/snd/pcmC*` with no hint that they belong together — but their
//! sysfs attachment paths all descend from the same USB port path
//! (`1-2.3` style), which is what this module groups on.
//!
//! The grouping core is pure and operates on pre-resolved
//! `(device path, sysfs path)` pairs; only the enumeration helpers touch
//! the machine (via `udevadm` for the sysfs resolution, same as the rest
//! of the capture stack shells out to its V4L2/ALSA tooling).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::auxmcu::AuxMcu;
use crate::capture::backend::VideoBackend;
use crate::error::DeviceError;
use crate::instance::InstanceOptions;

/// A character device together with its sysfs attachment point.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub dev_path: PathBuf,
    pub sys_path: String,
}

/// All device nodes found under one USB hub branch.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceGroup {
    /// Sysfs prefix up to and including the USB port path segment.
    pub hub_prefix: String,
    /// Plain UART bridges (`/dev/ttyUSB*`) — the HID chip candidates.
    pub hid_serials: Vec<PathBuf>,
    /// CDC-ACM ports (`/dev/ttyACM*`) — the aux MCU candidates.
    pub aux_serials: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
    pub audios: Vec<PathBuf>,
}

/// Matches a USB port path segment such as `1-2`, `2-1.4` or `1-2.3.1`.
fn port_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+-\d+(\.\d+)*$").expect("port path regex"))
}

/// Extracts the hub prefix from a sysfs path: everything up to and
/// including the first USB-port-path segment.
pub fn hub_prefix(sys_path: &str) -> Option<String> {
    let parts: Vec<&str> = sys_path.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if port_path_regex().is_match(part) {
            return Some(parts[..=i].join("/"));
        }
    }
    None
}

/// Groups resolved device nodes by their hub prefix.
///
/// Only groups holding at least one serial node (either kind) and at
/// least one video node survive; anything else is not a KVM dongle.
pub fn group_device_nodes(
    serials: &[DeviceNode],
    videos: &[DeviceNode],
    audios: &[DeviceNode],
) -> Vec<DeviceGroup> {
    use std::collections::BTreeMap;

    fn group_for(
        groups: &mut BTreeMap<String, DeviceGroup>,
        prefix: String,
    ) -> &mut DeviceGroup {
        groups.entry(prefix.clone()).or_insert_with(|| DeviceGroup {
            hub_prefix: prefix,
            ..DeviceGroup::default()
        })
    }

    let mut groups: BTreeMap<String, DeviceGroup> = BTreeMap::new();

    for node in serials {
        let Some(prefix) = hub_prefix(&node.sys_path) else {
            continue;
        };
        let group = group_for(&mut groups, prefix);
        // The aux MCU enumerates as a CDC-ACM device; everything else on
        // the hub's serial side is the HID bridge.
        if node.dev_path.to_string_lossy().contains("ACM") {
            group.aux_serials.push(node.dev_path.clone());
        } else {
            group.hid_serials.push(node.dev_path.clone());
        }
    }
    for node in videos {
        if let Some(prefix) = hub_prefix(&node.sys_path) {
            group_for(&mut groups, prefix).videos.push(node.dev_path.clone());
        }
    }
    for node in audios {
        if let Some(prefix) = hub_prefix(&node.sys_path) {
            group_for(&mut groups, prefix).audios.push(node.dev_path.clone());
        }
    }

    groups
        .into_values()
        .filter(|g| {
            (!g.hid_serials.is_empty() || !g.aux_serials.is_empty()) && !g.videos.is_empty()
        })
        .collect()
}

// ── Enumeration (machine-facing) ──────────────────────────────────────────────

/// Lists `/dev` entries whose file name starts with `prefix`, sorted.
fn list_dev_nodes(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(prefix)
        })
        .map(|entry| entry.path())
        .collect();
    nodes.sort();
    nodes
}

/// Resolves a device node (following symlinks) to its sysfs path via
/// `udevadm info -q path -n`.
async fn sysfs_attachment(dev: &Path) -> Result<String, DeviceError> {
    let resolved = tokio::fs::canonicalize(dev).await?;
    let output = tokio::process::Command::new("udevadm")
        .args(["info", "-q", "path", "-n"])
        .arg(&resolved)
        .output()
        .await?;
    if !output.status.success() {
        return Err(DeviceError::Tool(format!(
            "udevadm failed for {}",
            dev.display()
        )));
    }
    let sys = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sys.is_empty() {
        return Err(DeviceError::Tool(format!(
            "udevadm returned no sysfs path for {}",
            dev.display()
        )));
    }
    Ok(format!("/sys{sys}"))
}

async fn resolve_nodes(paths: Vec<PathBuf>) -> Vec<DeviceNode> {
    let mut nodes = Vec::with_capacity(paths.len());
    for dev_path in paths {
        match sysfs_attachment(&dev_path).await {
            Ok(sys_path) => nodes.push(DeviceNode { dev_path, sys_path }),
            // Virtual nodes (e.g. /dev/video loopbacks) legitimately fail
            // resolution; they just don't participate in grouping.
            Err(e) => warn!(device = %dev_path.display(), error = %e, "sysfs resolution failed"),
        }
    }
    nodes
}

/// Walks the device tree and returns every hub group that looks like a
/// KVM dongle.
pub async fn discover_device_groups() -> Result<Vec<DeviceGroup>, DeviceError> {
    let dev = Path::new("/dev");
    let snd = Path::new("/dev/snd");

    let mut serial_paths = list_dev_nodes(dev, "ttyUSB");
    serial_paths.extend(list_dev_nodes(dev, "ttyACM"));
    let video_paths = list_dev_nodes(dev, "video");
    let audio_paths = list_dev_nodes(snd, "pcmC");

    let serials = resolve_nodes(serial_paths).await;
    let videos = resolve_nodes(video_paths).await;
    let audios = resolve_nodes(audio_paths).await;

    Ok(group_device_nodes(&serials, &videos, &audios))
}

/// Scans for dongles and prepares an [`InstanceOptions`] per group.
///
/// Within each group the first serial node of each kind wins; the video
/// node must probe as a capture card (several discrete sizes), first
/// match wins; the first audio node wins.  UUIDs are probed best-effort —
/// a dongle whose aux MCU stays silent is still usable, it just gets a
/// generated UUID at start.
pub async fn scan_usb_kvm_devices(
    backend: &dyn VideoBackend,
) -> Result<Vec<InstanceOptions>, DeviceError> {
    let groups = discover_device_groups().await?;
    if groups.is_empty() {
        return Err(DeviceError::NotFound("no USB KVM device groups".into()));
    }

    let mut options = Vec::new();
    for group in groups {
        let mut opt = InstanceOptions::default();
        if let Some(hid) = group.hid_serials.first() {
            opt.usb_kvm_device_path = hid.to_string_lossy().into_owned();
        }
        if let Some(aux) = group.aux_serials.first() {
            opt.aux_mcu_device_path = aux.to_string_lossy().into_owned();
        }
        for video in &group.videos {
            match backend.is_capture_card(video).await {
                Ok(true) => {
                    opt.video_capture_device_path = video.to_string_lossy().into_owned();
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(device = %video.display(), error = %e, "capture-card probe failed")
                }
            }
        }
        if let Some(audio) = group.audios.first() {
            opt.audio_capture_device_path = audio.to_string_lossy().into_owned();
        }

        probe_uuid(&opt.aux_mcu_device_path).await;
        options.push(opt);
    }
    Ok(options)
}

/// Short-lived aux MCU open to read the device UUID; failures only warn.
async fn probe_uuid(aux_path: &str) {
    if aux_path.is_empty() {
        return;
    }
    let path = aux_path.to_owned();
    let result = tokio::task::spawn_blocking(move || {
        let aux = AuxMcu::new(&path, 115_200);
        aux.open()?;
        let uuid = aux.get_uuid();
        aux.close();
        uuid
    })
    .await;

    match result {
        Ok(Ok(uuid)) => info!(aux = %aux_path, %uuid, "aux MCU responded to UUID probe"),
        Ok(Err(e)) => warn!(
            aux = %aux_path,
            error = %e,
            "could not read UUID from aux MCU; third-party device?"
        ),
        Err(e) => warn!(aux = %aux_path, error = %e, "UUID probe task failed"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
