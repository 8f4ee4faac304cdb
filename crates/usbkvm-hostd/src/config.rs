//! JSON configuration for single-dongle deployments plus the persisted
//! node UUID.
//!
//! The config file is created with defaults on first run so a fresh
//! install has something to edit.  Absent fields fall back to their
//! defaults via serde, which keeps hand-maintained files minimal and
//! lets old files survive new fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use usbkvm_device::InstanceOptions;

/// Config file name inside the config directory.
pub const USBKVM_CONFIG_FILE: &str = "usbkvm.json";
/// Node UUID file name inside the config directory.
pub const UUID_FILE: &str = "uuid.cfg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Single-dongle deployment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbKvmConfig {
    /// Address the HTTP server binds, e.g. `0.0.0.0:9000`.
    pub listening_address: String,
    pub usb_kvm_device_path: String,
    pub aux_mcu_device_path: String,
    pub video_capture_device_path: String,
    pub audio_capture_device_path: String,
    pub capture_resolution_width: u32,
    pub capture_resolution_height: u32,
    pub capture_resolution_fps: u32,
    pub usb_kvm_baudrate: u32,
    pub aux_mcu_baudrate: u32,
}

impl Default for UsbKvmConfig {
    fn default() -> Self {
        Self {
            listening_address: "0.0.0.0:9000".to_string(),
            usb_kvm_device_path: "/dev/ttyUSB0".to_string(),
            aux_mcu_device_path: "/dev/ttyACM0".to_string(),
            video_capture_device_path: "/dev/video0".to_string(),
            audio_capture_device_path: "/dev/snd/pcmC1D0c".to_string(),
            capture_resolution_width: 1920,
            capture_resolution_height: 1080,
            capture_resolution_fps: 25,
            usb_kvm_baudrate: 115_200,
            aux_mcu_baudrate: 115_200,
        }
    }
}

impl UsbKvmConfig {
    /// Maps the flat config onto the registry's instance options.
    pub fn instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            usb_kvm_device_path: self.usb_kvm_device_path.clone(),
            aux_mcu_device_path: self.aux_mcu_device_path.clone(),
            video_capture_device_path: self.video_capture_device_path.clone(),
            audio_capture_device_path: self.audio_capture_device_path.clone(),
            capture_video_resolution_width: self.capture_resolution_width,
            capture_video_resolution_height: self.capture_resolution_height,
            capture_video_resolution_fps: self.capture_resolution_fps,
            usb_kvm_baudrate: self.usb_kvm_baudrate,
            aux_mcu_baudrate: self.aux_mcu_baudrate,
            ..InstanceOptions::default()
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Loads the config file, writing one with defaults first if absent.
pub fn load_or_create(config_dir: &Path) -> Result<UsbKvmConfig, ConfigError> {
    let path = config_dir.join(USBKVM_CONFIG_FILE);
    if !path.exists() {
        let config = UsbKvmConfig::default();
        let pretty = serde_json::to_string_pretty(&config)?;
        std::fs::write(&path, pretty).map_err(|e| io_err(&path, e))?;
        info!(path = %path.display(), "wrote default config");
        return Ok(config);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Returns the persisted node UUID, generating and storing a fresh v4 on
/// first run.
pub fn node_uuid(config_dir: &Path) -> Result<String, ConfigError> {
    let path = config_dir.join(UUID_FILE);
    if !path.exists() {
        let uuid = Uuid::new_v4().to_string();
        std::fs::write(&path, &uuid).map_err(|e| io_err(&path, e))?;
        info!(%uuid, "generated node UUID");
        return Ok(uuid);
    }
    let uuid = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(uuid.trim().to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
