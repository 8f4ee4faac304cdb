//! One logical KVM dongle: configuration, controllers, lifecycle.
//!
//! An instance is created from an [`InstanceOptions`] (either scanned
//! from the device tree or loaded from the config file).  Construction
//! validates paths and applies defaults but touches no hardware — the
//! three controllers are built cold and only [`KvmInstance::start`]
//! opens ports and the capture device.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auxmcu::{AuxMcu, MassStorageSide};
use crate::capture::{
    AudioConfig, CaptureConfig, CaptureSupervisor, Resolution, VideoBackend,
};
use crate::error::DeviceError;
use crate::hid::{HidConfig, HidController};

/// Persistable description of one dongle: device paths, capture
/// parameters and serial settings.  Zero-valued fields mean "use the
/// default" so a hand-written config file can stay minimal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceOptions {
    /// HID bridge serial port, e.g. `/dev/ttyUSB0`.
    pub usb_kvm_device_path: String,
    /// Aux MCU serial port, e.g. `/dev/ttyACM0`; empty when absent.
    pub aux_mcu_device_path: String,
    /// UVC capture node, e.g. `/dev/video0`.
    pub video_capture_device_path: String,
    /// ALSA PCM capture node, e.g. `/dev/snd/pcmC1D0c`.
    pub audio_capture_device_path: String,

    pub capture_video_resolution_width: u32,
    pub capture_video_resolution_height: u32,
    pub capture_video_resolution_fps: u32,
    pub capture_audio_sample_rate: u32,
    pub capture_audio_channels: u32,
    pub capture_audio_bytes_per_sample: u32,
    pub capture_audio_frame_size: u32,

    pub usb_kvm_baudrate: u32,
    pub aux_mcu_baudrate: u32,
}

impl InstanceOptions {
    /// Fills every zero field with its default: 1920×1080@25 video,
    /// 48 kHz / 2 ch / 16-bit / 1920-sample audio, 115200 baud serials.
    pub fn normalized(mut self) -> Self {
        let audio_defaults = AudioConfig::default();
        if self.capture_video_resolution_width == 0 {
            self.capture_video_resolution_width = 1920;
        }
        if self.capture_video_resolution_height == 0 {
            self.capture_video_resolution_height = 1080;
        }
        if self.capture_video_resolution_fps == 0 {
            self.capture_video_resolution_fps = 25;
        }
        if self.capture_audio_sample_rate == 0 {
            self.capture_audio_sample_rate = audio_defaults.sample_rate;
        }
        if self.capture_audio_channels == 0 {
            self.capture_audio_channels = audio_defaults.channels;
        }
        if self.capture_audio_bytes_per_sample == 0 {
            self.capture_audio_bytes_per_sample = audio_defaults.bytes_per_sample;
        }
        if self.capture_audio_frame_size == 0 {
            self.capture_audio_frame_size = audio_defaults.frame_size;
        }
        if self.usb_kvm_baudrate == 0 {
            self.usb_kvm_baudrate = 115_200;
        }
        if self.aux_mcu_baudrate == 0 {
            self.aux_mcu_baudrate = 115_200;
        }
        self
    }

    fn resolution(&self) -> Resolution {
        Resolution {
            width: self.capture_video_resolution_width,
            height: self.capture_video_resolution_height,
            fps: self.capture_video_resolution_fps,
        }
    }

    fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.capture_audio_sample_rate,
            channels: self.capture_audio_channels,
            bytes_per_sample: self.capture_audio_bytes_per_sample,
            frame_size: self.capture_audio_frame_size,
        }
    }
}

/// Identifying fields plus live stream state, as served by the
/// instance-listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub uuid: String,
    pub usb_kvm_device: String,
    pub aux_mcu_device: String,
    pub video_capture_dev: String,
    pub audio_capture_dev: String,
    pub video_resolution_width: u32,
    pub video_resolution_height: u32,
    pub video_framerate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub stream_info: String,
    pub usb_mass_storage_side: Option<MassStorageSide>,
}

/// One KVM dongle with its three controllers.
#[derive(Debug)]
pub struct KvmInstance {
    options: InstanceOptions,
    resolution: Resolution,

    hid: Arc<HidController>,
    aux: Option<Arc<AuxMcu>>,
    capture: Arc<CaptureSupervisor>,

    uuid: parking_lot::RwLock<String>,
    started: AtomicBool,
}

impl KvmInstance {
    /// Validates `options`, applies defaults and builds the controllers
    /// without starting anything.
    pub fn new(
        options: InstanceOptions,
        backend: Arc<dyn VideoBackend>,
    ) -> Result<Self, DeviceError> {
        if options.video_capture_device_path.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "video capture device path is not specified",
            ));
        }
        if options.audio_capture_device_path.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "audio capture device path is not specified",
            ));
        }
        let options = options.normalized();

        let hid = Arc::new(HidController::new(HidConfig {
            port_name: options.usb_kvm_device_path.clone(),
            baud_rate: options.usb_kvm_baudrate,
            scroll_sensitivity: 0x01,
        }));

        let aux = if options.aux_mcu_device_path.is_empty() {
            None
        } else {
            Some(Arc::new(AuxMcu::new(
                &options.aux_mcu_device_path,
                options.aux_mcu_baudrate,
            )))
        };

        let capture = Arc::new(CaptureSupervisor::new(
            CaptureConfig {
                video_device: PathBuf::from(&options.video_capture_device_path),
                audio_device: PathBuf::from(&options.audio_capture_device_path),
                audio: options.audio_config(),
            },
            backend,
        ));

        let resolution = options.resolution();
        Ok(Self {
            options,
            resolution,
            hid,
            aux,
            capture,
            uuid: parking_lot::RwLock::new(String::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn uuid(&self) -> String {
        self.uuid.read().clone()
    }

    /// Replaces the instance UUID (used by the registry when resolving a
    /// duplicate read from an aux MCU).
    pub fn set_uuid(&self, uuid: String) {
        *self.uuid.write() = uuid;
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    pub fn hid(&self) -> &Arc<HidController> {
        &self.hid
    }

    pub fn capture(&self) -> &Arc<CaptureSupervisor> {
        &self.capture
    }

    /// Whether the aux MCU is present and its port is open.
    pub fn aux_available(&self) -> bool {
        self.aux.as_ref().is_some_and(|aux| aux.is_open())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Starts the instance: HID serial (with its 0xFF reset), aux MCU and
    /// UUID resolution, then video capture.
    pub async fn start(&self) -> Result<(), DeviceError> {
        if self.options.usb_kvm_device_path.is_empty() {
            return Err(DeviceError::InvalidConfig(
                "USB KVM device path is not specified",
            ));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::AlreadyRunning);
        }

        if let Err(e) = self.hid.connect().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let uuid = self.resolve_uuid().await;
        info!(%uuid, hid = %self.options.usb_kvm_device_path, "KVM instance starting");
        self.set_uuid(uuid);

        if let Err(e) = self.capture.start_video(self.resolution).await {
            // Roll back the half-started instance.
            self.hid.close().await;
            if let Some(aux) = &self.aux {
                aux.close();
            }
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Reads the UUID from the aux MCU, falling back to a fresh v4 when
    /// the MCU is absent or silent.
    async fn resolve_uuid(&self) -> String {
        let Some(aux) = &self.aux else {
            return Uuid::new_v4().to_string();
        };
        let aux = Arc::clone(aux);
        let result = tokio::task::spawn_blocking(move || -> Result<String, DeviceError> {
            aux.open()?;
            aux.get_uuid()
        })
        .await;

        match result {
            Ok(Ok(uuid)) if !uuid.is_empty() => uuid,
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                warn!(
                    aux = %self.options.aux_mcu_device_path,
                    "aux MCU did not supply a UUID; generating one"
                );
                // A silent MCU is left closed so the aux endpoints report
                // 501 rather than timing out on every request.
                if let Some(aux) = &self.aux {
                    aux.close();
                }
                Uuid::new_v4().to_string()
            }
        }
    }

    /// Stops the controllers in reverse start order.
    pub async fn stop(&self) {
        self.capture.shutdown().await;
        if let Some(aux) = &self.aux {
            aux.close();
        }
        self.hid.close().await;
        self.started.store(false, Ordering::SeqCst);
        info!(uuid = %self.uuid(), "KVM instance stopped");
    }

    // ── Aux MCU operations (async wrappers over the blocking channel) ─────────

    fn aux_handle(&self) -> Result<Arc<AuxMcu>, DeviceError> {
        self.aux
            .as_ref()
            .filter(|aux| aux.is_open())
            .cloned()
            .ok_or(DeviceError::NotImplemented("no aux MCU on this instance"))
    }

    async fn aux_call<F>(&self, op: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&AuxMcu) -> Result<(), DeviceError> + Send + 'static,
    {
        let aux = self.aux_handle()?;
        tokio::task::spawn_blocking(move || op(&aux))
            .await
            .map_err(|e| DeviceError::Tool(format!("aux task failed: {e}")))?
    }

    /// Routes the shared mass-storage device to `side`.
    pub async fn switch_mass_storage(&self, side: MassStorageSide) -> Result<(), DeviceError> {
        self.aux_call(move |aux| match side {
            MassStorageSide::Kvm => aux.switch_usb_to_kvm(),
            MassStorageSide::Remote => aux.switch_usb_to_remote(),
        })
        .await
    }

    pub async fn press_power_button(&self) -> Result<(), DeviceError> {
        self.aux_call(|aux| aux.press_power_button()).await
    }

    pub async fn release_power_button(&self) -> Result<(), DeviceError> {
        self.aux_call(|aux| aux.release_power_button()).await
    }

    pub async fn press_reset_button(&self) -> Result<(), DeviceError> {
        self.aux_call(|aux| aux.press_reset_button()).await
    }

    pub async fn release_reset_button(&self) -> Result<(), DeviceError> {
        self.aux_call(|aux| aux.release_reset_button()).await
    }

    /// Reads the UUID straight off the aux MCU.
    pub async fn aux_uuid(&self) -> Result<String, DeviceError> {
        let aux = self.aux_handle()?;
        tokio::task::spawn_blocking(move || aux.get_uuid())
            .await
            .map_err(|e| DeviceError::Tool(format!("aux task failed: {e}")))?
    }

    /// Current mass-storage side; `None` without an aux MCU.
    pub fn mass_storage_side(&self) -> Option<MassStorageSide> {
        self.aux
            .as_ref()
            .filter(|aux| aux.is_open())
            .map(|aux| aux.mass_storage_side())
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            uuid: self.uuid(),
            usb_kvm_device: self.options.usb_kvm_device_path.clone(),
            aux_mcu_device: self.options.aux_mcu_device_path.clone(),
            video_capture_dev: self.options.video_capture_device_path.clone(),
            audio_capture_dev: self.options.audio_capture_device_path.clone(),
            video_resolution_width: self.options.capture_video_resolution_width,
            video_resolution_height: self.options.capture_video_resolution_height,
            video_framerate: self.options.capture_video_resolution_fps,
            audio_sample_rate: self.options.capture_audio_sample_rate,
            audio_channels: self.options.capture_audio_channels,
            stream_info: self.capture.stream_info(),
            usb_mass_storage_side: self.mass_storage_side(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
