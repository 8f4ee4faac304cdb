//! Error kinds shared across the device layer.
//!
//! The split mirrors how errors propagate at runtime: framing and
//! transient I/O problems at the serial layer log and take the affected
//! worker down (the controller drops to not-running), while the HTTP
//! layer maps the remainder onto status codes (400 for bad requests, 404
//! for unknown UUIDs, 501 for a missing Aux MCU, 500 for the rest).

use thiserror::Error;
use usbkvm_core::event::EventDecodeError;
use usbkvm_core::protocol::codec::ProtocolError;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Port open, read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port configuration or open failure.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The write queue did not accept the packet within 30 ms.
    #[error("timeout waiting to enqueue serial write")]
    WriteTimeout,

    /// No valid reply frame arrived within 500 ms.
    #[error("timeout waiting for device reply")]
    ReplyTimeout,

    /// The serial workers are not alive (never connected, or an I/O error
    /// took them down).
    #[error("serial port is not running")]
    NotRunning,

    /// The chip answered `cmd | 0xC0`.
    #[error("device returned error reply for command 0x{0:02X}")]
    DeviceFault(u8),

    /// Bad frame magic or checksum on the reply stream.
    #[error("framing error: {0}")]
    Framing(String),

    /// The browser keycode has no USB HID usage mapping.
    #[error("unsupported keycode: {0}")]
    UnsupportedKey(u8),

    /// All six boot-protocol key slots are in use.
    #[error("no free keyboard slot: six keys already held")]
    KeyboardFull,

    /// Mouse button outside 1 (left) / 2 (right) / 3 (middle).
    #[error("invalid mouse button: {0}")]
    InvalidButton(i64),

    /// The incoming HID event JSON could not be decoded.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventDecodeError),

    /// The capture device does not advertise the requested mode.
    #[error("unsupported capture resolution: {width}x{height}@{fps}")]
    UnsupportedResolution { width: u32, height: u32, fps: u32 },

    /// No instance with the given UUID.
    #[error("no instance with UUID {0}")]
    NotFound(String),

    /// The operation needs hardware this instance does not have.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Double start of a controller or capture.
    #[error("already running")]
    AlreadyRunning,

    /// Configuration problem (missing device path, bad parameter).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// An external helper (v4l2-ctl, arecord, udevadm) failed.
    #[error("external tool failed: {0}")]
    Tool(String),
}

impl From<ProtocolError> for DeviceError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::DeviceFault(cmd) => DeviceError::DeviceFault(cmd),
            other => DeviceError::Framing(other.to_string()),
        }
    }
}

impl From<usbkvm_core::state::SlotsFull> for DeviceError {
    fn from(_: usbkvm_core::state::SlotsFull) -> Self {
        DeviceError::KeyboardFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_fault_maps_to_device_fault() {
        let err: DeviceError = ProtocolError::DeviceFault(0x02).into();
        assert!(matches!(err, DeviceError::DeviceFault(0x02)));
    }

    #[test]
    fn test_checksum_mismatch_maps_to_framing() {
        let err: DeviceError = ProtocolError::ChecksumMismatch {
            expected: 1,
            found: 2,
        }
        .into();
        assert!(matches!(err, DeviceError::Framing(_)));
    }

    #[test]
    fn test_unsupported_key_formats_numerically() {
        // A keycode of 200 must render as the number 200, not as a
        // garbage character.
        let err = DeviceError::UnsupportedKey(200);
        assert_eq!(err.to_string(), "unsupported keycode: 200");
    }
}
