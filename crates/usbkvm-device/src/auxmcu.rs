//! The auxiliary MCU control channel.
//!
//! Next to the HID bridge, each dongle carries a small CH552G-class MCU
//! on its own serial port.  It routes a shared USB mass-storage device
//! between the host and the target machine, simulates the target's power
//! and reset buttons, and hands out a per-device UUID.
//!
//! The protocol could not be simpler: every command is a single ASCII
//! byte, and only the UUID query produces a reply (one newline-terminated
//! line).  A mutex serialises all sends; the tracked mass-storage side
//! starts at KVM because that is the MCU's firmware reset state.
//!
//! All methods are blocking (reads can stall up to the 2-second port
//! timeout) — async callers go through [`crate::instance::KvmInstance`],
//! which wraps them in `spawn_blocking`.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serialport::SerialPort;
use tracing::debug;

use crate::error::DeviceError;

/// Read timeout for the UUID line.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Which side currently owns the shared USB mass-storage device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MassStorageSide {
    /// Presented to the local host (the KVM itself).
    Kvm,
    /// Presented to the remote target computer.
    Remote,
}

/// Wire commands understood by the MCU firmware.
mod cmd {
    pub const SWITCH_TO_KVM: u8 = b'm';
    pub const SWITCH_TO_REMOTE: u8 = b'n';
    pub const PRESS_POWER: u8 = b'p';
    pub const RELEASE_POWER: u8 = b's';
    pub const PRESS_RESET: u8 = b'r';
    pub const RELEASE_RESET: u8 = b'd';
    pub const GET_UUID: u8 = b'u';
}

struct AuxInner {
    side: MassStorageSide,
    port: Option<BufReader<Box<dyn SerialPort>>>,
}

/// Controller for the auxiliary MCU on one dongle.
pub struct AuxMcu {
    port_name: String,
    baud_rate: u32,
    inner: Mutex<AuxInner>,
}

impl std::fmt::Debug for AuxMcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxMcu")
            .field("port_name", &self.port_name)
            .field("baud_rate", &self.baud_rate)
            .finish_non_exhaustive()
    }
}

impl AuxMcu {
    /// Creates an unopened controller; no hardware is touched until
    /// [`AuxMcu::open`].
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            inner: Mutex::new(AuxInner {
                side: MassStorageSide::Kvm,
                port: None,
            }),
        }
    }

    /// Opens the serial port (115200-8-N-1 with a 2 s read timeout).
    pub fn open(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.port.is_some() {
            return Err(DeviceError::AlreadyRunning);
        }
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()?;
        inner.port = Some(BufReader::new(port));
        debug!(port = %self.port_name, "aux MCU connected");
        Ok(())
    }

    /// Closes the port.  Safe to call when already closed.
    pub fn close(&self) {
        self.inner.lock().port = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().port.is_some()
    }

    /// Switches the shared USB mass-storage device to the KVM side.
    pub fn switch_usb_to_kvm(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        send_byte(&mut inner, cmd::SWITCH_TO_KVM)?;
        inner.side = MassStorageSide::Kvm;
        Ok(())
    }

    /// Switches the shared USB mass-storage device to the remote target.
    pub fn switch_usb_to_remote(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        send_byte(&mut inner, cmd::SWITCH_TO_REMOTE)?;
        inner.side = MassStorageSide::Remote;
        Ok(())
    }

    pub fn press_power_button(&self) -> Result<(), DeviceError> {
        send_byte(&mut self.inner.lock(), cmd::PRESS_POWER)
    }

    pub fn release_power_button(&self) -> Result<(), DeviceError> {
        send_byte(&mut self.inner.lock(), cmd::RELEASE_POWER)
    }

    pub fn press_reset_button(&self) -> Result<(), DeviceError> {
        send_byte(&mut self.inner.lock(), cmd::PRESS_RESET)
    }

    pub fn release_reset_button(&self) -> Result<(), DeviceError> {
        send_byte(&mut self.inner.lock(), cmd::RELEASE_RESET)
    }

    /// Requests the per-device UUID: writes `'u'` and reads one
    /// newline-terminated line, trimmed of surrounding whitespace.
    pub fn get_uuid(&self) -> Result<String, DeviceError> {
        let mut inner = self.inner.lock();
        send_byte(&mut inner, cmd::GET_UUID)?;
        let reader = inner.port.as_mut().ok_or(DeviceError::NotRunning)?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }

    /// The last side this controller switched the mass storage to.
    pub fn mass_storage_side(&self) -> MassStorageSide {
        self.inner.lock().side
    }
}

fn send_byte(inner: &mut AuxInner, byte: u8) -> Result<(), DeviceError> {
    let reader = inner.port.as_mut().ok_or(DeviceError::NotRunning)?;
    reader.get_mut().write_all(&[byte])?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_side_is_kvm() {
        // The MCU firmware resets with the storage on the KVM side; the
        // tracked state must agree before any command is sent.
        let aux = AuxMcu::new("/dev/ttyACM-test", 115_200);
        assert_eq!(aux.mass_storage_side(), MassStorageSide::Kvm);
    }

    #[test]
    fn test_commands_without_open_port_fail_not_running() {
        let aux = AuxMcu::new("/dev/ttyACM-test", 115_200);
        assert!(matches!(
            aux.switch_usb_to_remote().unwrap_err(),
            DeviceError::NotRunning
        ));
        assert!(matches!(
            aux.get_uuid().unwrap_err(),
            DeviceError::NotRunning
        ));
        // A failed switch must not flip the tracked side.
        assert_eq!(aux.mass_storage_side(), MassStorageSide::Kvm);
    }

    #[test]
    fn test_side_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MassStorageSide::Remote).unwrap(),
            r#""remote""#
        );
        assert_eq!(
            serde_json::to_string(&MassStorageSide::Kvm).unwrap(),
            r#""kvm""#
        );
    }

    #[test]
    fn test_command_bytes_match_firmware() {
        assert_eq!(cmd::SWITCH_TO_KVM, 0x6D);
        assert_eq!(cmd::SWITCH_TO_REMOTE, 0x6E);
        assert_eq!(cmd::PRESS_POWER, b'p');
        assert_eq!(cmd::RELEASE_POWER, b's');
        assert_eq!(cmd::PRESS_RESET, b'r');
        assert_eq!(cmd::RELEASE_RESET, b'd');
        assert_eq!(cmd::GET_UUID, b'u');
    }
}
