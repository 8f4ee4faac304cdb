//! Packet builders for the CH9329 HID bridge chip.
//!
//! Every function here is pure: bytes in, bytes out.  Serial I/O, retry
//! behaviour and reply correlation live in the device layer; this module
//! only knows how a well-formed frame looks.
//!
//! # Checksum
//!
//! The chip uses the simplest checksum imaginable: the unsigned 8-bit sum
//! of every byte before the checksum position, with natural wrap-around.
//! It catches cable noise, not malice, and that is all it needs to do on a
//! 20 cm UART trace.

use thiserror::Error;

/// Frame header bytes that start every packet in both directions.
pub const FRAME_HEADER: [u8; 2] = [0x57, 0xAB];

/// Device address byte.  The CH9329 ships with address 0 and this host
/// never re-addresses it.
pub const DEVICE_ADDR: u8 = 0x00;

/// Command: send a boot-protocol keyboard report.
pub const CMD_KEYBOARD: u8 = 0x02;
/// Command: absolute mouse move.
pub const CMD_MOUSE_ABS: u8 = 0x04;
/// Command: relative mouse move (also carries button state and wheel).
pub const CMD_MOUSE_REL: u8 = 0x05;
/// Command: read the chip's 50-byte parameter block.
pub const CMD_GET_PARA_CFG: u8 = 0x08;
/// Command: write the chip's 50-byte parameter block.
///
/// Per the CH9329 datasheet the SET_PARA_CFG command and its reply share
/// this code; the reply matcher still derives `0x89`/`0xC9` from it the
/// same way it does for every other command.
pub const CMD_SET_PARA_CFG: u8 = 0x09;

/// Single-byte operation-queue reset, transmitted raw (not framed) right
/// after the port opens.
pub const OP_QUEUE_RESET: u8 = 0xFF;

/// Bit OR-ed into the command byte of a successful reply.
pub const REPLY_OK_BIT: u8 = 0x80;
/// Bits OR-ed into the command byte of a device-reported error reply.
pub const REPLY_ERR_BITS: u8 = 0xC0;

/// Errors produced while building or parsing CH9329 frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The trailing checksum does not match the sum of the frame bytes.
    #[error("checksum mismatch: expected 0x{expected:02X}, found 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },

    /// The chip answered with `cmd | 0xC0`.
    #[error("device returned error reply for command 0x{0:02X}")]
    DeviceFault(u8),

    /// A frame was shorter than its declared length or structurally wrong.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

// ── Checksum ──────────────────────────────────────────────────────────────────

/// Unsigned 8-bit sum of `bytes` with natural wrap-around.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Appends the checksum of everything currently in `packet`.
fn seal(packet: &mut [u8]) {
    let last = packet.len() - 1;
    packet[last] = checksum(&packet[..last]);
}

// ── Packet builders ───────────────────────────────────────────────────────────

/// Builds the 14-byte keyboard report packet.
///
/// Layout: `{0x57, 0xAB, 0x00, 0x02, 0x08, modkey, 0x00, slot0..slot5, chk}`.
/// The six slots are USB HID usage IDs, zero-padded — the boot protocol's
/// "up to six keys at once" rule lives in [`crate::state::HidState`], not
/// here.
pub fn keyboard_report(modkey: u8, slots: &[u8; 6]) -> [u8; 14] {
    let mut packet = [
        FRAME_HEADER[0],
        FRAME_HEADER[1],
        DEVICE_ADDR,
        CMD_KEYBOARD,
        0x08,
        modkey,
        0x00,
        slots[0],
        slots[1],
        slots[2],
        slots[3],
        slots[4],
        slots[5],
        0x00,
    ];
    seal(&mut packet);
    packet
}

/// Parses a keyboard report packet back into `(modkey, slots)`.
///
/// Used by tests and by the hex echo the HID WebSocket sends back to the
/// browser; the device never sends these frames to us.
pub fn parse_keyboard_report(packet: &[u8]) -> Result<(u8, [u8; 6]), ProtocolError> {
    if packet.len() != 14 {
        return Err(ProtocolError::Malformed("keyboard report must be 14 bytes"));
    }
    if packet[..2] != FRAME_HEADER || packet[3] != CMD_KEYBOARD || packet[4] != 0x08 {
        return Err(ProtocolError::Malformed("not a keyboard report frame"));
    }
    let expected = checksum(&packet[..13]);
    if expected != packet[13] {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            found: packet[13],
        });
    }
    let mut slots = [0u8; 6];
    slots.copy_from_slice(&packet[7..13]);
    Ok((packet[5], slots))
}

/// Builds the 13-byte absolute mouse move packet.
///
/// `x` and `y` are 16-bit device coordinates (0..=0xFFFF over the full
/// screen) transmitted little-endian.  The trailing scroll byte is always
/// zero for absolute moves.
pub fn mouse_absolute(buttons: u8, x: u16, y: u16) -> [u8; 13] {
    let [x_lsb, x_msb] = x.to_le_bytes();
    let [y_lsb, y_msb] = y.to_le_bytes();
    let mut packet = [
        FRAME_HEADER[0],
        FRAME_HEADER[1],
        DEVICE_ADDR,
        CMD_MOUSE_ABS,
        0x07,
        0x02, // sub-op: absolute
        buttons,
        x_lsb,
        x_msb,
        y_lsb,
        y_msb,
        0x00, // scroll
        0x00,
    ];
    seal(&mut packet);
    packet
}

/// Builds the 11-byte relative mouse move packet.
///
/// Delta bytes of exactly `0x80` are substituted with `0x81`: the chip
/// treats `0x80` as a signed overflow marker and mis-moves the cursor.
pub fn mouse_relative(buttons: u8, dx: u8, dy: u8, wheel: u8) -> [u8; 11] {
    let dx = if dx == 0x80 { 0x81 } else { dx };
    let dy = if dy == 0x80 { 0x81 } else { dy };
    let mut packet = [
        FRAME_HEADER[0],
        FRAME_HEADER[1],
        DEVICE_ADDR,
        CMD_MOUSE_REL,
        0x05,
        0x01, // sub-op: relative
        buttons,
        dx,
        dy,
        wheel,
        0x00,
    ];
    seal(&mut packet);
    packet
}

/// Builds the 6-byte GET_PARA_CFG request (empty payload).
pub fn get_config_request() -> [u8; 6] {
    let mut packet = [
        FRAME_HEADER[0],
        FRAME_HEADER[1],
        DEVICE_ADDR,
        CMD_GET_PARA_CFG,
        0x00,
        0x00,
    ];
    seal(&mut packet);
    packet
}

/// Builds the SET_PARA_CFG request from a 50-byte parameter block.
///
/// The block must be the payload of a prior GET_PARA_CFG reply, usually
/// with the baud-rate bytes rewritten via [`set_config_with_baud`].
pub fn set_config_request(cfg: &[u8; 50]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(5 + 50 + 1);
    packet.extend_from_slice(&FRAME_HEADER);
    packet.push(DEVICE_ADDR);
    packet.push(CMD_SET_PARA_CFG);
    packet.push(0x32);
    packet.extend_from_slice(cfg);
    packet.push(checksum(&packet));
    packet
}

/// Returns the four big-endian bytes the parameter block stores a baud
/// rate as (115200 → `00 01 C2 00`, 19200 → `00 00 4B 00`).
pub fn baud_bytes(baud: u32) -> [u8; 4] {
    baud.to_be_bytes()
}

/// Rewrites bytes `[3..7]` of a GET_PARA_CFG payload with `baud` and
/// builds the matching SET_PARA_CFG request.
pub fn set_config_with_baud(cfg: &[u8; 50], baud: u32) -> Vec<u8> {
    let mut cfg = *cfg;
    cfg[3..7].copy_from_slice(&baud_bytes(baud));
    set_config_request(&cfg)
}

/// Extracts the baud rate stored in a 50-byte parameter block.
pub fn baud_from_config(cfg: &[u8; 50]) -> u32 {
    u32::from_be_bytes([cfg[3], cfg[4], cfg[5], cfg[6]])
}

/// Maps a scroll tilt to the wire wheel byte.
///
/// The chip encodes scroll direction in the byte's sign half: values up to
/// `0x7F` scroll one way, values down from `0xFF` the other.  `tilt == 0`
/// means no scroll event should be emitted at all, hence `None`.
pub fn scroll_byte(tilt: i32, sensitivity: u8) -> Option<u8> {
    match tilt {
        0 => None,
        t if t < 0 => Some(sensitivity),
        _ => Some(0xFF - sensitivity),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
