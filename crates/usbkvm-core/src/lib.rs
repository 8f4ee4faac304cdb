//! # usbkvm-core
//!
//! Shared library for the usbkvm host containing the CH9329 wire codec,
//! the browser-keycode translation table, the HID keyboard/mouse state
//! machine, and the browser-facing HID event model.
//!
//! This crate is pure: it has no dependencies on serial ports, sockets,
//! or any other OS API.  Everything in here operates on byte buffers and
//! plain values, which is what makes the protocol engine testable without
//! a KVM dongle on the desk.
//!
//! # Architecture overview
//!
//! A usbkvm dongle bundles a CH9329-class USB-to-HID bridge chip behind a
//! UART.  The host talks to the chip in small framed packets; the chip
//! presents itself to the target computer as an ordinary USB keyboard and
//! mouse.  This crate defines:
//!
//! - **`protocol`** – How bytes travel over the UART.  Commands are packed
//!   into `{0x57, 0xAB, addr, cmd, len, payload…, checksum}` frames and
//!   replies are re-assembled from the raw ingress stream.
//!
//! - **`keymap`** – The translation table from browser-level virtual-key
//!   codes (what a `keydown` handler sees) to USB HID usage IDs (what the
//!   chip wants), plus the modifier bit layout of the boot protocol.
//!
//! - **`state`** – The keyboard/mouse state machine: six boot-protocol key
//!   slots, the modifier byte, and the mouse button byte.  Pure value
//!   type, so the slot invariants can be exercised in unit tests.
//!
//! - **`event`** – The tagged event model decoded from the JSON frames a
//!   browser sends over the HID WebSocket.

pub mod event;
pub mod keymap;
pub mod protocol;
pub mod state;

// Re-export the most-used items at the crate root so callers can write
// `usbkvm_core::HidEvent` instead of `usbkvm_core::event::HidEvent`.
pub use event::{EventDecodeError, HidEvent};
pub use protocol::codec::{checksum, ProtocolError};
pub use protocol::frame::ReplyAccumulator;
pub use state::HidState;
