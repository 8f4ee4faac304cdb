//! CH9329 serial protocol: packet builders and reply framing.
//!
//! Wire format:
//! ```text
//! [0x57][0xAB][addr:1][cmd:1][len:1][payload:len][checksum:1]
//! ```
//! `checksum` is the unsigned 8-bit sum of every preceding byte.  A reply
//! frame has the same shape; its `cmd` byte is `request_cmd | 0x80` on
//! success and `request_cmd | 0xC0` when the chip reports an error.
//! `len` counts payload bytes only.

pub mod codec;
pub mod frame;
