//! Incremental reply-frame assembly.
//!
//! The serial reader hands the controller raw chunks in whatever sizes the
//! UART driver produces: a single `read()` may deliver half a reply frame,
//! or one and a half.  [`ReplyAccumulator`] buffers those chunks and
//! extracts complete frames, validating the header magic and the trailing
//! checksum as it goes.
//!
//! Framing recovery is deliberately blunt: when the buffer does not start
//! with `0x57 0xAB` the whole accumulator is discarded.  The protocol is
//! strictly request/reply with a single outstanding command, so there is
//! never a legitimate byte stream to resynchronise into — anything
//! unaligned is line noise from a replug.

use crate::protocol::codec::{
    checksum, ProtocolError, FRAME_HEADER, REPLY_ERR_BITS, REPLY_OK_BIT,
};

/// Minimum size of a frame: header(2) + addr + cmd + len + checksum.
const MIN_FRAME_LEN: usize = 6;

/// Buffers ingress bytes and yields complete, validated reply payloads.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    buf: Vec<u8>,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read serial bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discards everything buffered so far.
    ///
    /// Called before a new `send_and_expect` so a stale reply from a timed
    /// out command cannot be matched against the next one.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Attempts to extract the reply for `cmd` from the buffered bytes.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` – a complete success reply (`cmd | 0x80`)
    ///   was assembled; its payload is handed out and the frame consumed.
    /// - `Ok(None)` – not enough bytes yet; call again after more ingress.
    /// - `Err(DeviceFault)` – the chip answered `cmd | 0xC0`.
    /// - `Err(ChecksumMismatch)` – a structurally complete frame failed
    ///   its checksum; the accumulator is cleared.
    ///
    /// Complete, valid frames whose reply byte matches neither pattern are
    /// dropped and scanning continues — they can only be stragglers from a
    /// previous command that already timed out.
    pub fn try_decode(&mut self, cmd: u8) -> Result<Option<Vec<u8>>, ProtocolError> {
        let ok_reply = cmd | REPLY_OK_BIT;
        let err_reply = cmd | REPLY_ERR_BITS;

        loop {
            if self.buf.len() < MIN_FRAME_LEN {
                return Ok(None);
            }

            if self.buf[..2] != FRAME_HEADER {
                // Unaligned bytes: drop everything and wait for a clean frame.
                self.buf.clear();
                return Ok(None);
            }

            let payload_len = self.buf[4] as usize;
            let frame_len = 5 + payload_len + 1;
            if self.buf.len() < frame_len {
                return Ok(None);
            }

            let expected = checksum(&self.buf[..5 + payload_len]);
            let found = self.buf[5 + payload_len];
            if expected != found {
                self.buf.clear();
                return Err(ProtocolError::ChecksumMismatch { expected, found });
            }

            let reply_byte = self.buf[3];
            let payload = self.buf[5..5 + payload_len].to_vec();
            self.buf.drain(..frame_len);

            if reply_byte == ok_reply {
                return Ok(Some(payload));
            }
            if reply_byte == err_reply {
                return Err(ProtocolError::DeviceFault(cmd));
            }
            // Unrelated frame; keep scanning the remainder.
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a sealed reply frame for tests.
    fn reply_frame(reply_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x57, 0xAB, 0x00, reply_byte, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame));
        frame
    }

    #[test]
    fn test_success_reply_yields_payload() {
        let mut acc = ReplyAccumulator::new();
        acc.extend(&reply_frame(0x82, &[0x00]));
        assert_eq!(acc.try_decode(0x02).unwrap(), Some(vec![0x00]));
    }

    #[test]
    fn test_error_reply_surfaces_device_fault() {
        let mut acc = ReplyAccumulator::new();
        acc.extend(&reply_frame(0xC2, &[]));
        assert_eq!(
            acc.try_decode(0x02),
            Err(ProtocolError::DeviceFault(0x02))
        );
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut acc = ReplyAccumulator::new();
        let frame = reply_frame(0x84, &[0x01, 0x02, 0x03]);

        // Feed the frame one byte at a time; only the final byte completes it.
        for b in &frame[..frame.len() - 1] {
            acc.extend(&[*b]);
            assert_eq!(acc.try_decode(0x04).unwrap(), None);
        }
        acc.extend(&[frame[frame.len() - 1]]);
        assert_eq!(acc.try_decode(0x04).unwrap(), Some(vec![0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_bad_magic_clears_accumulator() {
        let mut acc = ReplyAccumulator::new();
        acc.extend(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00]);
        assert_eq!(acc.try_decode(0x02).unwrap(), None);

        // The garbage is gone; a clean frame afterwards decodes normally.
        acc.extend(&reply_frame(0x82, &[0x00]));
        assert_eq!(acc.try_decode(0x02).unwrap(), Some(vec![0x00]));
    }

    #[test]
    fn test_checksum_mismatch_is_an_error_and_clears() {
        let mut acc = ReplyAccumulator::new();
        let mut frame = reply_frame(0x82, &[0x00]);
        let last = frame.len() - 1;
        frame[last] ^= 0x55;
        acc.extend(&frame);
        assert!(matches!(
            acc.try_decode(0x02),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        // Buffer was discarded along with the corrupt frame.
        assert_eq!(acc.try_decode(0x02).unwrap(), None);
    }

    #[test]
    fn test_unrelated_frame_is_skipped() {
        let mut acc = ReplyAccumulator::new();
        // A late keyboard reply followed by the mouse reply we actually want.
        acc.extend(&reply_frame(0x82, &[0x00]));
        acc.extend(&reply_frame(0x85, &[0x00]));
        assert_eq!(acc.try_decode(0x05).unwrap(), Some(vec![0x00]));
    }

    #[test]
    fn test_two_frames_in_one_chunk_decode_in_order() {
        let mut acc = ReplyAccumulator::new();
        let mut chunk = reply_frame(0x82, &[0x01]);
        chunk.extend_from_slice(&reply_frame(0x82, &[0x02]));
        acc.extend(&chunk);
        assert_eq!(acc.try_decode(0x02).unwrap(), Some(vec![0x01]));
        assert_eq!(acc.try_decode(0x02).unwrap(), Some(vec![0x02]));
    }

    #[test]
    fn test_empty_payload_reply() {
        let mut acc = ReplyAccumulator::new();
        acc.extend(&reply_frame(0x89, &[]));
        assert_eq!(acc.try_decode(0x09).unwrap(), Some(vec![]));
    }
}
