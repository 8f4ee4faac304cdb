//! The HID keyboard/mouse state machine.
//!
//! USB boot-protocol keyboards report at most six simultaneously held
//! keys plus one modifier byte.  This type owns that report state: which
//! usage sits in which slot, which modifier bits are held, and which
//! mouse buttons are down.  It is a pure value type — the serial
//! controller mutates it and then asks the codec to render a packet from
//! it, so every invariant can be tested here without hardware.
//!
//! Invariants upheld:
//! - at most six non-zero entries in `keyboard_buttons`;
//! - a usage appears at most once across all slots;
//! - slots hold USB HID usage IDs, never raw browser keycodes.

use thiserror::Error;

/// All six boot-protocol key slots are occupied.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("all six keyboard slots are occupied")]
pub struct SlotsFull;

/// Wire bit for the left mouse button.
pub const MOUSE_LEFT: u8 = 0x01;
/// Wire bit for the right mouse button.
pub const MOUSE_RIGHT: u8 = 0x02;
/// Wire bit for the middle mouse button.
pub const MOUSE_MIDDLE: u8 = 0x04;

/// Maps a browser button number (1 = left, 2 = right, 3 = middle) to its
/// wire bit.  Note the wire order differs from the numbering: middle is
/// bit 2 on the wire.
pub fn wire_mask_for_button(button: u8) -> Option<u8> {
    match button {
        1 => Some(MOUSE_LEFT),
        2 => Some(MOUSE_RIGHT),
        3 => Some(MOUSE_MIDDLE),
        _ => None,
    }
}

/// Current report state of the emulated keyboard and mouse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HidState {
    /// Modifier byte of the keyboard report (see [`crate::keymap::modifiers`]).
    pub modkey: u8,
    /// Boot-protocol key slots, zero-padded, each a HID usage ID.
    pub keyboard_buttons: [u8; 6],
    /// LED state last reported by the chip (num/caps/scroll lock).
    pub leds: u8,
    /// Mouse button byte (low three bits: left/right/middle).
    pub mouse_buttons: u8,
}

impl HidState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `usage` in the first free key slot.
    ///
    /// Returns `Ok(true)` when the state changed (a report should be
    /// emitted), `Ok(false)` when the key was already held (silent no-op),
    /// and [`SlotsFull`] when all six slots are taken.
    pub fn press_usage(&mut self, usage: u8) -> Result<bool, SlotsFull> {
        if self.keyboard_buttons.contains(&usage) {
            return Ok(false);
        }
        for slot in self.keyboard_buttons.iter_mut() {
            if *slot == 0x00 {
                *slot = usage;
                return Ok(true);
            }
        }
        Err(SlotsFull)
    }

    /// Clears the slot holding `usage`.
    ///
    /// Returns `true` when the state changed; releasing a key that was
    /// never pressed is a no-op.
    pub fn release_usage(&mut self, usage: u8) -> bool {
        for slot in self.keyboard_buttons.iter_mut() {
            if *slot == usage {
                *slot = 0x00;
                return true;
            }
        }
        false
    }

    /// Sets a modifier bit.
    pub fn set_modifier(&mut self, bit: u8) {
        self.modkey |= bit;
    }

    /// Clears a modifier bit.
    pub fn clear_modifier(&mut self, bit: u8) {
        self.modkey &= !bit;
    }

    /// Sets a mouse button wire bit.
    pub fn press_mouse_button(&mut self, mask: u8) {
        self.mouse_buttons |= mask;
    }

    /// Clears a mouse button wire bit; a mask of 0 clears all buttons.
    pub fn release_mouse_button(&mut self, mask: u8) {
        if mask == 0 {
            self.mouse_buttons = 0;
        } else {
            self.mouse_buttons &= !mask;
        }
    }

    /// Synchronises the mouse button byte from a move event's bitfield.
    ///
    /// Move events carry buttons as `b0 = left, b1 = middle, b2 = right`,
    /// while the wire wants `left = 0x01, right = 0x02, middle = 0x04` —
    /// the middle/right positions swap between the two encodings and must
    /// be remapped, not copied.
    pub fn sync_buttons_from_move(&mut self, move_bits: u8) {
        let pairs = [
            (0x01u8, MOUSE_LEFT),
            (0x02u8, MOUSE_MIDDLE),
            (0x04u8, MOUSE_RIGHT),
        ];
        for (event_bit, wire_bit) in pairs {
            if move_bits & event_bit != 0 {
                self.mouse_buttons |= wire_bit;
            } else {
                self.mouse_buttons &= !wire_bit;
            }
        }
    }

    /// Number of occupied key slots, used by diagnostics and tests.
    pub fn pressed_count(&self) -> usize {
        self.keyboard_buttons.iter().filter(|&&s| s != 0).count()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(state: &HidState) {
        assert!(state.pressed_count() <= 6);
        let mut seen = Vec::new();
        for &slot in &state.keyboard_buttons {
            if slot != 0 {
                assert!(
                    !seen.contains(&slot),
                    "usage 0x{slot:02X} appears in more than one slot"
                );
                seen.push(slot);
            }
        }
    }

    #[test]
    fn test_press_places_in_first_free_slot() {
        let mut state = HidState::new();
        assert_eq!(state.press_usage(0x04), Ok(true));
        assert_eq!(state.keyboard_buttons[0], 0x04);
        assert_eq!(state.press_usage(0x05), Ok(true));
        assert_eq!(state.keyboard_buttons[1], 0x05);
        assert_invariants(&state);
    }

    #[test]
    fn test_double_press_is_silent_noop() {
        let mut state = HidState::new();
        assert_eq!(state.press_usage(0x04), Ok(true));
        assert_eq!(state.press_usage(0x04), Ok(false));
        assert_eq!(state.pressed_count(), 1);
        assert_invariants(&state);
    }

    #[test]
    fn test_seventh_key_fails_slots_full() {
        let mut state = HidState::new();
        for usage in 0x04..0x0A {
            assert_eq!(state.press_usage(usage), Ok(true));
        }
        assert_eq!(state.press_usage(0x0A), Err(SlotsFull));
        assert_eq!(state.pressed_count(), 6);
        assert_invariants(&state);
    }

    #[test]
    fn test_release_frees_slot_for_reuse() {
        let mut state = HidState::new();
        state.press_usage(0x04).unwrap();
        state.press_usage(0x05).unwrap();
        assert!(state.release_usage(0x04));
        assert_eq!(state.keyboard_buttons[0], 0x00);
        // The freed slot is the first zero slot again.
        state.press_usage(0x06).unwrap();
        assert_eq!(state.keyboard_buttons[0], 0x06);
        assert_invariants(&state);
    }

    #[test]
    fn test_release_of_unpressed_key_is_noop() {
        let mut state = HidState::new();
        assert!(!state.release_usage(0x2C));
        assert_eq!(state, HidState::new());
    }

    #[test]
    fn test_random_press_release_sequence_holds_invariants() {
        // A deterministic pseudo-random walk over press/release calls.
        let mut state = HidState::new();
        let mut x: u32 = 0x1234_5678;
        for _ in 0..500 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let usage = ((x >> 8) % 20 + 4) as u8;
            if x & 1 == 0 {
                let _ = state.press_usage(usage);
            } else {
                state.release_usage(usage);
            }
            assert_invariants(&state);
        }
    }

    #[test]
    fn test_modifier_bits_set_and_clear() {
        use crate::keymap::modifiers::*;
        let mut state = HidState::new();
        state.set_modifier(L_CTRL);
        state.set_modifier(R_SHIFT);
        assert_eq!(state.modkey, L_CTRL | R_SHIFT);
        state.clear_modifier(L_CTRL);
        assert_eq!(state.modkey, R_SHIFT);
        state.clear_modifier(R_SHIFT);
        assert_eq!(state.modkey, 0);
    }

    #[test]
    fn test_mouse_button_press_release() {
        let mut state = HidState::new();
        state.press_mouse_button(MOUSE_LEFT);
        state.press_mouse_button(MOUSE_MIDDLE);
        assert_eq!(state.mouse_buttons, 0x05);
        state.release_mouse_button(MOUSE_LEFT);
        assert_eq!(state.mouse_buttons, 0x04);
    }

    #[test]
    fn test_release_all_mouse_buttons_with_zero_mask() {
        let mut state = HidState::new();
        state.press_mouse_button(MOUSE_LEFT | MOUSE_RIGHT | MOUSE_MIDDLE);
        state.release_mouse_button(0);
        assert_eq!(state.mouse_buttons, 0);
    }

    #[test]
    fn test_sync_buttons_remaps_middle_and_right() {
        let mut state = HidState::new();
        // Event bitfield: left + middle held (b0 | b1).
        state.sync_buttons_from_move(0x03);
        assert_eq!(state.mouse_buttons, MOUSE_LEFT | MOUSE_MIDDLE); // 0x05 on the wire

        // Event bitfield: right only (b2).
        state.sync_buttons_from_move(0x04);
        assert_eq!(state.mouse_buttons, MOUSE_RIGHT); // 0x02 on the wire
    }

    #[test]
    fn test_sync_buttons_releases_cleared_bits() {
        let mut state = HidState::new();
        state.press_mouse_button(MOUSE_LEFT | MOUSE_RIGHT | MOUSE_MIDDLE);
        state.sync_buttons_from_move(0x00);
        assert_eq!(state.mouse_buttons, 0);
    }

    #[test]
    fn test_wire_mask_for_button() {
        assert_eq!(wire_mask_for_button(1), Some(MOUSE_LEFT));
        assert_eq!(wire_mask_for_button(2), Some(MOUSE_RIGHT));
        assert_eq!(wire_mask_for_button(3), Some(MOUSE_MIDDLE));
        assert_eq!(wire_mask_for_button(0), None);
        assert_eq!(wire_mask_for_button(4), None);
    }
}
