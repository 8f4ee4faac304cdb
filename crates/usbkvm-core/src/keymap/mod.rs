//! Browser virtual-key codes → USB HID usage IDs.
//!
//! The browser reports keys as legacy `KeyboardEvent.keyCode` values
//! ('A' is 65, F1 is 112).  The CH9329 wants USB HID usage IDs from the
//! keyboard/keypad page 0x07 ('A' is 0x04, F1 is 0x3A).  HID codes
//! describe physical key positions rather than characters, which is why
//! the same table works for every keyboard layout on the target machine.
//!
//! Unsupported codes map to 0, which callers must treat as "drop the
//! event" — usage 0 is the HID no-key padding value and must never be
//! placed in a key slot.
//!
//! Reference: USB HID Usage Tables 1.3, Section 10.

/// Modifier bits of the boot-protocol report's first byte.
pub mod modifiers {
    pub const L_CTRL: u8 = 0x01;
    pub const L_SHIFT: u8 = 0x02;
    pub const L_ALT: u8 = 0x04;
    pub const L_GUI: u8 = 0x08;
    pub const R_CTRL: u8 = 0x10;
    pub const R_SHIFT: u8 = 0x20;
    pub const R_ALT: u8 = 0x40;
    pub const R_GUI: u8 = 0x80;
}

/// Browser keycode for Enter; combined with the right-modifier flag it
/// selects the numpad variant.
pub const BROWSER_ENTER: u8 = 13;
/// Synthetic browser keycode for Numpad-Enter.
pub const BROWSER_NUMPAD_ENTER: u8 = 146;
/// HID usage for Numpad-Enter.
pub const USAGE_NUMPAD_ENTER: u8 = 0x58;

/// Returns `true` for the four browser keycodes that are modifier keys
/// (Shift 16, Ctrl 17, Alt 18, Meta 91).
pub fn is_modifier_code(code: u8) -> bool {
    matches!(code, 16 | 17 | 18 | 91)
}

/// Returns the modifier bit for a modifier keycode, distinguished by side.
///
/// `None` when `code` is not a modifier key.
pub fn modifier_bit(code: u8, is_right: bool) -> Option<u8> {
    use modifiers::*;
    let bit = match code {
        17 => {
            if is_right {
                R_CTRL
            } else {
                L_CTRL
            }
        }
        16 => {
            if is_right {
                R_SHIFT
            } else {
                L_SHIFT
            }
        }
        18 => {
            if is_right {
                R_ALT
            } else {
                L_ALT
            }
        }
        91 => {
            if is_right {
                R_GUI
            } else {
                L_GUI
            }
        }
        _ => return None,
    };
    Some(bit)
}

/// Translates a browser virtual-key code into a USB HID usage ID.
///
/// Returns 0 for unsupported codes.
pub fn usage_for_browser_keycode(code: u8) -> u8 {
    // Letters A–Z.
    if (65..=90).contains(&code) {
        return (code - 65) + 0x04;
    }
    // Top-row digits 1–9 ('0' is a fixed entry below).
    if (49..=57).contains(&code) {
        return (code - 49) + 0x1E;
    }
    // Numpad 1–9.
    if (97..=105).contains(&code) {
        return (code - 97) + 0x59;
    }
    // F1–F12.
    if (112..=123).contains(&code) {
        return (code - 112) + 0x3A;
    }

    match code {
        8 => 0x2A,   // Backspace
        9 => 0x2B,   // Tab
        13 => 0x28,  // Enter
        16 => 0xE1,  // Left Shift
        17 => 0xE0,  // Left Ctrl
        18 => 0xE6,  // Left Alt
        19 => 0x48,  // Pause
        20 => 0x39,  // Caps Lock
        27 => 0x29,  // Escape
        32 => 0x2C,  // Space
        33 => 0x4B,  // Page Up
        34 => 0x4E,  // Page Down
        35 => 0x4D,  // End
        36 => 0x4A,  // Home
        37 => 0x50,  // Left Arrow
        38 => 0x52,  // Up Arrow
        39 => 0x4F,  // Right Arrow
        40 => 0x51,  // Down Arrow
        44 => 0x46,  // Print Screen (F13 on Firefox)
        45 => 0x49,  // Insert
        46 => 0x4C,  // Delete
        48 => 0x27,  // 0 (top row)
        59 => 0x33,  // ';' (Firefox)
        61 => 0x2E,  // '=' (Firefox)
        91 => 0xE3,  // Left GUI
        92 => 0xE7,  // Right GUI
        93 => 0x65,  // Menu
        96 => 0x62,  // Numpad 0
        106 => 0x55, // Numpad *
        107 => 0x57, // Numpad +
        109 => 0x56, // Numpad -
        110 => 0x63, // Numpad .
        111 => 0x54, // Numpad /
        144 => 0x53, // Num Lock
        145 => 0x47, // Scroll Lock
        146 => 0x58, // Numpad Enter
        173 => 0x2D, // '-' (Firefox)
        186 => 0x33, // ';'
        187 => 0x2E, // '='
        188 => 0x36, // ','
        189 => 0x2D, // '-'
        190 => 0x37, // '.'
        191 => 0x38, // '/'
        192 => 0x35, // '`'
        219 => 0x2F, // '['
        220 => 0x31, // '\'
        221 => 0x30, // ']'
        222 => 0x34, // '\''
        _ => 0x00,   // unsupported
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_range_maps_from_0x04() {
        assert_eq!(usage_for_browser_keycode(65), 0x04); // A
        assert_eq!(usage_for_browser_keycode(66), 0x05); // B
        assert_eq!(usage_for_browser_keycode(90), 0x1D); // Z
    }

    #[test]
    fn test_digit_ranges() {
        assert_eq!(usage_for_browser_keycode(49), 0x1E); // 1
        assert_eq!(usage_for_browser_keycode(57), 0x26); // 9
        assert_eq!(usage_for_browser_keycode(48), 0x27); // 0 is a fixed entry
        assert_eq!(usage_for_browser_keycode(97), 0x59); // numpad 1
        assert_eq!(usage_for_browser_keycode(105), 0x61); // numpad 9
        assert_eq!(usage_for_browser_keycode(96), 0x62); // numpad 0
    }

    #[test]
    fn test_function_key_range() {
        assert_eq!(usage_for_browser_keycode(112), 0x3A); // F1
        assert_eq!(usage_for_browser_keycode(123), 0x45); // F12
    }

    #[test]
    fn test_control_keys() {
        assert_eq!(usage_for_browser_keycode(8), 0x2A); // Backspace
        assert_eq!(usage_for_browser_keycode(13), 0x28); // Enter
        assert_eq!(usage_for_browser_keycode(27), 0x29); // Escape
        assert_eq!(usage_for_browser_keycode(32), 0x2C); // Space
        assert_eq!(usage_for_browser_keycode(37), 0x50); // Left
        assert_eq!(usage_for_browser_keycode(38), 0x52); // Up
        assert_eq!(usage_for_browser_keycode(39), 0x4F); // Right
        assert_eq!(usage_for_browser_keycode(40), 0x51); // Down
        assert_eq!(usage_for_browser_keycode(146), USAGE_NUMPAD_ENTER);
    }

    #[test]
    fn test_unsupported_code_returns_zero() {
        assert_eq!(usage_for_browser_keycode(0), 0x00);
        assert_eq!(usage_for_browser_keycode(255), 0x00);
        assert_eq!(usage_for_browser_keycode(7), 0x00);
    }

    #[test]
    fn test_modifier_bits_by_side() {
        use modifiers::*;
        assert_eq!(modifier_bit(17, false), Some(L_CTRL));
        assert_eq!(modifier_bit(17, true), Some(R_CTRL));
        assert_eq!(modifier_bit(16, false), Some(L_SHIFT));
        assert_eq!(modifier_bit(16, true), Some(R_SHIFT));
        assert_eq!(modifier_bit(18, false), Some(L_ALT));
        assert_eq!(modifier_bit(18, true), Some(R_ALT));
        assert_eq!(modifier_bit(91, false), Some(L_GUI));
        assert_eq!(modifier_bit(91, true), Some(R_GUI));
        assert_eq!(modifier_bit(65, false), None);
    }

    #[test]
    fn test_is_modifier_code() {
        for code in [16u8, 17, 18, 91] {
            assert!(is_modifier_code(code));
        }
        assert!(!is_modifier_code(13));
        assert!(!is_modifier_code(65));
    }
}
