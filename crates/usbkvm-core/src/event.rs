//! The browser-facing HID event model.
//!
//! Browsers send HID input over the WebSocket as flat JSON objects with a
//! numeric `event` discriminant and a grab-bag of optional fields:
//!
//! ```json
//! {"event":0,"keycode":65}
//! {"event":2,"mouse_x":2048,"mouse_y":1024,"mouse_move_button_state":1}
//! {"event":5,"mouse_scroll":-3}
//! ```
//!
//! Rather than passing that loosely-typed shape through the system, the
//! envelope is decoded once — here — into the [`HidEvent`] sum type, and
//! anything with an unknown discriminant or an out-of-range field fails
//! with a clear [`EventDecodeError`] instead of being silently ignored.
//!
//! | `event` | Variant        |
//! |---------|----------------|
//! | 0       | `KeyPress`     |
//! | 1       | `KeyRelease`   |
//! | 2       | `MouseMove`    |
//! | 3       | `MousePress`   |
//! | 4       | `MouseRelease` |
//! | 5       | `MouseScroll`  |
//! | 6       | `Command`      |
//! | 0xFF    | `Reset`        |

use serde::Deserialize;
use thiserror::Error;

/// Decoding failures for incoming HID event JSON.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    /// The `event` field holds a discriminant this host does not know.
    #[error("unknown event discriminant: {0}")]
    UnknownEvent(i64),

    /// A field was present but outside its valid range.
    #[error("invalid event field: {0}")]
    InvalidField(&'static str),
}

/// Raw JSON envelope exactly as the browser sends it.
///
/// All fields except `event` are optional; absent fields default to zero
/// or `false`, matching how the browser-side script omits fields that do
/// not apply to the event being sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HidEventEnvelope {
    pub event: i64,
    #[serde(default)]
    pub keycode: i64,
    #[serde(default)]
    pub is_right_modifier_key: bool,
    #[serde(default)]
    pub mouse_x: i64,
    #[serde(default)]
    pub mouse_y: i64,
    #[serde(default)]
    pub mouse_rel_x: i64,
    #[serde(default)]
    pub mouse_rel_y: i64,
    #[serde(default)]
    pub mouse_move_button_state: i64,
    #[serde(default)]
    pub mouse_button: i64,
    #[serde(default)]
    pub mouse_scroll: i64,
}

/// A decoded HID input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidEvent {
    /// A key went down.  `keycode` is a browser virtual-key code.
    KeyPress { keycode: u8, right_modifier: bool },
    /// A key came up.
    KeyRelease { keycode: u8, right_modifier: bool },
    /// Cursor movement with the current button bitfield
    /// (`b0 = left, b1 = middle, b2 = right`).
    MouseMove {
        abs_x: u16,
        abs_y: u16,
        rel_x: i32,
        rel_y: i32,
        buttons: u8,
    },
    /// A mouse button went down.  `button` is 1/2/3 for left/right/middle;
    /// other values are rejected downstream with `InvalidButton`.
    MousePress { button: i64 },
    /// A mouse button came up.
    MouseRelease { button: i64 },
    /// Wheel tilt; positive scrolls up, negative down, magnitude ≤ 127.
    MouseScroll { tilt: i32 },
    /// Raw pass-through command slot.  Decoded for protocol completeness
    /// but not an operation this host performs.
    Command,
    /// Operation-queue reset request.  Same status as `Command`.
    Reset,
}

impl TryFrom<HidEventEnvelope> for HidEvent {
    type Error = EventDecodeError;

    fn try_from(raw: HidEventEnvelope) -> Result<Self, Self::Error> {
        match raw.event {
            0 | 1 => {
                let keycode = u8::try_from(raw.keycode)
                    .map_err(|_| EventDecodeError::InvalidField("keycode out of range"))?;
                if raw.event == 0 {
                    Ok(HidEvent::KeyPress {
                        keycode,
                        right_modifier: raw.is_right_modifier_key,
                    })
                } else {
                    Ok(HidEvent::KeyRelease {
                        keycode,
                        right_modifier: raw.is_right_modifier_key,
                    })
                }
            }
            2 => Ok(HidEvent::MouseMove {
                // Absolute coordinates are 16-bit device values; the
                // browser scales into 0..=0xFFFF before sending.
                abs_x: (raw.mouse_x & 0xFFFF) as u16,
                abs_y: (raw.mouse_y & 0xFFFF) as u16,
                rel_x: raw.mouse_rel_x as i32,
                rel_y: raw.mouse_rel_y as i32,
                buttons: (raw.mouse_move_button_state & 0xFF) as u8,
            }),
            3 => Ok(HidEvent::MousePress {
                button: raw.mouse_button,
            }),
            4 => Ok(HidEvent::MouseRelease {
                button: raw.mouse_button,
            }),
            5 => {
                let tilt = i32::try_from(raw.mouse_scroll)
                    .map_err(|_| EventDecodeError::InvalidField("mouse_scroll out of range"))?;
                Ok(HidEvent::MouseScroll { tilt })
            }
            6 => Ok(HidEvent::Command),
            0xFF => Ok(HidEvent::Reset),
            other => Err(EventDecodeError::UnknownEvent(other)),
        }
    }
}

impl HidEvent {
    /// Decodes a raw JSON text frame into an event.
    pub fn from_json(text: &str) -> Result<Self, EventDecodeError> {
        let raw: HidEventEnvelope = serde_json::from_str(text)
            .map_err(|_| EventDecodeError::InvalidField("malformed JSON envelope"))?;
        Self::try_from(raw)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
