//! Routing of decoded browser events onto the controller operations.
//!
//! This is the seam between the loosely-shaped world of browser input and
//! the strict wire operations: every [`HidEvent`] variant maps onto one
//! controller call (or a deliberate no-op), and everything invalid is
//! rejected here with a typed error before any state changes.

use usbkvm_core::HidEvent;

use crate::error::DeviceError;
use crate::hid::HidController;

/// Minimum interval between cursor events in milliseconds; scroll events
/// arriving faster than this are dropped to keep the UART queue from
/// saturating on inertial trackpads.
pub const MIN_CURSOR_EVENT_INTERVAL_MS: u64 = 25;

impl HidController {
    /// Applies one decoded browser event, returning the bytes that went
    /// on the wire (empty when the event legitimately produced none).
    pub async fn apply_event(&self, event: &HidEvent) -> Result<Vec<u8>, DeviceError> {
        match *event {
            HidEvent::KeyPress {
                keycode,
                right_modifier,
            } => self.key_press(keycode, right_modifier).await,

            HidEvent::KeyRelease {
                keycode,
                right_modifier,
            } => self.key_release(keycode, right_modifier).await,

            HidEvent::MouseMove {
                abs_x,
                abs_y,
                rel_x,
                rel_y,
                buttons,
            } => {
                // The move event carries the full button bitfield; mirror
                // it into the wire state before emitting any motion.
                self.sync_buttons_from_move(buttons).await;
                self.touch_cursor_timestamp().await;

                if abs_x != 0 || abs_y != 0 {
                    return self.move_absolute(abs_x, abs_y).await;
                }
                if rel_x != 0 || rel_y != 0 {
                    // Relative cursor motion is reserved; the browser client
                    // only sends absolute positions today.
                    return Ok(Vec::new());
                }
                Ok(Vec::new())
            }

            HidEvent::MousePress { button } => {
                let button =
                    validate_button(button).ok_or(DeviceError::InvalidButton(button))?;
                self.button_press(button).await
            }

            HidEvent::MouseRelease { button } => {
                let button =
                    validate_button(button).ok_or(DeviceError::InvalidButton(button))?;
                self.button_release(button).await
            }

            HidEvent::MouseScroll { tilt } => {
                if !self
                    .cursor_interval_elapsed(MIN_CURSOR_EVENT_INTERVAL_MS)
                    .await
                {
                    return Ok(Vec::new());
                }
                self.scroll(tilt).await
            }

            HidEvent::Command => Err(DeviceError::NotImplemented(
                "raw HID command pass-through is not supported",
            )),
            HidEvent::Reset => Err(DeviceError::NotImplemented(
                "HID reset over the event channel is not supported",
            )),
        }
    }
}

/// The event schema numbers buttons 1 (left), 2 (right), 3 (middle).
fn validate_button(button: i64) -> Option<u8> {
    match button {
        1..=3 => Some(button as u8),
        _ => None,
    }
}

/// Renders wire bytes the way the WebSocket echoes them back to the
/// browser: `0x57 0xAB 0x00 …` with a trailing space per byte.
pub fn hex_pretty(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 5);
    for b in bytes {
        let _ = write!(out, "0x{b:02X} ");
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::HidConfig;

    fn controller() -> HidController {
        HidController::new(HidConfig::new("/dev/null-hid"))
    }

    #[tokio::test]
    async fn test_invalid_mouse_button_rejected() {
        let c = controller();
        for bad in [0i64, 4, -1, 99] {
            let err = c
                .apply_event(&HidEvent::MousePress { button: bad })
                .await
                .unwrap_err();
            match err {
                DeviceError::InvalidButton(b) => assert_eq!(b, bad),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_mouse_move_without_coordinates_emits_nothing() {
        let c = controller();
        let out = c
            .apply_event(&HidEvent::MouseMove {
                abs_x: 0,
                abs_y: 0,
                rel_x: 0,
                rel_y: 0,
                buttons: 0,
            })
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_relative_only_move_is_reserved() {
        let c = controller();
        let out = c
            .apply_event(&HidEvent::MouseMove {
                abs_x: 0,
                abs_y: 0,
                rel_x: 5,
                rel_y: -3,
                buttons: 0,
            })
            .await
            .unwrap();
        assert!(out.is_empty(), "relative deltas must not reach the wire");
    }

    #[tokio::test]
    async fn test_move_syncs_button_state_even_without_motion() {
        let c = controller();
        c.apply_event(&HidEvent::MouseMove {
            abs_x: 0,
            abs_y: 0,
            rel_x: 0,
            rel_y: 0,
            buttons: 0x03, // left + middle in event encoding
        })
        .await
        .unwrap();
        // Wire encoding: left 0x01 | middle 0x04.
        assert_eq!(c.state().await.mouse_buttons, 0x05);
    }

    #[tokio::test]
    async fn test_rapid_scroll_is_rate_limited() {
        let c = controller();
        // A move event stamps the cursor clock …
        c.apply_event(&HidEvent::MouseMove {
            abs_x: 0,
            abs_y: 0,
            rel_x: 0,
            rel_y: 0,
            buttons: 0,
        })
        .await
        .unwrap();
        // … so a scroll inside the 25 ms window is dropped silently.
        let out = c
            .apply_event(&HidEvent::MouseScroll { tilt: -3 })
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_command_and_reset_are_not_implemented() {
        let c = controller();
        assert!(matches!(
            c.apply_event(&HidEvent::Command).await.unwrap_err(),
            DeviceError::NotImplemented(_)
        ));
        assert!(matches!(
            c.apply_event(&HidEvent::Reset).await.unwrap_err(),
            DeviceError::NotImplemented(_)
        ));
    }

    #[test]
    fn test_hex_pretty_format() {
        assert_eq!(hex_pretty(&[0x57, 0xAB, 0x00]), "0x57 0xAB 0x00 ");
        assert_eq!(hex_pretty(&[]), "");
    }
}
