//! End-to-end vectors for the wire codec driven through the state machine,
//! the way the serial controller composes them at runtime.

use usbkvm_core::keymap::{self, modifiers};
use usbkvm_core::protocol::codec;
use usbkvm_core::state::HidState;

/// Renders the keyboard report the controller would emit for the current
/// state — the same composition `HidController` performs.
fn report_for(state: &HidState) -> [u8; 14] {
    codec::keyboard_report(state.modkey, &state.keyboard_buttons)
}

#[test]
fn pressing_a_from_empty_state_emits_the_known_packet() {
    let mut state = HidState::new();
    let usage = keymap::usage_for_browser_keycode(65);
    assert_eq!(usage, 0x04);
    state.press_usage(usage).unwrap();

    let packet = report_for(&state);
    let mut expected = [
        0x57, 0xAB, 0x00, 0x02, 0x08, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    expected[13] = codec::checksum(&expected[..13]);
    assert_eq!(packet, expected);
}

#[test]
fn ctrl_then_a_reports_modifier_and_slot_together() {
    let mut state = HidState::new();

    // press(17, false): left Ctrl sets its modifier bit.
    let bit = keymap::modifier_bit(17, false).unwrap();
    state.set_modifier(bit);
    let first = report_for(&state);
    assert_eq!(first[5], modifiers::L_CTRL);

    // press(65, false): 'A' lands in slot 0 with the modifier still held.
    state
        .press_usage(keymap::usage_for_browser_keycode(65))
        .unwrap();
    let second = report_for(&state);
    assert_eq!(second[5], 0x01, "modkey must still be 0x01");
    assert_eq!(second[7], 0x04, "slot0 must hold usage 0x04");
}

#[test]
fn every_emitted_packet_is_checksum_sealed() {
    let packets: Vec<Vec<u8>> = vec![
        codec::keyboard_report(0x00, &[0; 6]).to_vec(),
        codec::keyboard_report(0xFF, &[0x04, 0x05, 0x06, 0x07, 0x08, 0x09]).to_vec(),
        codec::mouse_absolute(0x07, 0xFFFF, 0x0000).to_vec(),
        codec::mouse_relative(0x00, 0x7F, 0xFF, 0x01).to_vec(),
        codec::get_config_request().to_vec(),
        codec::set_config_with_baud(&[0x5A; 50], 115_200),
    ];
    for packet in packets {
        let last = packet.len() - 1;
        assert_eq!(
            codec::checksum(&packet[..last]),
            packet[last],
            "unsealed packet: {packet:02X?}"
        );
    }
}

#[test]
fn relative_move_never_carries_a_0x80_delta_byte() {
    for dx in [0x00u8, 0x7F, 0x80, 0x81, 0xFF] {
        for dy in [0x00u8, 0x80] {
            let packet = codec::mouse_relative(0x00, dx, dy, 0x00);
            assert_ne!(packet[7], 0x80, "dx byte leaked 0x80");
            assert_ne!(packet[8], 0x80, "dy byte leaked 0x80");
        }
    }
}

#[test]
fn keyboard_report_round_trips_through_the_parser() {
    let mut state = HidState::new();
    state.set_modifier(modifiers::L_SHIFT);
    for code in [65u8, 83, 68, 70] {
        state
            .press_usage(keymap::usage_for_browser_keycode(code))
            .unwrap();
    }
    let packet = report_for(&state);
    let (modkey, slots) = codec::parse_keyboard_report(&packet).unwrap();
    assert_eq!(modkey, state.modkey);
    assert_eq!(slots, state.keyboard_buttons);
}

#[test]
fn numpad_enter_remap_targets_usage_0x58() {
    // Enter with the right-modifier flag is remapped to the synthetic
    // Numpad-Enter keycode before translation.
    assert_eq!(
        keymap::usage_for_browser_keycode(keymap::BROWSER_NUMPAD_ENTER),
        keymap::USAGE_NUMPAD_ENTER
    );
}

#[test]
fn set_config_preserves_non_baud_bytes_for_all_supported_rates() {
    for baud in [9_600u32, 19_200, 115_200] {
        let original: [u8; 50] = std::array::from_fn(|i| i as u8);
        let packet = codec::set_config_with_baud(&original, baud);
        let payload = &packet[5..55];
        assert_eq!(&payload[..3], &original[..3]);
        assert_eq!(&payload[7..], &original[7..]);
        let mut block = [0u8; 50];
        block.copy_from_slice(payload);
        assert_eq!(codec::baud_from_config(&block), baud);
    }
}
