//! The HID event WebSocket.
//!
//! The browser sends JSON event frames; each one is decoded, dispatched
//! to the instance's HID controller, and answered:
//!
//! - on success, with a text frame of the wire bytes in hex (the browser
//!   console shows exactly what reached the chip);
//! - on a per-event error, with a JSON `{"error": "…"}` frame — the
//!   session continues, because one bad keystroke should not drop the
//!   whole keyboard.
//!
//! Only a transport-level failure ends the session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::{debug, warn};

use usbkvm_core::HidEvent;
use usbkvm_device::hid::translate::hex_pretty;
use usbkvm_device::{DeviceError, KvmInstance, KvmRegistry};

use crate::api::error_response;

/// `GET /hid` (usbkvm mode).
pub async fn hid_events_single(
    ws: WebSocketUpgrade,
    State(instance): State<Arc<KvmInstance>>,
) -> Response {
    ws.on_upgrade(move |socket| hid_session(socket, instance))
}

/// `GET /api/v1/hid/{uuid}/events` (ipkvm mode).
pub async fn hid_events_by_uuid(
    ws: WebSocketUpgrade,
    Path(uuid): Path<String>,
    State(registry): State<Arc<KvmRegistry>>,
) -> Response {
    match registry.get_by_uuid(&uuid).await {
        Ok(instance) => ws.on_upgrade(move |socket| hid_session(socket, instance)),
        Err(e) => error_response(e),
    }
}

async fn hid_session(mut socket: WebSocket, instance: Arc<KvmInstance>) {
    debug!(uuid = %instance.uuid(), "HID session opened");

    while let Some(received) = socket.recv().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "HID session transport error");
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong are answered by the WebSocket layer itself;
            // binary frames have no meaning on this channel.
            _ => continue,
        };

        let outcome = match HidEvent::from_json(&text) {
            Ok(event) => instance.hid().apply_event(&event).await,
            Err(e) => Err(DeviceError::from(e)),
        };

        let reply = match outcome {
            Ok(bytes) => Message::Text(hex_pretty(&bytes)),
            Err(e) => {
                warn!(error = %e, "HID event failed");
                let body = serde_json::json!({ "error": e.to_string() });
                Message::Text(body.to_string())
            }
        };

        if socket.send(reply).await.is_err() {
            debug!("HID session peer gone");
            break;
        }
    }

    debug!(uuid = %instance.uuid(), "HID session closed");
}
