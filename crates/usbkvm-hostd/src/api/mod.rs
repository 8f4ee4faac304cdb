//! HTTP/WebSocket adapters over the device layer.
//!
//! Two route tables are offered:
//!
//! | Mode    | Routes |
//! |---------|--------|
//! | usbkvm  | `/hid`, `/audio`, `/stream`, `/aux/*` — one implicit instance |
//! | ipkvm   | `/api/v1/instances`, `/api/v1/{stream,hid}/{uuid}/…`, `/api/v1/mass_storage/switch` |
//!
//! Handlers resolve their target instance from the shared registry (or
//! the captured single instance) — never from process globals — and map
//! [`DeviceError`] onto HTTP status codes in one place.

pub mod auxapi;
pub mod hid;
pub mod stream;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;

use usbkvm_device::{DeviceError, KvmInstance, KvmRegistry};

/// Maps a device-layer error onto the HTTP status its endpoint returns.
pub fn status_for(err: &DeviceError) -> StatusCode {
    match err {
        DeviceError::NotFound(_) => StatusCode::NOT_FOUND,
        DeviceError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        DeviceError::InvalidButton(_)
        | DeviceError::InvalidEvent(_)
        | DeviceError::InvalidConfig(_)
        | DeviceError::UnsupportedKey(_)
        | DeviceError::UnsupportedResolution { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders a device-layer error as a plain-text HTTP response.
pub fn error_response(err: DeviceError) -> Response {
    (status_for(&err), err.to_string()).into_response()
}

/// Routes for single-dongle (usbkvm) mode: the instance is captured into
/// every handler.
pub fn single_instance_router(instance: Arc<KvmInstance>) -> Router {
    Router::new()
        .route("/hid", get(hid::hid_events_single))
        .route("/audio", get(stream::audio_single))
        .route("/stream", get(stream::video_single))
        .route("/aux/switchusbkvm", any(auxapi::switch_usb_kvm))
        .route("/aux/switchusbremote", any(auxapi::switch_usb_remote))
        .route("/aux/presspower", any(auxapi::press_power))
        .route("/aux/releasepower", any(auxapi::release_power))
        .route("/aux/pressreset", any(auxapi::press_reset))
        .route("/aux/releasereset", any(auxapi::release_reset))
        .route("/aux/getuuid", any(auxapi::get_uuid))
        .with_state(instance)
}

/// Routes for multi-dongle (ipkvm) mode: handlers address instances by
/// UUID through the registry.
pub fn multi_instance_router(registry: Arc<KvmRegistry>) -> Router {
    Router::new()
        .route("/api/v1/instances", get(auxapi::list_instances))
        .route("/api/v1/stream/:uuid/video", get(stream::video_by_uuid))
        .route("/api/v1/stream/:uuid/audio", get(stream::audio_by_uuid))
        .route("/api/v1/hid/:uuid/events", get(hid::hid_events_by_uuid))
        .route(
            "/api/v1/mass_storage/switch",
            post(auxapi::switch_mass_storage),
        )
        .with_state(registry)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use usbkvm_core::event::EventDecodeError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&DeviceError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DeviceError::NotImplemented("aux")),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            status_for(&DeviceError::InvalidButton(9)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DeviceError::InvalidEvent(EventDecodeError::UnknownEvent(7))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DeviceError::UnsupportedResolution {
                width: 1,
                height: 2,
                fps: 3
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DeviceError::ReplyTimeout),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
