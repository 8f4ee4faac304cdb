//! Aux MCU endpoints, the instance listing, and the mass-storage switch.
//!
//! In usbkvm mode the aux routes operate on the captured instance and
//! answer 501 when the dongle has no (responding) aux MCU — the same
//! surface, whether or not the hardware is populated, so the web client
//! never has to special-case missing routes.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use usbkvm_device::{KvmInstance, KvmRegistry, MassStorageSide};

use crate::api::error_response;

// ── Single-instance aux routes ────────────────────────────────────────────────

pub async fn switch_usb_kvm(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.switch_mass_storage(MassStorageSide::Kvm).await {
        Ok(()) => {
            info!("switched USB mass storage to KVM side");
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn switch_usb_remote(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.switch_mass_storage(MassStorageSide::Remote).await {
        Ok(()) => {
            info!("switched USB mass storage to remote side");
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn press_power(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.press_power_button().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn release_power(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.release_power_button().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn press_reset(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.press_reset_button().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn release_reset(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.release_reset_button().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_uuid(State(instance): State<Arc<KvmInstance>>) -> Response {
    match instance.aux_uuid().await {
        Ok(uuid) => Json(serde_json::json!({ "uuid": uuid })).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Multi-instance routes ─────────────────────────────────────────────────────

/// `GET /api/v1/instances`.
pub async fn list_instances(State(registry): State<Arc<KvmRegistry>>) -> Response {
    Json(registry.list().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct MassStorageSwitchForm {
    pub uuid: String,
    pub side: String,
}

/// `POST /api/v1/mass_storage/switch` with form fields `uuid` and
/// `side=kvm|remote`.
pub async fn switch_mass_storage(
    State(registry): State<Arc<KvmRegistry>>,
    Form(form): Form<MassStorageSwitchForm>,
) -> Response {
    let side = match form.side.as_str() {
        "kvm" => MassStorageSide::Kvm,
        "remote" => MassStorageSide::Remote,
        _ => {
            return (StatusCode::BAD_REQUEST, "invalid side parameter").into_response();
        }
    };

    let instance = match registry.get_by_uuid(&form.uuid).await {
        Ok(instance) => instance,
        Err(e) => return error_response(e),
    };

    match instance.switch_mass_storage(side).await {
        Ok(()) => {
            info!(uuid = %form.uuid, side = %form.side, "mass storage switched");
            (StatusCode::OK, "OK").into_response()
        }
        Err(e) => error_response(e),
    }
}
