//! Video (multipart MJPEG) and audio (binary WebSocket PCM) streaming.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use usbkvm_device::capture::{AudioQuality, CaptureSupervisor};
use usbkvm_device::{KvmInstance, KvmRegistry};

use crate::api::error_response;

/// Depth of the PCM buffer channel between the session and the socket.
const AUDIO_CHANNEL_DEPTH: usize = 16;

// ── Video ─────────────────────────────────────────────────────────────────────

/// `GET /stream` (usbkvm mode).
pub async fn video_single(State(instance): State<Arc<KvmInstance>>) -> Response {
    video_response(&instance).await
}

/// `GET /api/v1/stream/{uuid}/video` (ipkvm mode).
pub async fn video_by_uuid(
    Path(uuid): Path<String>,
    State(registry): State<Arc<KvmRegistry>>,
) -> Response {
    match registry.get_by_uuid(&uuid).await {
        Ok(instance) => video_response(&instance).await,
        Err(e) => error_response(e),
    }
}

async fn video_response(instance: &Arc<KvmInstance>) -> Response {
    let feed = match Arc::clone(instance.capture()).video_feed().await {
        Ok(feed) => feed,
        Err(e) => return error_response(e),
    };

    // Adapt the feed's chunk channel into a streaming response body.
    let body = Body::from_stream(futures_util::stream::unfold(
        feed.chunks,
        |mut chunks| async move {
            chunks
                .recv()
                .await
                .map(|chunk| (Ok::<_, std::convert::Infallible>(Bytes::from(chunk)), chunks))
        },
    ));

    ([(header::CONTENT_TYPE, feed.content_type)], body).into_response()
}

// ── Audio ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AudioParams {
    #[serde(default)]
    quality: String,
}

/// `GET /audio?quality=low|standard|high` (usbkvm mode).
pub async fn audio_single(
    ws: WebSocketUpgrade,
    Query(params): Query<AudioParams>,
    State(instance): State<Arc<KvmInstance>>,
) -> Response {
    let quality = AudioQuality::parse(&params.quality);
    let supervisor = Arc::clone(instance.capture());
    ws.on_upgrade(move |socket| audio_session(socket, supervisor, quality))
}

/// `GET /api/v1/stream/{uuid}/audio` (ipkvm mode).
pub async fn audio_by_uuid(
    ws: WebSocketUpgrade,
    Path(uuid): Path<String>,
    Query(params): Query<AudioParams>,
    State(registry): State<Arc<KvmRegistry>>,
) -> Response {
    let quality = AudioQuality::parse(&params.quality);
    match registry.get_by_uuid(&uuid).await {
        Ok(instance) => {
            let supervisor = Arc::clone(instance.capture());
            ws.on_upgrade(move |socket| audio_session(socket, supervisor, quality))
        }
        Err(e) => error_response(e),
    }
}

/// Runs one audio client: PCM buffers flow out as binary frames until
/// the client sends the text `"exit"`, disconnects, or a newer session
/// evicts this one.
async fn audio_session(
    socket: WebSocket,
    supervisor: Arc<CaptureSupervisor>,
    quality: AudioQuality,
) {
    let (mut sink, mut stream) = socket.split();
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_DEPTH);

    // The capture session writes PCM into the channel.
    let session = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if let Err(e) = supervisor.run_audio_session(quality, pcm_tx).await {
                warn!(error = %e, "audio session failed");
            }
        })
    };

    // Watch the client side for the "exit" command or a disconnect.
    let control = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) if text.trim() == "exit" => {
                        debug!("audio client sent exit");
                        break;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            supervisor.signal_audio_stop();
        })
    };

    while let Some(payload) = pcm_rx.recv().await {
        if sink.send(Message::Binary(payload)).await.is_err() {
            supervisor.signal_audio_stop();
            break;
        }
    }

    control.abort();
    let _ = session.await;
    debug!("audio client finished");
}
