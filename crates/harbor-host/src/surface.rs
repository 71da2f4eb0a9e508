//! Loopback websocket transport for the embedded surface.
//!
//! Each accepted connection is one surface lifetime. Frames are forwarded
//! to the coordinator verbatim; decoding and readiness gating happen there.

use crate::events::HostEvent;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use harbor_core::bridge::DEFAULT_MAX_FRAME_BYTES;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const OUTBOUND_QUEUE: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BridgeServer {
    events: mpsc::Sender<HostEvent>,
    next_id: AtomicU64,
}

impl BridgeServer {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/bridge", get(bridge_handler))
            .route("/health", get(|| async { "ok" }))
            .with_state(self.clone())
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let surface_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let write_task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let send = ws_sender.send(Message::Text(text));
                if tokio::time::timeout(WRITE_TIMEOUT, send).await.is_err() {
                    warn!(event = "surface_write_timeout", surface_id);
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        info!(event = "surface_connected", surface_id, remote = %remote);
        if self
            .events
            .send(HostEvent::SurfaceAttached {
                surface_id,
                outbound: tx,
            })
            .await
            .is_err()
        {
            write_task.abort();
            return;
        }

        while let Some(result) = ws_receiver.next().await {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    warn!(event = "surface_read_error", surface_id, error = %err);
                    break;
                }
            };
            let raw = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "decode_error", surface_id, reason = "binary frame is not utf-8");
                        continue;
                    }
                },
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if raw.len() > DEFAULT_MAX_FRAME_BYTES {
                warn!(event = "decode_error", surface_id, size = raw.len(), reason = "oversized");
                continue;
            }
            if self
                .events
                .send(HostEvent::SurfaceFrame { surface_id, raw })
                .await
                .is_err()
            {
                break;
            }
        }

        let _ = self
            .events
            .send(HostEvent::SurfaceDetached { surface_id })
            .await;
        debug!(event = "surface_disconnected", surface_id);
        let _ = write_task.await;
    }
}

async fn bridge_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(server): State<Arc<BridgeServer>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        server.handle_socket(socket, addr).await;
    })
}

/// Serves the bridge on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: tokio::net::TcpListener,
    server: Arc<BridgeServer>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = server.router();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await
}
