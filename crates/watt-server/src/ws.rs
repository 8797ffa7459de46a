//! Live feed WebSocket endpoint
//!
//! The feed is one-way: a full snapshot on connect, then deltas as the
//! poll loop publishes them, then a goodbye frame on daemon shutdown.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use watt_live::LiveUpdate;

use crate::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    state.requests_total.add(1, &[]);
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

async fn handle_viewer(socket: WebSocket, state: Arc<AppState>) {
    let sub = state.hub.subscribe();
    let viewer_id = sub.viewer_id;
    info!(viewer_id, "viewer connected");

    let (mut sender, mut receiver) = socket.split();

    // Full state first, so the deltas that follow have something to
    // apply to. Before the first poll cycle there is nothing to send.
    if let Some(snapshot) = sub.baseline {
        match LiveUpdate::Snapshot(snapshot).to_message() {
            Ok(json) => {
                if sender.send(Message::Text(json)).await.is_err() {
                    state.hub.unsubscribe(viewer_id);
                    return;
                }
            }
            Err(e) => warn!(viewer_id, error = %e, "failed to serialize baseline"),
        }
    }

    let mut rx = sub.rx;
    let mut send_task = tokio::spawn(async move {
        // rx ends when the hub evicts this viewer
        while let Some(update) = rx.recv().await {
            let closing = matches!(update, LiveUpdate::Goodbye);
            let json = match update.to_message() {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "failed to serialize update");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
            if closing {
                break;
            }
        }
        // evicted or saying goodbye: close the transport cleanly
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                    debug!("ignoring inbound frame on one-way feed");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(viewer_id);
    info!(viewer_id, "viewer disconnected");
}
