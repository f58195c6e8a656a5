use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::events;
use crate::state::AppState;
use crate::ws::{broadcast, ConnectionId};

/// Run the actor-per-connection pattern for an accepted WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: dispatches inbound frames to the event router
/// - Ping task: keepalive pings, closes the link on a missed pong
///
/// The mpsc channel allows any part of the system to push messages to this
/// client by cloning the sender out of the connection table.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::mint();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    state.connections.insert(conn, tx.clone());
    tracing::info!(conn_id = %conn, "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_interval = Duration::from_secs(state.config.ws_ping_interval_secs);
    let pong_timeout = Duration::from_secs(state.config.ws_pong_timeout_secs);
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!(conn_id = %conn, "pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    events::dispatch(&state, conn, text.as_str());
                }
                Message::Binary(data) => {
                    // The protocol is JSON text; binary frames are noise.
                    tracing::debug!(
                        conn_id = %conn,
                        bytes = data.len(),
                        "ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(conn_id = %conn, reason = ?frame, "client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(conn_id = %conn, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                // Stream ended — client disconnected
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    state.connections.remove(&conn);
    state.rate_gate.remove(conn);

    // Endpoint enters the disconnected-with-grace substate; waiting drivers
    // hear about a departed user immediately.
    let outcome = state.registry.unbind(conn, Instant::now());
    broadcast::notify_ping_removals(&state, &outcome.ping_removals, Some("user_disconnected"));

    tracing::info!(
        conn_id = %conn,
        account_id = outcome.account_id.as_deref().unwrap_or("-"),
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from the mpsc channel and forwards them
/// to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
