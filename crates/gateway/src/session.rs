//! Lifecycle of one upgraded WebSocket connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use proto::event::DISCONNECT;
use proto::{ConnectionId, DEFAULT_NAMESPACE, Frame, normalize_namespace};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::server::Transport;
use crate::socket::{Outbound, Socket};

/// Drives a connection until either side closes it, then tears it down.
pub(crate) async fn run(ws: WebSocket, remote: Option<SocketAddr>, transport: Arc<Transport>) {
    let (socket, mut outbound) = Socket::new(ConnectionId::new(), remote);
    info!(conn_id = %socket.id(), remote = ?remote, "Connection opened");

    transport
        .namespaces
        .default_namespace()
        .attach(&socket, !transport.auth_required);
    for hook in &transport.hooks {
        hook(&socket);
    }

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Read task: client -> server, one frame at a time
    let read_socket = socket.clone();
    let read_transport = transport.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(conn_id = %read_socket.id(), "Read error: {e}");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    handle_text(&read_transport, &read_socket, text.as_str()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Write task: server -> client
    let write_conn = socket.id().clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            match out {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    debug!(conn_id = %write_conn, code, "Sending close frame");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    teardown(&transport, &socket).await;
}

/// Applies one inbound text message. Malformed frames are skipped.
pub(crate) async fn handle_text(transport: &Transport, socket: &Arc<Socket>, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id = %socket.id(), "Skipping frame: {e}");
            return;
        }
    };

    match frame {
        Frame::Connect { nsp } => {
            let recognised = !transport.auth_required || socket.is_authenticated();
            transport.namespaces.of(&nsp).attach(socket, recognised);
        }
        Frame::Disconnect { nsp } => {
            let nsp = normalize_namespace(&nsp);
            if nsp == DEFAULT_NAMESPACE {
                debug!(conn_id = %socket.id(), "Ignoring detach from default namespace");
                return;
            }
            if let Some(namespace) = transport.namespaces.get(&nsp) {
                namespace.detach(socket.id());
            }
        }
        Frame::Event { nsp, event, data } => {
            if event == DISCONNECT {
                debug!(conn_id = %socket.id(), "Ignoring client-sent disconnect event");
                return;
            }
            let nsp = normalize_namespace(&nsp);
            if nsp == DEFAULT_NAMESPACE {
                socket.fire(&event, data.clone()).await;
                transport
                    .namespaces
                    .default_namespace()
                    .dispatch(socket, &event, data)
                    .await;
                return;
            }
            match transport.namespaces.get(&nsp) {
                Some(namespace) => {
                    namespace.dispatch(socket, &event, data).await;
                }
                None => {
                    debug!(conn_id = %socket.id(), nsp = %nsp, event, "Event for unknown namespace");
                }
            }
        }
    }
}

async fn teardown(transport: &Transport, socket: &Arc<Socket>) {
    socket.mark_closed();
    socket.cancel_grace_timer();
    socket.fire(DISCONNECT, Value::Null).await;
    socket.remove_all_listeners();
    transport.namespaces.detach_all(socket.id());
    info!(conn_id = %socket.id(), "Connection closed");
}
