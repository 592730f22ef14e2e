use std::{borrow::Cow, net::SocketAddr, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::config::MalformedFramePolicy;
use crate::gate::GateError;
use crate::protocol::{ClientMessage, ConnectionId, FrameError, ServerMessage, WireFrame};
use crate::registry::CloseReason;

/// How long a finished reader waits for its writer to flush a close frame.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    ClientClosed,
    TransportError,
    /// The writer stopped first: the server closed the connection.
    WriterFinished,
    AuthFailed,
    Idle,
    Malformed,
}

impl ReadEnd {
    fn as_str(&self) -> &'static str {
        match self {
            ReadEnd::ClientClosed => "client_closed",
            ReadEnd::TransportError => "transport_error",
            ReadEnd::WriterFinished => "server_closed",
            ReadEnd::AuthFailed => "auth_failed",
            ReadEnd::Idle => "idle",
            ReadEnd::Malformed => "malformed",
        }
    }
}

enum Flow {
    Continue,
    Stop(ReadEnd),
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let registration = state.gate.admit(&state.hub);
    let id = registration.id.clone();
    let (sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(
        sink,
        registration.outbound,
        registration.shutdown,
        id.clone(),
    ));

    info!(connection_id = %id, remote_addr = %remote_addr, "websocket connected");

    let ended = read_loop(&mut stream, &state, &id, &mut writer).await;

    state.hub.disconnect(&id);
    if ended != ReadEnd::WriterFinished && timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(connection_id = %id, reason = ended.as_str(), "websocket disconnected");
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    id: &str,
    writer: &mut JoinHandle<()>,
) -> ReadEnd {
    loop {
        let next = tokio::select! {
            next = timeout(state.config.idle_timeout, stream.next()) => next,
            _ = &mut *writer => return ReadEnd::WriterFinished,
        };

        let message = match next {
            Err(_) => {
                info!(connection_id = %id, "no frames within idle timeout");
                state.hub.close(id, CloseReason::IDLE);
                return ReadEnd::Idle;
            }
            Ok(None) => return ReadEnd::ClientClosed,
            Ok(Some(Err(err))) => {
                warn!(connection_id = %id, error = %err, "error receiving message");
                return ReadEnd::TransportError;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            // Binary frames carrying UTF-8 JSON are accepted too.
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => match reject(state, id, FrameError::NotUtf8) {
                    Flow::Continue => continue,
                    Flow::Stop(end) => return end,
                },
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                return ReadEnd::ClientClosed;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Flow::Stop(end) = handle_text(state, id, &text).await {
            return end;
        }
    }
}

/// Decode and dispatch one text frame.
async fn handle_text(state: &AppState, id: &str, text: &str) -> Flow {
    let authenticated = state.hub.is_authenticated(id);
    let frame = match WireFrame::parse(text) {
        Ok(frame) => frame,
        Err(err) => return reject(state, id, err),
    };

    if !authenticated && !frame.is_auth() {
        debug!(connection_id = %id, kind = %frame.kind, "ignoring frame before authentication");
        return Flow::Continue;
    }

    let message = match ClientMessage::decode(frame, &state.config.relay_policy) {
        Ok(message) => message,
        Err(err) => return reject(state, id, err),
    };

    match message {
        ClientMessage::Auth { token } if !authenticated => {
            match state.gate.authenticate(&state.hub, id, &token).await {
                Ok(_) | Err(GateError::AlreadyAuthenticated) => Flow::Continue,
                Err(err) => {
                    debug!(connection_id = %id, error = %err, "authentication failed");
                    Flow::Stop(ReadEnd::AuthFailed)
                }
            }
        }
        ClientMessage::Auth { .. } => {
            debug!(connection_id = %id, "ignoring repeated auth");
            Flow::Continue
        }
        ClientMessage::Ping => {
            state.hub.reply(id, ServerMessage::Pong);
            Flow::Continue
        }
        ClientMessage::Relay(request) => {
            state.hub.relay(id, request);
            Flow::Continue
        }
    }
}

/// Undecodable frames from a connection that has not authenticated yet are
/// dropped without a reply; afterwards the malformed-frame policy applies.
fn reject(state: &AppState, id: &str, err: FrameError) -> Flow {
    counter!("huddle_malformed_frames_total", 1, "reason" => err.metric_label());
    if !state.hub.is_authenticated(id) {
        debug!(connection_id = %id, error = %err, "ignoring undecodable frame before authentication");
        return Flow::Continue;
    }
    warn!(connection_id = %id, error = %err, "malformed frame");
    match state.config.malformed_frames {
        MalformedFramePolicy::Drop => {
            state.hub.reply(
                id,
                ServerMessage::Error {
                    message: err.to_string(),
                },
            );
            Flow::Continue
        }
        MalformedFramePolicy::Close => {
            state.hub.close(id, CloseReason::MALFORMED_FRAME);
            Flow::Stop(ReadEnd::Malformed)
        }
    }
}

/// Drain the connection's outbound queue onto the socket.
///
/// Ends when the registry entry is dropped (queue closed) or the server asks for
/// a close, in which case queued frames go out before the close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut shutdown: oneshot::Receiver<CloseReason>,
    id: ConnectionId,
) {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => {
                    if !send_frame(&mut sink, &id, message).await {
                        break;
                    }
                }
                None => {
                    if let Ok(reason) = shutdown.try_recv() {
                        send_close(&mut sink, reason).await;
                    }
                    break;
                }
            },
            reason = &mut shutdown => {
                if let Ok(reason) = reason {
                    while let Ok(message) = outbound.try_recv() {
                        if !send_frame(&mut sink, &id, message).await {
                            break;
                        }
                    }
                    send_close(&mut sink, reason).await;
                }
                break;
            }
        }
    }
    debug!(connection_id = %id, "writer task finished");
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    id: &str,
    message: ServerMessage,
) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(err) => {
            warn!(connection_id = %id, error = %err, "failed to encode outbound frame");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, reason: CloseReason) {
    let frame = CloseFrame {
        code: reason.code,
        reason: Cow::Borrowed(reason.reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
