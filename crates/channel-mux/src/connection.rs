//! Session task: transport open, handshake, dispatch loop, and reconnection.
//!
//! One task runs per session. It owns the WebSocket and both timers (the
//! handshake timeout and the reconnect delay), so cancelling the session
//! cancels everything at once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::manager::Shared;
use crate::protocol::{Frame, classify, decode_msg, encode_auth_msg};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// Stand-in deadline when no idle timeout is configured; the branch is
/// disabled in that case anyway.
const IDLE_DISABLED: Duration = Duration::from_secs(86_400);

/// Next idle deadline. Timeouts too large to represent behave as disabled.
fn idle_deadline(idle_for: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(idle_for).unwrap_or_else(|| now + IDLE_DISABLED)
}

enum SessionEnd {
    /// `disconnect()` or a newer `connect()` took over.
    Cancelled,
    /// Transport failure of any kind; counts against the retry budget.
    Lost(Error),
    AuthRejected(String),
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

pub(crate) async fn run_session(shared: Arc<Shared>, session: u64, cancel: CancellationToken) {
    loop {
        match run_attempt(&shared, session, &cancel).await {
            SessionEnd::Cancelled => {
                tracing::debug!(session, "session cancelled");
                return;
            }
            SessionEnd::AuthRejected(reason) => {
                tracing::error!(session, %reason, "hub rejected credentials");
                shared.auth_rejected(session, &reason);
                return;
            }
            SessionEnd::Lost(err) => {
                let Some(delay) = shared.attempt_failed(session, &err) else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(session, "reconnect cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if !shared.begin_reconnect(session) {
                    return;
                }
            }
        }
    }
}

async fn run_attempt(shared: &Shared, session: u64, cancel: &CancellationToken) -> SessionEnd {
    let handshake = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        result = tokio::time::timeout(
            shared.config.connect_timeout,
            open_and_authenticate(shared, session),
        ) => result,
    };
    let (ws_write, ws_read) = match handshake {
        Ok(Ok(halves)) => halves,
        Ok(Err(Error::AuthRejected(reason))) => return SessionEnd::AuthRejected(reason),
        Ok(Err(e)) => return SessionEnd::Lost(e),
        Err(_) => return SessionEnd::Lost(Error::Timeout("connection handshake")),
    };

    let (out_tx, out_rx) = mpsc::channel(shared.config.outbound_capacity.max(1));
    if !shared.authenticated(session, out_tx) {
        return SessionEnd::Cancelled;
    }
    tracing::info!(session, "authenticated with hub");
    dispatch_loop(shared, session, cancel, ws_write, ws_read, out_rx).await
}

// ---------------------------------------------------------------------------
// Connect + handshake
// ---------------------------------------------------------------------------

async fn open_and_authenticate(
    shared: &Shared,
    session: u64,
) -> Result<(WsWrite, WsRead), Error> {
    let token = (shared.config.get_token)()
        .await
        .map_err(Error::TokenFetch)?;
    let (ws, _resp) = tokio_tungstenite::connect_async(shared.config.url.as_str()).await?;
    let (mut ws_write, mut ws_read) = ws.split();
    if !shared.transport_opened(session) {
        return Err(Error::Protocol("session superseded".into()));
    }
    tracing::info!(session, "transport open, sending auth frame");
    ws_write
        .send(Message::Text(encode_auth_msg(&token)?.into()))
        .await?;
    wait_for_auth_ack(shared, session, &mut ws_read).await?;
    Ok((ws_write, ws_read))
}

async fn wait_for_auth_ack(
    shared: &Shared,
    session: u64,
    ws_read: &mut WsRead,
) -> Result<(), Error> {
    while let Some(frame) = ws_read.next().await {
        match frame? {
            Message::Text(text) => {
                let msg = match decode_msg(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(session, "dropping malformed frame: {e}");
                        continue;
                    }
                };
                match classify(msg) {
                    Frame::AuthAck { accepted: true, .. } => return Ok(()),
                    Frame::AuthAck {
                        accepted: false,
                        message,
                    } => {
                        return Err(Error::AuthRejected(
                            message.unwrap_or_else(|| "no reason given".to_string()),
                        ));
                    }
                    Frame::ChannelList(channels) => shared.replace_channel_list(session, channels),
                    Frame::Channel { channel, .. } => {
                        tracing::debug!(%channel, "dropping channel frame before auth_ack");
                    }
                    Frame::Unrecognized(kind) => {
                        tracing::debug!(%kind, "ignoring pre-auth frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::Protocol(
        "connection closed before auth_ack received".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Steady state
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    shared: &Shared,
    session: u64,
    cancel: &CancellationToken,
    mut ws_write: WsWrite,
    mut ws_read: WsRead,
    mut out_rx: mpsc::Receiver<String>,
) -> SessionEnd {
    let idle_timeout = shared.config.idle_timeout;
    let idle_for = idle_timeout.unwrap_or(IDLE_DISABLED);
    let mut deadline = idle_deadline(idle_for);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(session, "closing hub connection");
                let _ = ws_write.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }

            frame = ws_read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        deadline = idle_deadline(idle_for);
                        if let Some(end) = handle_frame(shared, session, text.as_str()) {
                            let _ = ws_write.send(Message::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(session, ?frame, "hub closed the connection");
                        return SessionEnd::Lost(Error::Protocol(
                            "connection closed by hub".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {
                        // Ping, pong and binary frames only prove liveness.
                        deadline = idle_deadline(idle_for);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session, "WebSocket error: {e}");
                        return SessionEnd::Lost(e.into());
                    }
                    None => {
                        tracing::info!(session, "WebSocket stream ended");
                        return SessionEnd::Lost(Error::Protocol(
                            "WebSocket stream ended".to_string(),
                        ));
                    }
                }
            }

            Some(text) = out_rx.recv() => {
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    tracing::warn!(session, "failed to send frame: {e}");
                    return SessionEnd::Lost(e.into());
                }
            }

            _ = tokio::time::sleep_until(deadline), if idle_timeout.is_some() => {
                tracing::warn!(session, "no frames within idle timeout");
                return SessionEnd::Lost(Error::Timeout("idle connection"));
            }
        }
    }
}

/// Apply one steady-state frame. Returns `Some` when the session must end.
fn handle_frame(shared: &Shared, session: u64, text: &str) -> Option<SessionEnd> {
    let msg = match decode_msg(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(session, "dropping malformed frame: {e}");
            return None;
        }
    };
    match classify(msg) {
        Frame::ChannelList(channels) => shared.replace_channel_list(session, channels),
        Frame::AuthAck { accepted: true, .. } => {
            tracing::debug!(session, "ignoring repeated auth_ack");
        }
        Frame::AuthAck {
            accepted: false,
            message,
        } => {
            return Some(SessionEnd::AuthRejected(
                message.unwrap_or_else(|| "credentials revoked".to_string()),
            ));
        }
        Frame::Channel { channel, message } => {
            shared.fan_out(session, &channel, &message);
        }
        Frame::Unrecognized(kind) => {
            tracing::debug!(session, %kind, "dropping unrecognized frame");
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
