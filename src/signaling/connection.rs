#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::handler::{MessageHandler, OFFER_TIMEOUT};
use super::protocol::{ClientMessage, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::session::{DeliveryError, Profile, Session, SessionManager, SessionTransport};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this duration.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often an unanswered offer is checked for expiry.
const OFFER_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Token bucket: burst capacity.
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// 1 token in microseconds (integer math).
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Outbound half of a WebSocket client.
///
/// Payloads go through a bounded channel drained by the send task. `close`
/// flips a watch channel; the send task then flushes what is queued, sends
/// `system/disconnect` and closes the socket.
pub struct WsTransport {
    sender: mpsc::Sender<Arc<String>>,
    close_tx: watch::Sender<Option<String>>,
    remote: Option<String>,
}

impl WsTransport {
    pub fn new(remote: Option<String>) -> (Arc<Self>, mpsc::Receiver<Arc<String>>, watch::Receiver<Option<String>>) {
        let (sender, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let transport = Arc::new(Self {
            sender,
            close_tx,
            remote,
        });
        (transport, rx, close_rx)
    }

    pub fn subscribe_close(&self) -> watch::Receiver<Option<String>> {
        self.close_tx.subscribe()
    }
}

impl SessionTransport for WsTransport {
    fn send(&self, payload: Arc<String>) -> Result<(), DeliveryError> {
        if self.close_tx.borrow().is_some() {
            return Err(DeliveryError::Closed);
        }
        self.sender.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self, reason: &str) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some() || self.sender.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote.clone()
    }
}

/// `<identity>-<8 hex chars>`, unique across reconnects of one identity
pub fn new_session_id(identity: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{identity}-{}", &suffix[..8])
}

fn notify(session: &Session, message: ServerMessage) {
    if let Err(e) = session.send(&message) {
        debug!("Notice to {} dropped: {}", session.id(), e);
    }
}

/// Destroy the connection's session and release any media peer it still holds.
/// A peer stored after an earlier destroy (a kick racing `signal/request`) is
/// released here even though the session is already gone.
async fn release_session(sessions: &SessionManager, session: &Session) {
    if let Err(e) = sessions.destroy_with_reason(session.id(), "connection closed").await {
        debug!("Session {} already destroyed: {}", session.id(), e);
    }
    if let Some(peer) = session.take_peer() {
        peer.close().await;
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    identity: String,
    profile: Profile,
    remote: Option<String>,
    handler: MessageHandler,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let sessions = handler.sessions().clone();
    let (transport, mut rx, mut close_rx) = WsTransport::new(remote);
    let session = match sessions.create(new_session_id(&identity), profile, transport.clone()) {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejecting connection for {}: {}", identity, e);
            return;
        }
    };
    let session_id = session.id().to_string();
    info!("New WebSocket connection: {} ({:?})", session_id, transport.remote_addr());

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_metrics = metrics.clone();
    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                json = rx.recv() => {
                    let Some(json) = json else { break };
                    send_metrics.inc_messages_sent();
                    if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                        break;
                    }
                }
                changed = close_rx.changed() => {
                    let reason = match changed {
                        Ok(()) => close_rx.borrow().clone(),
                        Err(_) => None,
                    };
                    if let Some(reason) = reason {
                        // flush whatever was queued before the close
                        while let Ok(json) = rx.try_recv() {
                            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                                break;
                            }
                        }
                        if let Ok(json) = serde_json::to_string(&ServerMessage::SystemDisconnect { message: reason }) {
                            let _ = ws_sender.send(Message::Text(json.into())).await;
                        }
                        let _ = ws_sender.send(Message::Close(None)).await;
                    }
                    break;
                }
            }
        }
        debug!("Send task finished for session: {}", send_session_id);
    });

    sessions.mark_connected(&session);
    if let Err(e) = handler.send_init(&session) {
        warn!("Failed to send init to {}: {}", session_id, e);
    }

    let mut closed = transport.subscribe_close();
    let mut expiry = tokio::time::interval(OFFER_CHECK_INTERVAL);
    expiry.tick().await;
    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => break,
            },
            _ = &mut idle => {
                warn!("Idle timeout for session {}", session_id);
                break;
            }
            _ = expiry.tick() => {
                handler.expire_offer(&session, OFFER_TIMEOUT).await;
                continue;
            }
            _ = closed.changed() => {
                debug!("Session {} closed by server", session_id);
                break;
            }
        };
        idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for session {}", session_id);
                        notify(&session, ServerMessage::SystemError {
                            message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        });
                    }
                    continue;
                }

                match ClientMessage::parse(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handler.handle(&session, client_msg).await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message from {}: {}", session_id, e);
                            metrics.inc_errors();
                            if transport.is_closed() {
                                break;
                            }
                            notify(&session, ServerMessage::SystemError {
                                message: format!("Error: {e}"),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message from {}: {}", session_id, e);
                        metrics.inc_errors();
                        notify(&session, ServerMessage::SystemError {
                            message: format!("Invalid message: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", session_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type from session {}", session_id);
            }
        }
    }

    release_session(&sessions, &session).await;
    transport.close("connection closed");

    if tokio::time::timeout(Duration::from_secs(5), send_task).await.is_err() {
        debug!("Send task for {} did not finish in time", session_id);
    }

    info!("Connection handler finished for session: {}", session_id);
}
