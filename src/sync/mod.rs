// SPDX-License-Identifier: MIT
//! Task sync channel — the persistent connection to the push stream.
//!
//! Connects with a bearer credential, pumps frames through the decoder, and
//! routes decoded events to the two pipeline branches in arrival order. On
//! disconnect it reconnects with exponential backoff; when the retry budget
//! runs out it parks in a distinct `Offline` state and keeps probing at the
//! maximum interval rather than silently dropping events. A token flagged
//! expired mid-stream triggers reconnect-with-refreshed-credential; a
//! credential the server keeps rejecting ends the session.
//!
//! Within one connection's lifetime events are never reordered: one reader
//! loop, bounded in-order mpsc queues, no fan-in.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::ChannelConfig;
use crate::events::decoder::{FrameDecoder, FrameReport};
use crate::events::{Event, TaskMutationEvent};

/// Close code the server uses to flag an expired bearer token.
const CLOSE_CODE_TOKEN_EXPIRED: u16 = 4401;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Channel state ───────────────────────────────────────────────────────────

/// Connection lifecycle as observed from outside the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Not yet connected, or between backoff attempts.
    Connecting,
    Online,
    /// Retry budget exhausted. Still probing at the maximum interval, but
    /// observers must treat pushed state as stale and plan a full refresh.
    Offline,
    /// Credential rejected and unrefreshable. Terminal: the caller must
    /// re-authenticate and start a fresh session.
    SessionEnded,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::SessionEnded => write!(f, "session_ended"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("credential rejected by server")]
    Unauthorized,
    #[error("invalid bearer credential: {0}")]
    BadCredential(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
}

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Receiving ends handed to the pipeline when a channel is built.
pub struct ChannelHandles {
    /// Agent-run events, in arrival order.
    pub lifecycle_rx: mpsc::Receiver<Event>,
    /// Task mutations, in arrival order.
    pub mutation_rx: mpsc::Receiver<TaskMutationEvent>,
    /// Skipped-frame reports from the decoder.
    pub report_rx: mpsc::Receiver<FrameReport>,
    /// Connection state transitions.
    pub state_rx: watch::Receiver<ChannelState>,
}

// ─── Channel ─────────────────────────────────────────────────────────────────

pub struct TaskSyncChannel {
    url: String,
    config: ChannelConfig,
    token: Arc<dyn TokenProvider>,
    decoder: FrameDecoder,
    lifecycle_tx: mpsc::Sender<Event>,
    mutation_tx: mpsc::Sender<TaskMutationEvent>,
    state_tx: watch::Sender<ChannelState>,
    stop_rx: watch::Receiver<bool>,
}

enum PumpEnd {
    Stopped,
    TokenExpired,
    Disconnected,
}

impl TaskSyncChannel {
    /// Build a channel and the receiving ends of its queues.
    pub fn new(
        url: impl Into<String>,
        config: ChannelConfig,
        token: Arc<dyn TokenProvider>,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, ChannelHandles) {
        let capacity = config.queue_capacity;
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(capacity);
        let (mutation_tx, mutation_rx) = mpsc::channel(capacity);
        let (report_tx, report_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let channel = Self {
            url: url.into(),
            config,
            token,
            decoder: FrameDecoder::new(report_tx),
            lifecycle_tx,
            mutation_tx,
            state_tx,
            stop_rx,
        };
        (
            channel,
            ChannelHandles {
                lifecycle_rx,
                mutation_rx,
                report_rx,
                state_rx,
            },
        )
    }

    /// Connect-pump-reconnect until stopped or the session ends.
    ///
    /// Consumes the channel; run it as its own task. Dropping out of this
    /// function drops the queue senders, which is how downstream consumers
    /// learn the stream is over.
    pub async fn run(self) {
        let retry = self.config.retry();
        let mut attempt: u32 = 0;
        // One refresh is allowed per rejection; a second rejection without a
        // successful connect in between ends the session.
        let mut refreshed_since_connect = false;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let token = match self.token.bearer_token().await {
                Ok(t) => t,
                Err(err) => {
                    warn!(err = %err, "no credential available — session ended");
                    self.state_tx.send_replace(ChannelState::SessionEnded);
                    return;
                }
            };

            match self.connect(&token).await {
                Ok(ws) => {
                    info!(url = %self.url, "sync channel connected");
                    attempt = 0;
                    refreshed_since_connect = false;
                    self.state_tx.send_replace(ChannelState::Online);

                    match self.pump(ws).await {
                        PumpEnd::Stopped => break,
                        PumpEnd::TokenExpired => {
                            debug!("server flagged token expired mid-stream");
                            if !self.refresh_or_end().await {
                                return;
                            }
                            refreshed_since_connect = true;
                            // Fresh credential in hand: reconnect without backoff.
                            continue;
                        }
                        PumpEnd::Disconnected => {
                            warn!(url = %self.url, "sync channel disconnected");
                        }
                    }
                }
                Err(ChannelError::Unauthorized) => {
                    if refreshed_since_connect {
                        warn!("refreshed credential rejected — session ended");
                        self.state_tx.send_replace(ChannelState::SessionEnded);
                        return;
                    }
                    if !self.refresh_or_end().await {
                        return;
                    }
                    refreshed_since_connect = true;
                    continue;
                }
                Err(err) => {
                    warn!(url = %self.url, err = %err, "sync connect failed");
                }
            }

            attempt += 1;
            let delay = if attempt >= retry.max_attempts {
                self.state_tx.send_replace(ChannelState::Offline);
                retry.max_delay
            } else {
                self.state_tx.send_replace(ChannelState::Connecting);
                retry.delay_for_attempt(attempt)
            };
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");

            let mut stop = self.stop_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|s| *s) => break,
            }
        }

        debug!("sync channel stopped");
    }

    /// Refresh the credential. On failure, publishes `SessionEnded` and
    /// returns false.
    async fn refresh_or_end(&self) -> bool {
        match self.token.refresh().await {
            Ok(_) => {
                info!("credential refreshed — reconnecting");
                true
            }
            Err(err) => {
                warn!(err = %err, "credential refresh failed — session ended");
                self.state_tx.send_replace(ChannelState::SessionEnded);
                false
            }
        }
    }

    async fn connect(&self, token: &str) -> Result<WsStream, ChannelError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = format!("Bearer {token}").parse()?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((ws, _resp)) => Ok(ws),
            Err(tungstenite::Error::Http(resp))
                if resp.status() == StatusCode::UNAUTHORIZED
                    || resp.status() == StatusCode::FORBIDDEN =>
            {
                Err(ChannelError::Unauthorized)
            }
            Err(e) => Err(ChannelError::Ws(e)),
        }
    }

    /// Read frames until the connection dies, the server flags token
    /// expiry, or a stop is requested.
    async fn pump(&self, ws: WsStream) -> PumpEnd {
        let (mut sink, mut stream) = ws.split();
        let mut stop = self.stop_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = async { let _ = stop.wait_for(|s| *s).await; } => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpEnd::Stopped;
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(event) = self.decoder.decode(&text) else {
                            continue;
                        };
                        // The fork point: task mutations to the store branch,
                        // everything else to the lifecycle branch.
                        let delivered = match event.into_task_mutation() {
                            Ok(mutation) => self.mutation_tx.send(mutation).await.is_ok(),
                            Err(event) => self.lifecycle_tx.send(event).await.is_ok(),
                        };
                        if !delivered {
                            // Consumers are gone; nothing left to sync for.
                            return PumpEnd::Stopped;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let expired = frame
                            .as_ref()
                            .is_some_and(|f| u16::from(f.code) == CLOSE_CODE_TOKEN_EXPIRED);
                        return if expired {
                            PumpEnd::TokenExpired
                        } else {
                            PumpEnd::Disconnected
                        };
                    }
                    Some(Ok(_)) => {} // binary / pong frames carry nothing for us
                    Some(Err(e)) => {
                        warn!(err = %e, "sync stream error");
                        return PumpEnd::Disconnected;
                    }
                    None => return PumpEnd::Disconnected,
                }
            }
        }
    }
}
