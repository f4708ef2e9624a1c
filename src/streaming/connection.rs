//! WebSocket connection to the recognition endpoint
//!
//! # Connection Flow
//!
//! 1. `Connection::open()` - returns immediately; a background task performs
//!    the handshake and reports `Opened` or `Failed`
//! 2. `send_text()` / `send_binary()` - queue outbound frames (non-blocking)
//! 3. Inbound text frames, server close and transport errors arrive as
//!    [`ConnectionEvent`]s on the receiver returned by `open()`
//! 4. `close()` - idempotent shutdown; no events are reported afterwards
//!
//! A single task owns the socket, so outbound frames go out in the order they
//! were queued (auth frame, audio frames, end-of-stream marker). There is no
//! reconnection: a broken connection ends the session.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::ConnectionError;

/// Transport-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake completed; frames may be sent
    Opened,
    /// A text frame from the server
    Message(String),
    /// The server closed the connection (or the stream ended)
    Closed { code: Option<u16>, reason: String },
    /// Handshake or transport failure
    Failed(ConnectionError),
}

/// Handle to one WebSocket connection
pub struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Connection {
    /// Start connecting to `url`
    ///
    /// The handshake is bounded by `connect_timeout`; expiry is reported as
    /// `Failed(ConnectionError::Timeout)`.
    pub fn open(
        url: String,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_connection(
            url,
            connect_timeout,
            outbound_rx,
            events_tx,
            cancel.clone(),
        ));

        (
            Self {
                outbound: outbound_tx,
                cancel,
            },
            events_rx,
        )
    }

    /// Queue a text frame
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Message::Text(text.into()))
    }

    /// Queue a binary frame
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.send(Message::Binary(bytes))
    }

    fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(msg)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Connection: closing");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    url: String,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    log::info!("Connection: connecting to {}", url);

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::debug!("Connection: cancelled during handshake");
            return;
        }
        result = timeout(connect_timeout, connect_async(url.as_str())) => result,
    };

    let ws_stream = match connected {
        Ok(Ok((ws_stream, _response))) => ws_stream,
        Ok(Err(e)) => {
            log::warn!("Connection: handshake failed: {}", e);
            let _ = events.send(ConnectionEvent::Failed(ConnectionError::Failed(
                e.to_string(),
            )));
            return;
        }
        Err(_) => {
            log::warn!("Connection: handshake timed out after {:?}", connect_timeout);
            let _ = events.send(ConnectionEvent::Failed(ConnectionError::Timeout));
            return;
        }
    };

    log::info!("Connection: opened");
    let _ = events.send(ConnectionEvent::Opened);

    let (mut write, mut read) = ws_stream.split();
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = write.close().await {
                    log::debug!("Connection: error sending close frame: {}", e);
                }
                break;
            }

            out = outbound.recv() => {
                let Some(msg) = out else {
                    let _ = write.close().await;
                    break;
                };
                if let Err(e) = write.send(msg).await {
                    log::warn!("Connection: send failed: {}", e);
                    if !cancel.is_cancelled() {
                        let _ = events.send(ConnectionEvent::Failed(ConnectionError::Failed(
                            e.to_string(),
                        )));
                    }
                    break;
                }
                frames_sent += 1;
                if frames_sent % 50 == 0 {
                    log::debug!("Connection: sent {} frames", frames_sent);
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        log::debug!("Connection: received {}", text);
                        let _ = events.send(ConnectionEvent::Message(text));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        log::info!("Connection: closed by server (code {:?}, reason {:?})", code, reason);
                        let _ = events.send(ConnectionEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        log::debug!("Connection: ignoring {} byte binary frame", bytes.len());
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => {
                        log::warn!("Connection: transport error: {}", e);
                        if !cancel.is_cancelled() {
                            let _ = events.send(ConnectionEvent::Failed(ConnectionError::Failed(
                                e.to_string(),
                            )));
                        }
                        break;
                    }
                    None => {
                        log::info!("Connection: stream ended");
                        let _ = events.send(ConnectionEvent::Closed {
                            code: None,
                            reason: String::new(),
                        });
                        break;
                    }
                }
            }
        }
    }

    log::debug!("Connection: task exiting after {} frames", frames_sent);
}
