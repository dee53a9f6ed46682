//! WebSocket plumbing shared by the user, agent and session channels.
//!
//! Each socket gets a writer task draining its [`Outbox`] (plus periodic
//! pings) and a reader the channel handler pulls text frames from in order.

pub mod agent;
pub mod session;
pub mod user;

use std::time::Duration;

use axum::extract::ws::{CloseFrame as WsCloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use tandem_core::RuntimeError;

use crate::registry::{ConnectionHandle, Outbound, Outbox};
use crate::runtime::RuntimeConfig;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Size-check and parse one inbound text frame.
pub fn decode<T: DeserializeOwned>(text: &str, limit: usize) -> Result<T, RuntimeError> {
    if text.len() > limit {
        return Err(RuntimeError::MessageTooLarge {
            size: text.len(),
            limit,
        });
    }
    serde_json::from_str(text).map_err(|e| RuntimeError::InvalidMessage(e.to_string()))
}

/// One accepted socket, split into its halves.
pub(crate) struct Socket {
    pub conn: ConnectionHandle,
    reader: SplitStream<WebSocket>,
    writer: JoinHandle<()>,
}

impl Socket {
    pub fn accept(socket: WebSocket, config: &RuntimeConfig) -> Self {
        let (sink, reader) = socket.split();
        let (conn, outbox) = ConnectionHandle::channel(config.max_send_queue);
        let writer = tokio::spawn(write_loop(sink, outbox, config.ping_interval));
        Self { conn, reader, writer }
    }

    /// Next text frame; `None` once the peer closed, the socket failed or
    /// the server closed it. Binary frames are read as (lossy) UTF-8 text.
    pub async fn next_text(&mut self) -> Option<String> {
        let Self { conn, reader, .. } = self;
        loop {
            let message = tokio::select! {
                biased;
                () = conn.closed() => return None,
                message = reader.next() => message?,
            };
            match message {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id = %conn.id(), error = %e, "socket read failed");
                    return None;
                }
            }
        }
    }

    /// Stop reading and let the writer flush whatever is queued.
    pub async fn finish(self) {
        let Self { conn, reader, mut writer } = self;
        drop(reader);
        drop(conn);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbox: Outbox, ping_interval: Duration) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbox.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(frame)) => {
                    debug!(code = frame.code, reason = %frame.reason, "closing socket");
                    let close = WsCloseFrame {
                        code: frame.code,
                        reason: frame.reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(close))).await {
                        trace!(error = %e, "close frame not delivered");
                    }
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    warn!("ping failed, dropping socket writer");
                    break;
                }
            }
        }
    }
}
