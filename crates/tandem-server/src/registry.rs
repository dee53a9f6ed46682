//! Who is connected, keyed by user, agent or session seat.
//!
//! Each live socket is represented by a [`ConnectionHandle`]: a bounded queue
//! of outbound text frames plus a close signal. The socket's writer task owns
//! the matching [`Outbox`].

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tandem_core::constants::close_code;
use tandem_core::ids::{ConnectionId, SessionId, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(CloseFrame),
}

struct CloseSignal {
    token: CancellationToken,
    frame: Mutex<Option<CloseFrame>>,
}

impl CloseSignal {
    fn take(&self) -> Option<CloseFrame> {
        self.frame.lock().take()
    }
}

/// Sending half of one socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    close: Arc<CloseSignal>,
}

/// Receiving half of one socket, drained by its writer task.
pub struct Outbox {
    rx: mpsc::Receiver<String>,
    close: Arc<CloseSignal>,
}

impl ConnectionHandle {
    pub fn channel(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let close = Arc::new(CloseSignal {
            token: CancellationToken::new(),
            frame: Mutex::new(None),
        });
        (
            Self {
                id: ConnectionId::new(),
                tx,
                close: close.clone(),
            },
            Outbox { rx, close },
        )
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a text frame. Dropped (returns `false`) once the socket is
    /// closing or when its queue is full.
    pub fn send_text(&self, text: String) -> bool {
        if self.close.token.is_cancelled() {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                warn!(connection_id = %self.id, bytes = text.len(), "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_json<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "failed to serialize outbound frame");
                false
            }
        }
    }

    /// Ask the writer to flush what is queued and close with `code`. Only the
    /// first close counts; returns whether this call was it.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        let mut frame = self.close.frame.lock();
        if self.close.token.is_cancelled() {
            return false;
        }
        *frame = Some(CloseFrame {
            code,
            reason: reason.into(),
        });
        self.close.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close.token.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        self.close.token.cancelled().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Outbox {
    /// Next frame to write. Queued text always goes out before the close
    /// frame; `None` once the socket is done.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            text = self.rx.recv() => match text {
                Some(text) => Some(Outbound::Text(text)),
                None => self.close.take().map(Outbound::Close),
            },
            () = self.close.token.cancelled() => match self.rx.try_recv() {
                Ok(text) => Some(Outbound::Text(text)),
                Err(_) => self.close.take().map(Outbound::Close),
            },
        }
    }

    /// Non-blocking variant of [`Outbox::recv`].
    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self.rx.try_recv() {
            Ok(text) => Some(Outbound::Text(text)),
            Err(_) if self.close.token.is_cancelled() => self.close.take().map(Outbound::Close),
            Err(_) => None,
        }
    }
}

/// A participant's socket for one session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeatKey {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl SeatKey {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self { session_id, user_id }
    }
}

impl fmt::Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.user_id)
    }
}

/// At most one live socket per key.
pub struct ConnectionRegistry<K> {
    label: &'static str,
    entries: DashMap<K, ConnectionHandle>,
}

impl<K> ConnectionRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: DashMap::new(),
        }
    }

    /// Put `conn` on file for `key`. Whatever socket held the key before is
    /// closed as superseded and returned.
    pub fn register(&self, key: K, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let new_id = conn.id.clone();
        let replaced = self.entries.insert(key.clone(), conn);
        match replaced {
            Some(old) if old.id != new_id => {
                debug!(registry = self.label, key = %key, old = %old.id, new = %new_id, "connection superseded");
                old.close(close_code::SUPERSEDED, "superseded by a newer connection");
                Some(old)
            }
            _ => None,
        }
    }

    /// Remove `key` only while `conn_id` is still the socket on file.
    pub fn unregister(&self, key: &K, conn_id: &ConnectionId) -> bool {
        self.entries.remove_if(key, |_, conn| conn.id == *conn_id).is_some()
    }

    pub fn is_online(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|conn| !conn.is_closed())
    }

    pub fn get(&self, key: &K) -> Option<ConnectionHandle> {
        self.entries.get(key).map(|conn| conn.clone())
    }

    /// Best effort: `false` when the key is offline or the frame was dropped.
    pub fn send_to<T: Serialize>(&self, key: &K, message: &T) -> bool {
        match self.get(key) {
            Some(conn) => conn.send_json(message),
            None => false,
        }
    }

    /// Close and forget the socket for `key`.
    pub fn close(&self, key: &K, code: u16, reason: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, conn)) => conn.close(code, reason),
            None => false,
        }
    }

    /// Sockets whose key matches `pred`.
    pub fn select(&self, pred: impl Fn(&K) -> bool) -> Vec<(K, ConnectionHandle)> {
        self.entries
            .iter()
            .filter(|entry| pred(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
