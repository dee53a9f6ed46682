//! `/ws?token=…`: a user's conversation stream.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use tandem_core::constants::close_code;
use tandem_core::ids::UserId;
use tandem_core::protocol::{UserClientMessage, UserServerMessage};
use tandem_core::RuntimeError;

use crate::registry::ConnectionHandle;
use crate::runtime::Runtime;
use crate::ws::{decode, Socket};

/// An authenticated user socket.
pub struct UserChannel {
    runtime: Arc<Runtime>,
    user_id: UserId,
    conn: ConnectionHandle,
}

impl UserChannel {
    /// Register `conn` as the user's socket, superseding any older one.
    pub fn open(runtime: Arc<Runtime>, user_id: UserId, conn: ConnectionHandle) -> Self {
        runtime.users.register(user_id.clone(), conn.clone());
        info!(user_id = %user_id, connection_id = %conn.id(), "user connected");
        Self {
            runtime,
            user_id,
            conn,
        }
    }

    pub fn handle_text(&self, text: &str) {
        let message = match decode::<UserClientMessage>(text, self.runtime.config.max_message_bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(user_id = %self.user_id, error = %e, "rejected user frame");
                self.conn.send_json(&UserServerMessage::Error { error: e.to_string() });
                return;
            }
        };

        match message {
            UserClientMessage::SendMessage {
                conversation_id,
                content,
            } => {
                if let Err(e) = self
                    .runtime
                    .relay
                    .handle_send_message(&self.user_id, &conversation_id, &content)
                {
                    self.conn.send_json(&UserServerMessage::StreamError {
                        conversation_id: Some(conversation_id),
                        message_id: None,
                        seq: None,
                        error: e.to_string(),
                        kind: Some(e.kind().into()),
                    });
                }
            }
            UserClientMessage::CancelStream { message_id } => {
                if let Err(e) = self.runtime.relay.cancel_stream(&self.user_id, &message_id) {
                    self.conn.send_json(&UserServerMessage::StreamError {
                        conversation_id: None,
                        message_id: Some(message_id),
                        seq: None,
                        error: e.to_string(),
                        kind: Some(e.kind().into()),
                    });
                }
            }
            UserClientMessage::Sync { conversations } => {
                match self.runtime.relay.sync(&self.user_id, &conversations) {
                    Ok(response) => {
                        self.conn.send_json(&response);
                    }
                    Err(e) => {
                        self.conn.send_json(&UserServerMessage::Error { error: e.to_string() });
                    }
                }
            }
            UserClientMessage::Ping => {
                self.conn.send_json(&UserServerMessage::Pong);
            }
        }
    }

    /// Drop the registration if this socket still holds it.
    pub fn close(self) {
        if self.runtime.users.unregister(&self.user_id, self.conn.id()) {
            info!(user_id = %self.user_id, "user disconnected");
        }
    }
}

#[instrument(skip_all, fields(user_id))]
pub(crate) async fn serve(socket: axum::extract::ws::WebSocket, runtime: Arc<Runtime>, user: Option<UserId>) {
    let mut socket = Socket::accept(socket, &runtime.config);
    let Some(user_id) = user else {
        debug!("user socket without a valid token");
        socket
            .conn
            .close(close_code::UNAUTHORIZED, RuntimeError::Unauthorized("invalid token".into()).to_string());
        socket.finish().await;
        return;
    };
    tracing::Span::current().record("user_id", user_id.as_str());

    let channel = UserChannel::open(runtime, user_id, socket.conn.clone());
    while let Some(text) = socket.next_text().await {
        channel.handle_text(&text);
    }
    channel.close();
    socket.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::registry::{Outbound, Outbox};
    use crate::runtime::RuntimeConfig;
    use crate::test_support::{drain_json, next_json};
    use serde_json::json;
    use tandem_core::ids::ConversationId;
    use tandem_store::messages::{ConversationRepo, MessageRepo, MessageRole};
    use tandem_store::Database;

    fn runtime(db: &Database) -> Arc<Runtime> {
        Runtime::new(db.clone(), Arc::new(LocalBroker::new()), RuntimeConfig::default())
    }

    fn open(rt: &Arc<Runtime>, user: &str) -> (UserChannel, Outbox) {
        let (conn, out) = ConnectionHandle::channel(64);
        (UserChannel::open(rt.clone(), UserId::from_raw(user), conn), out)
    }

    #[tokio::test]
    async fn ping_and_malformed_frames() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let (channel, mut out) = open(&rt, "u1");

        channel.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(next_json(&mut out).await["type"], "pong");

        channel.handle_text("not json");
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "error");
        assert!(err["error"].as_str().unwrap().starts_with("invalid message"));

        let big = json!({"type": "send_message", "conversationId": "c", "content": "x".repeat(33 * 1024)});
        channel.handle_text(&big.to_string());
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "error");
        assert!(err["error"].as_str().unwrap().contains("too large"));
        assert!(!channel.conn.is_closed());
    }

    #[tokio::test]
    async fn unknown_conversation_is_a_typed_stream_error() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let (channel, mut out) = open(&rt, "u1");

        channel.handle_text(r#"{"type":"send_message","conversationId":"conv_missing","content":"hi"}"#);
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "stream_error");
        assert_eq!(err["conversationId"], "conv_missing");
        assert_eq!(err["kind"], "unavailable");
    }

    #[tokio::test]
    async fn eleventh_message_in_a_minute_is_rate_limited() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let user = UserId::from_raw("u1");
        let (agent, _) = rt.agent_repo.create("Scribe", &user).unwrap();
        let conversation: ConversationId = ConversationRepo::new(db.clone()).create(&user, &agent.id).unwrap().id;
        let (channel, mut out) = open(&rt, "u1");

        let frame = json!({"type": "send_message", "conversationId": conversation, "content": "hello"}).to_string();
        for _ in 0..11 {
            channel.handle_text(&frame);
        }
        let events = drain_json(&mut out);
        let limited: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "stream_error" && e["kind"] == "rate_limited")
            .collect();
        assert_eq!(limited.len(), 1);
        assert_eq!(
            MessageRepo::new(db).count_by_role(&conversation, MessageRole::User).unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn sync_after_reconnect_returns_what_was_missed() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let user = UserId::from_raw("u1");
        let (agent, _) = rt.agent_repo.create("Scribe", &user).unwrap();
        let conversation: ConversationId = ConversationRepo::new(db.clone()).create(&user, &agent.id).unwrap().id;

        let (first, mut first_out) = open(&rt, "u1");
        first.handle_text(&json!({"type": "send_message", "conversationId": conversation, "content": "hello"}).to_string());
        let seen = drain_json(&mut first_out);
        assert_eq!(seen.last().unwrap()["type"], "stream_error", "agent is offline");
        first.close();

        let (second, mut out) = open(&rt, "u1");
        second.handle_text(&format!(r#"{{"type":"sync","conversations":{{"{conversation}":1}}}}"#));
        let response = next_json(&mut out).await;
        assert_eq!(response["type"], "sync_response");
        assert_eq!(response["conversations"][0]["maxSeq"], 2);
        let missed = response["missedMessages"].as_array().unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0]["role"], "agent");
        assert_eq!(missed[0]["status"], "error");
        assert!(missed[0]["content"].as_str().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn cancelling_an_unknown_stream_reports_it() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let (channel, mut out) = open(&rt, "u1");

        channel.handle_text(r#"{"type":"cancel_stream","messageId":"msg_gone"}"#);
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "stream_error");
        assert_eq!(err["messageId"], "msg_gone");
    }

    #[tokio::test]
    async fn newer_socket_supersedes_and_old_close_keeps_it() {
        let db = Database::in_memory().unwrap();
        let rt = runtime(&db);
        let (first, mut first_out) = open(&rt, "u1");
        let (second, _second_out) = open(&rt, "u1");

        match first_out.recv().await {
            Some(Outbound::Close(frame)) => assert_eq!(frame.code, close_code::SUPERSEDED),
            other => panic!("expected close, got {other:?}"),
        }
        first.close();
        assert!(rt.users.is_online(&UserId::from_raw("u1")));
        second.close();
        assert!(!rt.users.is_online(&UserId::from_raw("u1")));
    }
}
