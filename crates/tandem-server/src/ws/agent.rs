//! `/ws/agent`: long-lived agent connections.
//!
//! The first frame that matters is `agent_auth`, due within the auth window.
//! After that the socket carries task progress for the dispatcher.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use tandem_core::constants::close_code;
use tandem_core::ids::AgentId;
use tandem_core::protocol::{AgentClientMessage, AgentServerMessage, AgentSkill};

use crate::dispatcher::TaskFailure;
use crate::registry::ConnectionHandle;
use crate::runtime::Runtime;
use crate::ws::{decode, Socket};

const RECONNECT_NOTE: &str = "Agent reconnected";
const INTERNAL_ERROR: u16 = 1011;

struct Authenticated {
    id: AgentId,
    name: String,
    skills: Vec<AgentSkill>,
}

pub struct AgentChannel {
    runtime: Arc<Runtime>,
    conn: ConnectionHandle,
    agent: Option<Authenticated>,
}

impl AgentChannel {
    pub fn new(runtime: Arc<Runtime>, conn: ConnectionHandle) -> Self {
        Self {
            runtime,
            conn,
            agent: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.agent.is_some()
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent.as_ref().map(|a| &a.id)
    }

    pub fn skills(&self) -> &[AgentSkill] {
        self.agent.as_ref().map_or(&[], |a| a.skills.as_slice())
    }

    pub fn handle_text(&mut self, text: &str) {
        let message = match decode::<AgentClientMessage>(text, self.runtime.config.max_message_bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "rejected agent frame");
                let error = e.to_string();
                let reply = if self.is_authenticated() {
                    AgentServerMessage::Error { error }
                } else {
                    AgentServerMessage::AuthError { error }
                };
                self.conn.send_json(&reply);
                return;
            }
        };

        if let AgentClientMessage::Ping = message {
            self.conn.send_json(&AgentServerMessage::Pong);
            return;
        }
        if let AgentClientMessage::AgentAuth { bot_token, skills } = message {
            if self.is_authenticated() {
                self.conn.send_json(&AgentServerMessage::Error {
                    error: "already authenticated".into(),
                });
            } else {
                self.authenticate(&bot_token, skills);
            }
            return;
        }

        let Some(agent) = &self.agent else {
            self.conn.send_json(&AgentServerMessage::AuthError {
                error: "Not authenticated".into(),
            });
            return;
        };
        let dispatcher = &self.runtime.dispatcher;
        match message {
            AgentClientMessage::AgentChunk { task_id, chunk } => dispatcher.on_chunk(&agent.id, &task_id, &chunk),
            AgentClientMessage::AgentComplete { task_id, content } => {
                dispatcher.on_complete(&agent.id, &task_id, &content)
            }
            AgentClientMessage::AgentError { task_id, error } => dispatcher.on_error(&agent.id, &task_id, &error),
            AgentClientMessage::AgentHeartbeat { task_id } => dispatcher.on_heartbeat(&agent.id, &task_id),
            AgentClientMessage::AgentAuth { .. } | AgentClientMessage::Ping => {}
        }
    }

    fn authenticate(&mut self, bot_token: &str, skills: Vec<AgentSkill>) {
        let agent = match self.runtime.agent_repo.find_by_token(bot_token) {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                warn!("agent auth with invalid bot token");
                self.conn.send_json(&AgentServerMessage::AuthError {
                    error: "Invalid bot token".into(),
                });
                self.conn.close(close_code::INVALID_CREDENTIAL, "invalid credential");
                return;
            }
            Err(e) => {
                error!(error = %e, "agent lookup failed");
                self.conn.send_json(&AgentServerMessage::AuthError {
                    error: "Authentication unavailable".into(),
                });
                self.conn.close(INTERNAL_ERROR, "internal error");
                return;
            }
        };

        if self
            .runtime
            .agents
            .register(agent.id.clone(), self.conn.clone())
            .is_some()
        {
            let failed = self
                .runtime
                .dispatcher
                .fail_agent_tasks(&agent.id, TaskFailure::Reconnected);
            info!(agent_id = %agent.id, failed, "agent connection superseded");
        }
        match self.runtime.messages.fail_streaming_for_agent(&agent.id, RECONNECT_NOTE) {
            Ok(0) => {}
            Ok(stale) => info!(agent_id = %agent.id, stale, "settled stale streaming messages"),
            Err(e) => warn!(agent_id = %agent.id, error = %e, "cannot settle stale streaming messages"),
        }

        self.conn.send_json(&AgentServerMessage::AuthOk {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
        });
        let skill_ids: Vec<&str> = skills.iter().map(|s| s.id.as_str()).collect();
        info!(agent_id = %agent.id, name = %agent.name, skills = ?skill_ids, "agent connected");

        self.agent = Some(Authenticated {
            id: agent.id,
            name: agent.name,
            skills,
        });
    }

    pub fn auth_timed_out(&self) {
        warn!(connection_id = %self.conn.id(), "agent auth timed out");
        self.conn.send_json(&AgentServerMessage::AuthError {
            error: "Authentication timeout".into(),
        });
        self.conn.close(close_code::AUTH_TIMEOUT, "auth timeout");
    }

    /// Fail the agent's tasks if this socket was still the registered one.
    pub fn close(self) {
        if let Some(agent) = self.agent {
            let failed = self.runtime.dispatcher.disconnect(&agent.id, self.conn.id());
            debug!(agent_id = %agent.id, name = %agent.name, failed, "agent socket closed");
        }
    }
}

#[instrument(skip_all)]
pub(crate) async fn serve(socket: axum::extract::ws::WebSocket, runtime: Arc<Runtime>) {
    let mut socket = Socket::accept(socket, &runtime.config);
    let mut channel = AgentChannel::new(runtime.clone(), socket.conn.clone());

    let deadline = tokio::time::sleep(runtime.config.auth_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline, if !channel.is_authenticated() => {
                channel.auth_timed_out();
                break;
            }
            text = socket.next_text() => match text {
                Some(text) => channel.handle_text(&text),
                None => break,
            },
        }
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
    use tandem_core::ids::{TaskId, UserId};
    use tandem_store::messages::{ConversationRepo, MessageRole, MessageStatus};
    use tandem_store::Database;

    struct Fixture {
        db: Database,
        rt: Arc<Runtime>,
        agent_id: AgentId,
        token: String,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let rt = Runtime::new(db.clone(), Arc::new(LocalBroker::new()), RuntimeConfig::default());
        let (agent, token) = rt.agent_repo.create("Scribe", &UserId::from_raw("owner")).unwrap();
        Fixture {
            db,
            rt,
            agent_id: agent.id,
            token,
        }
    }

    fn connect(fx: &Fixture) -> (AgentChannel, Outbox) {
        let (conn, out) = ConnectionHandle::channel(64);
        (AgentChannel::new(fx.rt.clone(), conn), out)
    }

    fn auth_frame(token: &str) -> String {
        json!({"type": "agent_auth", "botToken": token, "skills": [{"id": "haiku", "name": "Haiku"}]}).to_string()
    }

    async fn expect_close(out: &mut Outbox) -> u16 {
        loop {
            match out.recv().await {
                Some(Outbound::Close(frame)) => return frame.code,
                Some(Outbound::Text(_)) => continue,
                None => panic!("socket ended without a close frame"),
            }
        }
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let fx = setup();
        let (mut channel, mut out) = connect(&fx);

        channel.handle_text(&auth_frame(&fx.token));
        let ok = next_json(&mut out).await;
        assert_eq!(ok["type"], "auth_ok");
        assert_eq!(ok["agentName"], "Scribe");
        assert_eq!(ok["agentId"], fx.agent_id.as_str());
        assert_eq!(channel.agent_id(), Some(&fx.agent_id));
        assert_eq!(channel.skills()[0].id, "haiku");
        assert!(fx.rt.agents.is_online(&fx.agent_id));
    }

    #[tokio::test]
    async fn bad_token_closes_with_invalid_credential() {
        let fx = setup();
        let (mut channel, mut out) = connect(&fx);

        channel.handle_text(&auth_frame("ari_bogus"));
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "auth_error");
        assert_eq!(err["error"], "Invalid bot token");
        assert_eq!(expect_close(&mut out).await, close_code::INVALID_CREDENTIAL);
        assert!(!channel.is_authenticated());
    }

    #[tokio::test]
    async fn frames_before_auth_are_refused_but_socket_stays() {
        let fx = setup();
        let (mut channel, mut out) = connect(&fx);

        channel.handle_text(r#"{"type":"agent_chunk","taskId":"t1","chunk":"x"}"#);
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "auth_error");
        assert_eq!(err["error"], "Not authenticated");

        channel.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(next_json(&mut out).await["type"], "pong");
        assert!(!channel.conn.is_closed());

        channel.auth_timed_out();
        let err = next_json(&mut out).await;
        assert_eq!(err["error"], "Authentication timeout");
        assert_eq!(expect_close(&mut out).await, close_code::AUTH_TIMEOUT);
    }

    #[tokio::test]
    async fn reauth_leaves_one_live_connection() {
        let fx = setup();
        let (mut first, mut first_out) = connect(&fx);
        first.handle_text(&auth_frame(&fx.token));
        let _ = next_json(&mut first_out).await;

        let (mut second, mut second_out) = connect(&fx);
        second.handle_text(&auth_frame(&fx.token));
        assert_eq!(next_json(&mut second_out).await["type"], "auth_ok");
        assert_eq!(expect_close(&mut first_out).await, close_code::SUPERSEDED);

        first.close();
        assert!(fx.rt.agents.is_online(&fx.agent_id));
        assert_eq!(fx.rt.agents.len(), 1);
        second.close();
        assert!(!fx.rt.agents.is_online(&fx.agent_id));
    }

    #[tokio::test]
    async fn reconnect_settles_stale_streaming_messages() {
        let fx = setup();
        let user = UserId::from_raw("u1");
        let conversation = ConversationRepo::new(fx.db.clone()).create(&user, &fx.agent_id).unwrap();
        let stale = fx
            .rt
            .messages
            .insert(&conversation.id, MessageRole::Agent, "", MessageStatus::Streaming, Some(&fx.agent_id))
            .unwrap();

        let (mut channel, mut out) = connect(&fx);
        channel.handle_text(&auth_frame(&fx.token));
        let _ = next_json(&mut out).await;

        let row = fx.rt.messages.get(&stale.id).unwrap();
        assert_eq!(row.status, MessageStatus::Error);
        assert_eq!(row.content, RECONNECT_NOTE);
    }

    #[tokio::test]
    async fn streamed_task_round_trip_through_the_socket() {
        let fx = setup();
        let user = UserId::from_raw("u1");
        let conversation = ConversationRepo::new(fx.db.clone()).create(&user, &fx.agent_id).unwrap();
        let (user_conn, mut user_out) = ConnectionHandle::channel(64);
        fx.rt.users.register(user.clone(), user_conn);

        let (mut channel, mut out) = connect(&fx);
        channel.handle_text(&auth_frame(&fx.token));
        let _ = next_json(&mut out).await;

        let message_id = fx
            .rt
            .relay
            .handle_send_message(&user, &conversation.id, "three lines please")
            .unwrap()
            .placeholder()
            .cloned()
            .expect("dispatched");
        let task = next_json(&mut out).await;
        assert_eq!(task["type"], "task");
        let task_id = TaskId::from_raw(task["taskId"].as_str().unwrap());

        for chunk in ["one ", "two ", "three"] {
            channel.handle_text(&json!({"type": "agent_chunk", "taskId": task_id, "chunk": chunk}).to_string());
        }
        channel.handle_text(
            &json!({"type": "agent_complete", "taskId": task_id, "content": "one two three!"}).to_string(),
        );

        let mut seen = Vec::new();
        loop {
            let event = next_json(&mut user_out).await;
            let kind = event["type"].as_str().unwrap().to_string();
            seen.push(event);
            if kind == "stream_end" {
                break;
            }
        }
        let chunks: Vec<&str> = seen
            .iter()
            .filter(|e| e["type"] == "stream_chunk")
            .map(|e| e["chunk"].as_str().unwrap())
            .collect();
        assert_eq!(chunks, ["one ", "two ", "three"]);
        assert_eq!(seen.last().unwrap()["content"], "one two three!");

        let row = fx.rt.messages.get(&message_id).unwrap();
        assert_eq!(row.status, MessageStatus::Completed);
        assert_eq!(row.content, "one two three!");
        assert!(drain_json(&mut out).is_empty());
    }

    #[tokio::test]
    async fn disconnect_errors_in_flight_tasks() {
        let fx = setup();
        let user = UserId::from_raw("u1");
        let conversation = ConversationRepo::new(fx.db.clone()).create(&user, &fx.agent_id).unwrap();
        let (user_conn, mut user_out) = ConnectionHandle::channel(64);
        fx.rt.users.register(user.clone(), user_conn);

        let (mut channel, mut out) = connect(&fx);
        channel.handle_text(&auth_frame(&fx.token));
        let _ = next_json(&mut out).await;
        fx.rt.relay.handle_send_message(&user, &conversation.id, "hello").unwrap();
        assert_eq!(next_json(&mut user_out).await["type"], "stream_start");

        channel.close();
        let err = next_json(&mut user_out).await;
        assert_eq!(err["type"], "stream_error");
        assert_eq!(err["error"], "Agent disconnected");
        assert_eq!(err["kind"], "unavailable");
        assert_eq!(fx.rt.dispatcher.pending_count(), 0);
    }
}
