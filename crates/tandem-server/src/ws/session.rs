//! `/ws/session`: a participant's seat in a running session.
//!
//! `pg_auth` (user token plus session id) must arrive within the auth window
//! and name a session the user participates in.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use tandem_core::constants::close_code;
use tandem_core::ids::SessionId;
use tandem_core::protocol::{SessionClientMessage, SessionServerMessage};
use tandem_core::session::ControlMode;
use tandem_engine::view::session_view;
use tandem_engine::{ActionOutcome, EngineError};

use crate::fanout::state_update;
use crate::registry::{ConnectionHandle, SeatKey};
use crate::runtime::Runtime;
use crate::ws::{decode, Socket};

const INTERNAL_ERROR: u16 = 1011;

pub struct SessionChannel {
    runtime: Arc<Runtime>,
    conn: ConnectionHandle,
    seat: Option<SeatKey>,
}

impl SessionChannel {
    pub fn new(runtime: Arc<Runtime>, conn: ConnectionHandle) -> Self {
        Self {
            runtime,
            conn,
            seat: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.seat.is_some()
    }

    pub async fn handle_text(&mut self, text: &str) {
        let message = match decode::<SessionClientMessage>(text, self.runtime.config.max_message_bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "rejected session frame");
                self.conn.send_json(&SessionServerMessage::error(e.to_string()));
                return;
            }
        };

        match message {
            SessionClientMessage::Ping => {
                self.conn.send_json(&SessionServerMessage::Pong);
            }
            SessionClientMessage::PgAuth { token, session_id } => {
                if self.is_authenticated() {
                    self.conn.send_json(&SessionServerMessage::error("already authenticated"));
                } else {
                    self.authenticate(&token, session_id);
                }
            }
            other => {
                let Some(seat) = self.seat.clone() else {
                    self.conn.send_json(&SessionServerMessage::PgAuthError {
                        error: "Not authenticated".into(),
                    });
                    return;
                };
                match other {
                    SessionClientMessage::PgAction { action, params } => self.action(&seat, action, params).await,
                    SessionClientMessage::PgChat { content } => self.chat(&seat, content).await,
                    SessionClientMessage::PgControlMode { mode } => self.control_mode(&seat, mode),
                    SessionClientMessage::PgAuth { .. } | SessionClientMessage::Ping => {}
                }
            }
        }
    }

    fn authenticate(&mut self, token: &str, session_id: SessionId) {
        let Some(user_id) = self.runtime.auth.authenticate(token) else {
            self.refuse("Invalid token", close_code::INVALID_CREDENTIAL);
            return;
        };
        let engine = &self.runtime.engine;
        let participant = match engine.participant(&session_id, &user_id) {
            Ok(Some(participant)) => participant,
            Ok(None) => {
                self.refuse("Not a participant in this session", close_code::INVALID_CREDENTIAL);
                return;
            }
            Err(EngineError::NotFound(_)) => {
                self.refuse("Session not found", close_code::INVALID_CREDENTIAL);
                return;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "participant lookup failed");
                self.refuse("Authentication unavailable", INTERNAL_ERROR);
                return;
            }
        };
        let session = match engine.get(&session_id) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "session lookup failed");
                self.refuse("Authentication unavailable", INTERNAL_ERROR);
                return;
            }
        };

        let seat = SeatKey::new(session_id.clone(), user_id.clone());
        self.runtime.seats.register(seat.clone(), self.conn.clone());
        if let Err(e) = engine.set_connected(&session_id, &user_id, true) {
            warn!(session_id = %session_id, user_id = %user_id, error = %e, "cannot mark participant connected");
        }

        self.conn.send_json(&SessionServerMessage::PgAuthOk {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            role: participant.role.clone(),
            status: session.status,
        });
        self.conn
            .send_json(&state_update(session_view(&session, participant.role.as_deref())));
        info!(session_id = %session_id, user_id = %user_id, role = ?participant.role, "participant connected");
        self.seat = Some(seat);
    }

    fn refuse(&self, reason: &str, code: u16) {
        debug!(reason, code, "session auth refused");
        self.conn.send_json(&SessionServerMessage::PgAuthError { error: reason.into() });
        self.conn.close(code, reason);
    }

    async fn action(&self, seat: &SeatKey, action: String, params: Map<String, Value>) {
        let outcome = self
            .runtime
            .engine
            .process_action(&seat.session_id, &seat.user_id, &action, &params);
        match outcome {
            Ok(ActionOutcome::Accepted { events }) => {
                self.conn.send_json(&SessionServerMessage::PgActionResult {
                    action,
                    success: true,
                    reason: None,
                });
                self.runtime.fanout.publish(&seat.session_id, events).await;
            }
            Ok(ActionOutcome::Rejected { reason }) => {
                debug!(session_id = %seat.session_id, user_id = %seat.user_id, action = %action, reason = %reason, "action rejected");
                self.conn.send_json(&SessionServerMessage::PgActionResult {
                    action,
                    success: false,
                    reason: Some(reason),
                });
            }
            Err(e) => {
                warn!(session_id = %seat.session_id, action = %action, error = %e, "action failed");
                self.conn.send_json(&SessionServerMessage::PgActionResult {
                    action,
                    success: false,
                    reason: Some(e.to_string()),
                });
            }
        }
    }

    async fn chat(&self, seat: &SeatKey, content: String) {
        if content.trim().is_empty() {
            self.conn.send_json(&SessionServerMessage::error("chat message is empty"));
            return;
        }
        let sent_at = Utc::now().to_rfc3339();
        if let Err(e) = self.runtime.logs.append(
            &seat.session_id,
            "chat",
            &json!({ "userId": seat.user_id, "content": content, "sentAt": sent_at }),
        ) {
            warn!(session_id = %seat.session_id, error = %e, "cannot log chat message");
        }
        let message = SessionServerMessage::PgChat {
            session_id: seat.session_id.clone(),
            user_id: seat.user_id.clone(),
            content,
            sent_at,
        };
        self.runtime
            .fanout
            .broadcast_event(&seat.session_id, message, None)
            .await;
    }

    fn control_mode(&self, seat: &SeatKey, mode: ControlMode) {
        if let Err(e) = self
            .runtime
            .engine
            .set_control_mode(&seat.session_id, &seat.user_id, mode)
        {
            self.conn.send_json(&SessionServerMessage::error(e.to_string()));
        }
    }

    pub fn auth_timed_out(&self) {
        self.refuse("Authentication timeout", close_code::AUTH_TIMEOUT);
    }

    /// Give up the seat if this socket still holds it.
    pub fn close(self) {
        let Some(seat) = self.seat else {
            return;
        };
        if !self.runtime.seats.unregister(&seat, self.conn.id()) {
            return;
        }
        if let Err(e) = self
            .runtime
            .engine
            .set_connected(&seat.session_id, &seat.user_id, false)
        {
            warn!(seat = %seat, error = %e, "cannot mark participant disconnected");
        }
        info!(seat = %seat, "participant disconnected");
    }
}

#[instrument(skip_all)]
pub(crate) async fn serve(socket: axum::extract::ws::WebSocket, runtime: Arc<Runtime>) {
    let mut socket = Socket::accept(socket, &runtime.config);
    let mut channel = SessionChannel::new(runtime.clone(), socket.conn.clone());

    let deadline = tokio::time::sleep(runtime.config.auth_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline, if !channel.is_authenticated() => {
                channel.auth_timed_out();
                break;
            }
            text = socket.next_text() => match text {
                Some(text) => channel.handle_text(&text).await,
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
    use crate::test_support::{definition, drain_json, next_json};
    use tandem_core::ids::UserId;
    use tandem_core::session::SessionStatus;
    use tandem_store::tokens::UserTokenRepo;
    use tandem_store::Database;

    struct Fixture {
        db: Database,
        rt: Arc<Runtime>,
        session: SessionId,
        host: UserId,
    }

    /// A waiting session hosted by `host` with `alice` and `bob` joined.
    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let rt = Runtime::new(db.clone(), Arc::new(LocalBroker::new()), RuntimeConfig::default());
        let host = UserId::from_raw("host");
        let session = rt.engine.create(&definition(), &host).unwrap().id;
        for user in ["alice", "bob"] {
            rt.engine.join(&session, &UserId::from_raw(user)).unwrap();
        }
        Fixture { db, rt, session, host }
    }

    fn token(fx: &Fixture, user: &str) -> String {
        UserTokenRepo::new(fx.db.clone()).issue(&UserId::from_raw(user)).unwrap()
    }

    async fn seat(fx: &Fixture, user: &str) -> (SessionChannel, Outbox) {
        let (conn, mut out) = ConnectionHandle::channel(64);
        let mut channel = SessionChannel::new(fx.rt.clone(), conn);
        let auth = json!({"type": "pg_auth", "token": token(fx, user), "sessionId": fx.session});
        channel.handle_text(&auth.to_string()).await;
        let ok = next_json(&mut out).await;
        assert_eq!(ok["type"], "pg_auth_ok", "auth failed for {user}: {ok}");
        assert_eq!(next_json(&mut out).await["type"], "pg_state_update");
        (channel, out)
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

    async fn start(fx: &Fixture) {
        let events = fx.rt.engine.start(&fx.session, &fx.host).unwrap();
        fx.rt.fanout.publish(&fx.session, events).await;
    }

    #[tokio::test]
    async fn host_start_gives_each_participant_a_distinct_role() {
        let fx = setup();
        let (_alice, mut alice_out) = seat(&fx, "alice").await;
        let (_bob, mut bob_out) = seat(&fx, "bob").await;
        start(&fx).await;

        let mut roles = Vec::new();
        for out in [&mut alice_out, &mut bob_out] {
            let events = drain_json(out);
            let started = events.iter().find(|e| e["type"] == "pg_session_started").unwrap();
            assert_eq!(started["phase"], "play");
            let update = events.iter().find(|e| e["type"] == "pg_state_update").unwrap();
            assert_eq!(update["status"], "active");
            assert_eq!(update["phase"], "play");
            roles.push(update["role"].as_str().unwrap().to_string());
        }
        roles.sort();
        assert_eq!(roles, ["captain", "scout"]);
        assert_eq!(fx.rt.engine.get(&fx.session).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn disallowed_action_is_rejected_without_broadcast() {
        let fx = setup();
        let (mut alice, mut alice_out) = seat(&fx, "alice").await;
        let (_bob, mut bob_out) = seat(&fx, "bob").await;
        start(&fx).await;
        drain_json(&mut alice_out);
        drain_json(&mut bob_out);
        let before = fx.rt.engine.get(&fx.session).unwrap().state;

        alice.handle_text(r#"{"type":"pg_action","action":"pass","params":{}}"#).await;
        let result = next_json(&mut alice_out).await;
        assert_eq!(result["type"], "pg_action_result");
        assert_eq!(result["success"], false);
        assert!(result["reason"].is_string());

        assert!(drain_json(&mut bob_out).is_empty());
        assert!(drain_json(&mut alice_out).is_empty());
        assert_eq!(fx.rt.engine.get(&fx.session).unwrap().state, before);
    }

    #[tokio::test]
    async fn accepted_action_pushes_filtered_views() {
        let fx = setup();
        let (mut alice, mut alice_out) = seat(&fx, "alice").await;
        let (_bob, mut bob_out) = seat(&fx, "bob").await;
        start(&fx).await;
        drain_json(&mut alice_out);
        drain_json(&mut bob_out);

        alice
            .handle_text(r#"{"type":"pg_action","action":"score","params":{"points":2}}"#)
            .await;
        let result = next_json(&mut alice_out).await;
        assert_eq!(result["success"], true);

        for out in [&mut alice_out, &mut bob_out] {
            let update = next_json(out).await;
            assert_eq!(update["type"], "pg_state_update");
            assert_eq!(update["state"]["round"], 1);
            if update["role"] == "scout" {
                assert!(update["state"].get("scores").is_none());
            } else {
                assert!(update["state"]["scores"].is_object());
            }
        }
    }

    #[tokio::test]
    async fn bad_credentials_close_with_invalid_credential() {
        let fx = setup();
        for (token, reason) in [
            ("bogus".to_string(), "Invalid token"),
            (token(&fx, "mallory"), "Not a participant in this session"),
        ] {
            let (conn, mut out) = ConnectionHandle::channel(8);
            let mut channel = SessionChannel::new(fx.rt.clone(), conn);
            let auth = json!({"type": "pg_auth", "token": token, "sessionId": fx.session});
            channel.handle_text(&auth.to_string()).await;

            let err = next_json(&mut out).await;
            assert_eq!(err["type"], "pg_auth_error");
            assert_eq!(err["error"], reason);
            assert_eq!(expect_close(&mut out).await, close_code::INVALID_CREDENTIAL);
            assert!(!channel.is_authenticated());
        }
    }

    #[tokio::test]
    async fn actions_before_auth_are_refused_and_timeout_closes() {
        let fx = setup();
        let (conn, mut out) = ConnectionHandle::channel(8);
        let mut channel = SessionChannel::new(fx.rt.clone(), conn);

        channel.handle_text(r#"{"type":"pg_chat","content":"hi"}"#).await;
        let err = next_json(&mut out).await;
        assert_eq!(err["type"], "pg_auth_error");
        assert_eq!(err["error"], "Not authenticated");

        channel.handle_text("{broken").await;
        assert_eq!(next_json(&mut out).await["type"], "pg_error");

        channel.auth_timed_out();
        assert_eq!(next_json(&mut out).await["error"], "Authentication timeout");
        assert_eq!(expect_close(&mut out).await, close_code::AUTH_TIMEOUT);
    }

    #[tokio::test]
    async fn chat_reaches_everyone_and_is_logged() {
        let fx = setup();
        let (mut alice, mut alice_out) = seat(&fx, "alice").await;
        let (_bob, mut bob_out) = seat(&fx, "bob").await;

        alice.handle_text(r#"{"type":"pg_chat","content":"good luck"}"#).await;
        for out in [&mut alice_out, &mut bob_out] {
            let chat = next_json(out).await;
            assert_eq!(chat["type"], "pg_chat");
            assert_eq!(chat["userId"], "alice");
            assert_eq!(chat["content"], "good luck");
        }
        let logs = fx.rt.logs.list(&fx.session).unwrap();
        assert!(logs.iter().any(|l| l.kind == "chat" && l.payload["content"] == "good luck"));
    }

    #[tokio::test]
    async fn connection_flag_and_control_mode_follow_the_socket() {
        let fx = setup();
        let alice_id = UserId::from_raw("alice");
        let (mut alice, _out) = seat(&fx, "alice").await;
        let row = fx.rt.engine.participant(&fx.session, &alice_id).unwrap().unwrap();
        assert!(row.connected);

        alice
            .handle_text(r#"{"type":"pg_control_mode","mode":"copilot"}"#)
            .await;
        let row = fx.rt.engine.participant(&fx.session, &alice_id).unwrap().unwrap();
        assert_eq!(row.control_mode, ControlMode::Copilot);

        alice.close();
        let row = fx.rt.engine.participant(&fx.session, &alice_id).unwrap().unwrap();
        assert!(!row.connected);
        assert!(fx.rt.seats.is_empty());
    }
}
