//! Wire messages for the three socket channels.
//!
//! Every message is a JSON object tagged by `type` with camelCase fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{AgentId, ConversationId, MessageId, SessionId, TaskId, UserId};
use crate::session::{ControlMode, PrizeAward, SessionStatus};

// ── User channel ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UserClientMessage {
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    CancelStream {
        message_id: MessageId,
    },
    /// Catch up after a reconnect. Maps each conversation the client holds to
    /// the last `seq` it has seen.
    Sync {
        #[serde(default)]
        conversations: BTreeMap<ConversationId, i64>,
    },
    Ping,
}

/// A stored conversation message as sent during catch-up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub max_seq: i64,
    pub last_message: Option<MessageSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UserServerMessage {
    StreamStart {
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
        sender_agent_id: AgentId,
        sender_agent_name: String,
    },
    StreamChunk {
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
        chunk: String,
    },
    StreamEnd {
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    StreamError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<i64>,
        error: String,
        /// Error taxonomy class, e.g. `rate_limited` or `unavailable`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    /// The agent is still answering an earlier message in this
    /// conversation; this one is held until that reply settles.
    StreamQueued {
        conversation_id: ConversationId,
        agent_id: AgentId,
        agent_name: String,
        position: usize,
    },
    SyncResponse {
        conversations: Vec<ConversationSummary>,
        missed_messages: Vec<MessageSnapshot>,
    },
    Pong,
    Error {
        error: String,
    },
}

// ── Agent channel ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentClientMessage {
    AgentAuth {
        bot_token: String,
        #[serde(default)]
        skills: Vec<AgentSkill>,
    },
    AgentChunk {
        task_id: TaskId,
        chunk: String,
    },
    AgentComplete {
        task_id: TaskId,
        content: String,
    },
    AgentError {
        task_id: TaskId,
        error: String,
    },
    AgentHeartbeat {
        task_id: TaskId,
    },
    Ping,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentServerMessage {
    AuthOk {
        agent_id: AgentId,
        agent_name: String,
    },
    AuthError {
        error: String,
    },
    Task {
        task_id: TaskId,
        conversation_id: ConversationId,
        content: String,
        sender_user_id: UserId,
    },
    CancelTask {
        task_id: TaskId,
    },
    Pong,
    /// Malformed or oversized frame from an authenticated agent.
    Error {
        error: String,
    },
}

// ── Session channel ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionClientMessage {
    PgAuth {
        token: String,
        session_id: SessionId,
    },
    PgAction {
        action: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    PgChat {
        content: String,
    },
    PgControlMode {
        mode: ControlMode,
    },
    Ping,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionServerMessage {
    PgAuthOk {
        session_id: SessionId,
        user_id: UserId,
        #[serde(default)]
        role: Option<String>,
        status: SessionStatus,
    },
    PgAuthError {
        error: String,
    },
    /// Shared state as seen by one participant's role.
    PgStateUpdate {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        role: Option<String>,
        state: Map<String, Value>,
    },
    PgActionResult {
        action: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PgPhaseTransition {
        session_id: SessionId,
        #[serde(default)]
        from: Option<String>,
        to: String,
    },
    PgParticipantJoined {
        session_id: SessionId,
        user_id: UserId,
    },
    PgParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
    },
    PgSessionStarted {
        session_id: SessionId,
        phase: String,
    },
    PgSessionFinished {
        session_id: SessionId,
        #[serde(default)]
        winning_role: Option<String>,
        winners: Vec<UserId>,
        prizes: Vec<PrizeAward>,
    },
    PgChat {
        session_id: SessionId,
        user_id: UserId,
        content: String,
        sent_at: String,
    },
    PgError {
        error: String,
    },
    Pong,
}

impl SessionServerMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::PgError { error: msg.into() }
    }
}
