use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tandem_core::ids::{AgentId, ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Completed,
    Streaming,
    Error,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "streaming" => Ok(Self::Streaming),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub sender_agent_id: Option<AgentId>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(user_id = %user_id, agent_id = %agent_id))]
    pub fn create(
        &self,
        user_id: &UserId,
        agent_id: &AgentId,
    ) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let ts = now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, agent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id.as_str(), user_id.as_str(), agent_id.as_str(), ts],
            )?;
            load_conversation(conn, &id)
        })
    }

    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| load_conversation(conn, id))
    }

    /// Every conversation `user_id` owns, oldest first.
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM conversations WHERE user_id = ?1 ORDER BY created_at, id",
            )?;
            let ids = stmt
                .query_map([user_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter()
                .map(|id| load_conversation(conn, &ConversationId::from_raw(id)))
                .collect()
        })
    }
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, seq, role, content, status, sender_agent_id, created_at, updated_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message with the next per-conversation sequence number.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id))]
    pub fn insert(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
        sender_agent_id: Option<&AgentId>,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let ts = now();
        self.db.with_tx(|tx| {
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, seq, role, content, status,
                                       sender_agent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.as_str(),
                    conversation_id.as_str(),
                    seq,
                    role.as_str(),
                    content,
                    status.as_str(),
                    sender_agent_id.map(AgentId::as_str),
                    ts,
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![ts, conversation_id.as_str()],
            )?;
            load_message(tx, &id)?.ok_or_else(|| StoreError::NotFound(format!("message {id}")))
        })
    }

    /// Replace the content of a streaming message and settle its status.
    /// Returns `false` if the message was already settled.
    #[instrument(skip(self, content), fields(message_id = %id, status = %status))]
    pub fn finalize(
        &self,
        id: &MessageId,
        content: &str,
        status: MessageStatus,
    ) -> Result<bool, StoreError> {
        let ts = now();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?1, status = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'streaming'",
                params![content, status.as_str(), ts, id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get(&self, id: &MessageId) -> Result<MessageRow, StoreError> {
        self.db
            .with_conn(|conn| load_message(conn, id))?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    /// Messages of a conversation in `seq` order.
    pub fn list(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY seq"
            ))?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }

    /// Up to `limit` messages with `seq` above `after`, in `seq` order.
    pub fn list_after(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3"
            ))?;
            let mut rows = stmt.query(params![conversation_id.as_str(), after, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }

    /// The message with the highest `seq`, if any.
    pub fn latest(&self, conversation_id: &ConversationId) -> Result<Option<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
                 ORDER BY seq DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            rows.next()?.map(row_to_message).transpose()
        })
    }

    pub fn count_by_role(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND role = ?2",
                params![conversation_id.as_str(), role.as_str()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    /// Mark every message still streaming from `agent_id` as failed. Empty
    /// placeholders get `note` as their content. Returns how many were updated.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn fail_streaming_for_agent(&self, agent_id: &AgentId, note: &str) -> Result<usize, StoreError> {
        let ts = now();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages
                 SET status = 'error', updated_at = ?1,
                     content = CASE WHEN content = '' THEN ?2 ELSE content END
                 WHERE sender_agent_id = ?3 AND status = 'streaming'",
                params![ts, note, agent_id.as_str()],
            )?;
            Ok(n)
        })
    }
}

fn load_conversation(conn: &Connection, id: &ConversationId) -> Result<ConversationRow, StoreError> {
    conn.query_row(
        "SELECT id, user_id, agent_id, created_at, updated_at FROM conversations WHERE id = ?1",
        [id.as_str()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        },
    )
    .optional()?
    .map(|(id, user_id, agent_id, created_at, updated_at)| ConversationRow {
        id: ConversationId::from_raw(id),
        user_id: UserId::from_raw(user_id),
        agent_id: AgentId::from_raw(agent_id),
        created_at,
        updated_at,
    })
    .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))
}

fn load_message(conn: &Connection, id: &MessageId) -> Result<Option<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    rows.next()?.map(row_to_message).transpose()
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    const T: &str = "messages";
    let role: String = row_helpers::get(row, 3, T, "role")?;
    let status: String = row_helpers::get(row, 5, T, "status")?;
    let sender: Option<String> = row_helpers::get(row, 6, T, "sender_agent_id")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            T,
            "conversation_id",
        )?),
        seq: row_helpers::get(row, 2, T, "seq")?,
        role: row_helpers::parse_enum(&role, T, "role")?,
        content: row_helpers::get(row, 4, T, "content")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        sender_agent_id: sender.map(AgentId::from_raw),
        created_at: row_helpers::get(row, 7, T, "created_at")?,
        updated_at: row_helpers::get(row, 8, T, "updated_at")?,
    })
}
