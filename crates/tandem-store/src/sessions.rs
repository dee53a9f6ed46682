use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use tandem_core::definition::SessionDefinition;
use tandem_core::ids::{SessionId, UserId};
use tandem_core::session::{ControlMode, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub definition: SessionDefinition,
    pub host_id: UserId,
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    pub state: Map<String, Value>,
    /// Bumped on every state write; used for optimistic concurrency.
    pub version: i64,
    pub phase_started_at: Option<String>,
    pub paused_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Option<String>,
    pub control_mode: ControlMode,
    pub connected: bool,
    pub joined_at: String,
}

const SESSION_COLUMNS: &str = "id, definition, host_id, status, current_phase, state, version,
    phase_started_at, paused_at, created_at, started_at, finished_at";

const PARTICIPANT_COLUMNS: &str = "session_id, user_id, role, control_mode, connected, joined_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a waiting session. A host may hold only one non-finished session
    /// per definition name.
    #[instrument(skip(self, definition), fields(definition = %definition.name, host_id = %host_id))]
    pub fn create(
        &self,
        definition: &SessionDefinition,
        host_id: &UserId,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let ts = now();
        let definition_json = serde_json::to_string(definition)?;
        let state_json = serde_json::to_string(&definition.initial_state)?;

        self.db.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM sessions
                     WHERE host_id = ?1 AND definition_name = ?2 AND status != 'finished'
                     LIMIT 1",
                    params![host_id.as_str(), definition.name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::Conflict(format!(
                    "host already has an open {} session: {existing}",
                    definition.name
                )));
            }

            tx.execute(
                "INSERT INTO sessions (id, definition_name, definition, host_id, status, state,
                                       version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, 0, ?6, ?6)",
                params![
                    id.as_str(),
                    definition.name,
                    definition_json,
                    host_id.as_str(),
                    state_json,
                    ts,
                ],
            )?;
            load_session(tx, &id)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| load_session(conn, id))
    }

    /// Waiting → active. Assigns roles and the first phase in one transaction;
    /// fails with `Conflict` if the session already left `waiting` or the
    /// assignments do not cover exactly the current participants.
    #[instrument(skip(self, state, assignments), fields(session_id = %id))]
    pub fn start(
        &self,
        id: &SessionId,
        phase: &str,
        state: &Map<String, Value>,
        assignments: &[(UserId, String)],
    ) -> Result<SessionRow, StoreError> {
        let ts = now();
        let state_json = serde_json::to_string(state)?;

        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE sessions
                 SET status = 'active', current_phase = ?1, state = ?2, version = version + 1,
                     phase_started_at = ?3, started_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'waiting'",
                params![phase, state_json, ts, id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!("session {id} is not waiting")));
            }
            let seated = participant_count(tx, id)?;
            if seated != assignments.len() {
                return Err(StoreError::Conflict(format!(
                    "session {id} has {seated} participants, {} roles assigned",
                    assignments.len()
                )));
            }

            for (user_id, role) in assignments {
                let assigned = tx.execute(
                    "UPDATE participants SET role = ?1
                     WHERE session_id = ?2 AND user_id = ?3 AND role IS NULL",
                    params![role, id.as_str(), user_id.as_str()],
                )?;
                if assigned == 0 {
                    return Err(StoreError::Conflict(format!(
                        "participant {user_id} missing or already assigned"
                    )));
                }
            }

            load_session(tx, id)
        })
    }

    /// Persist a new phase/state if nobody else wrote since `expected_version`.
    /// Returns the new version.
    #[instrument(skip(self, state), fields(session_id = %id))]
    pub fn save_progress(
        &self,
        id: &SessionId,
        expected_version: i64,
        phase: &str,
        state: &Map<String, Value>,
        phase_changed: bool,
    ) -> Result<i64, StoreError> {
        let ts = now();
        let state_json = serde_json::to_string(state)?;

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions
                 SET current_phase = ?1, state = ?2, version = version + 1, updated_at = ?3,
                     phase_started_at = CASE WHEN ?4 THEN ?3 ELSE phase_started_at END
                 WHERE id = ?5 AND version = ?6 AND status = 'active'",
                params![phase, state_json, ts, phase_changed, id.as_str(), expected_version],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "session {id} changed since version {expected_version}"
                )));
            }
            Ok(expected_version + 1)
        })
    }

    /// Active → paused.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn pause(&self, id: &SessionId) -> Result<(), StoreError> {
        let ts = now();
        self.cas_update(
            id,
            "UPDATE sessions SET status = 'paused', paused_at = ?1, version = version + 1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![ts, id.as_str()],
            "active",
        )
    }

    /// Paused → active, restoring the phase clock to `phase_started_at`.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn resume(&self, id: &SessionId, phase_started_at: &str) -> Result<(), StoreError> {
        let ts = now();
        self.cas_update(
            id,
            "UPDATE sessions
             SET status = 'active', paused_at = NULL, phase_started_at = ?1,
                 version = version + 1, updated_at = ?2
             WHERE id = ?3 AND status = 'paused'",
            params![phase_started_at, ts, id.as_str()],
            "paused",
        )
    }

    /// Any non-finished status → finished. With `expected_version`, only if the
    /// state was not written concurrently.
    #[instrument(skip(self, state), fields(session_id = %id))]
    pub fn finish(
        &self,
        id: &SessionId,
        state: &Map<String, Value>,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let ts = now();
        let state_json = serde_json::to_string(state)?;
        self.cas_update(
            id,
            "UPDATE sessions
             SET status = 'finished', state = ?1, finished_at = ?2, updated_at = ?2,
                 version = version + 1
             WHERE id = ?3 AND status != 'finished' AND (?4 IS NULL OR version = ?4)",
            params![state_json, ts, id.as_str(), expected_version],
            "open",
        )
    }

    fn cas_update(
        &self,
        id: &SessionId,
        sql: &str,
        params: impl rusqlite::Params,
        expected: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(sql, params)?;
            if updated == 0 {
                // Distinguish a missing session from a lost race.
                load_session(conn, id)?;
                return Err(StoreError::Conflict(format!("session {id} is not {expected}")));
            }
            Ok(())
        })
    }

    // ── Participants ────────────────────────────────────────────────────────

    /// Seat `user_id` in a waiting session holding fewer than `capacity`
    /// participants. The status and capacity checks run in the same
    /// transaction as the insert.
    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    pub fn add_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        capacity: usize,
    ) -> Result<ParticipantRow, StoreError> {
        let ts = now();
        self.db.with_tx(|tx| {
            let session = load_session(tx, session_id)?;
            if session.status != SessionStatus::Waiting {
                return Err(StoreError::Conflict(format!("session {session_id} is not waiting")));
            }
            if load_participant(tx, session_id, user_id)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "{user_id} already joined {session_id}"
                )));
            }
            if participant_count(tx, session_id)? >= capacity {
                return Err(StoreError::Conflict(format!("session {session_id} is full")));
            }
            tx.execute(
                "INSERT INTO participants (session_id, user_id, control_mode, connected, joined_at)
                 VALUES (?1, ?2, 'human', 0, ?3)",
                params![session_id.as_str(), user_id.as_str(), ts],
            )?;
            load_participant(tx, session_id, user_id)?
                .ok_or_else(|| StoreError::NotFound(format!("participant {user_id}")))
        })
    }

    pub fn remove_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM participants WHERE session_id = ?1 AND user_id = ?2",
                params![session_id.as_str(), user_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRow>, StoreError> {
        self.db.with_conn(|conn| load_participant(conn, session_id, user_id))
    }

    /// Participants in seat (join) order.
    pub fn participants(&self, session_id: &SessionId) -> Result<Vec<ParticipantRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PARTICIPANT_COLUMNS} FROM participants
                 WHERE session_id = ?1 ORDER BY joined_at, rowid"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_participant(row)?);
            }
            Ok(out)
        })
    }

    pub fn set_connected(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        connected: bool,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE participants SET connected = ?1 WHERE session_id = ?2 AND user_id = ?3",
                params![connected, session_id.as_str(), user_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_control_mode(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        mode: ControlMode,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE participants SET control_mode = ?1 WHERE session_id = ?2 AND user_id = ?3",
                params![mode.as_str(), session_id.as_str(), user_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }
}

fn load_session(conn: &Connection, id: &SessionId) -> Result<SessionRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

fn load_participant(
    conn: &Connection,
    session_id: &SessionId,
    user_id: &UserId,
) -> Result<Option<ParticipantRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE session_id = ?1 AND user_id = ?2"
    ))?;
    let mut rows = stmt.query([session_id.as_str(), user_id.as_str()])?;
    rows.next()?.map(row_to_participant).transpose()
}

fn participant_count(conn: &Connection, session_id: &SessionId) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE session_id = ?1",
        [session_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or_default())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "sessions";
    let definition: String = row_helpers::get(row, 1, T, "definition")?;
    let status: String = row_helpers::get(row, 3, T, "status")?;
    let state: String = row_helpers::get(row, 5, T, "state")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        definition: row_helpers::parse_json(&definition, T, "definition")?,
        host_id: UserId::from_raw(row_helpers::get::<String>(row, 2, T, "host_id")?),
        status: row_helpers::parse_enum(&status, T, "status")?,
        current_phase: row_helpers::get(row, 4, T, "current_phase")?,
        state: row_helpers::parse_json(&state, T, "state")?,
        version: row_helpers::get(row, 6, T, "version")?,
        phase_started_at: row_helpers::get(row, 7, T, "phase_started_at")?,
        paused_at: row_helpers::get(row, 8, T, "paused_at")?,
        created_at: row_helpers::get(row, 9, T, "created_at")?,
        started_at: row_helpers::get(row, 10, T, "started_at")?,
        finished_at: row_helpers::get(row, 11, T, "finished_at")?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> Result<ParticipantRow, StoreError> {
    const T: &str = "participants";
    let mode: String = row_helpers::get(row, 3, T, "control_mode")?;
    Ok(ParticipantRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "session_id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, T, "user_id")?),
        role: row_helpers::get(row, 2, T, "role")?,
        control_mode: row_helpers::parse_enum(&mode, T, "control_mode")?,
        connected: row_helpers::get(row, 4, T, "connected")?,
        joined_at: row_helpers::get(row, 5, T, "joined_at")?,
    })
}
