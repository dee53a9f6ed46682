use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now};

/// Append-only audit record for a session (`action`, `phase_transition`,
/// `session_finished`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionLogRow {
    pub id: i64,
    pub session_id: SessionId,
    pub kind: String,
    pub payload: Value,
    pub created_at: String,
}

pub struct SessionLogRepo {
    db: Database,
}

impl SessionLogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        session_id: &SessionId,
        kind: &str,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(payload)?;
        let ts = now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_logs (session_id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id.as_str(), kind, payload, ts],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Oldest first.
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SessionLogRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, kind, payload, created_at FROM session_logs
                 WHERE session_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "session_logs";
                let payload: String = row_helpers::get(row, 3, T, "payload")?;
                out.push(SessionLogRow {
                    id: row_helpers::get(row, 0, T, "id")?,
                    session_id: SessionId::from_raw(row_helpers::get::<String>(
                        row,
                        1,
                        T,
                        "session_id",
                    )?),
                    kind: row_helpers::get(row, 2, T, "kind")?,
                    payload: row_helpers::parse_json(&payload, T, "payload")?,
                    created_at: row_helpers::get(row, 4, T, "created_at")?,
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use serde_json::json;
    use tandem_core::ids::UserId;

    fn setup() -> (SessionLogRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let definition = serde_json::from_value(json!({
            "name": "quiz",
            "minPlayers": 1,
            "maxPlayers": 2,
            "roles": [{"name": "player"}],
            "phases": [{"name": "ask"}]
        }))
        .unwrap();
        let session = SessionRepo::new(db.clone())
            .create(&definition, &UserId::from_raw("host"))
            .unwrap();
        (SessionLogRepo::new(db), session.id)
    }

    #[test]
    fn append_and_list_in_order() {
        let (repo, session_id) = setup();
        repo.append(&session_id, "action", &json!({"action": "answer"})).unwrap();
        repo.append(&session_id, "phase_transition", &json!({"from": "ask", "to": "reveal"}))
            .unwrap();

        let logs = repo.list(&session_id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].kind, "action");
        assert_eq!(logs[1].payload["to"], "reveal");
        assert!(logs[0].id < logs[1].id);
    }

    #[test]
    fn unknown_session_is_rejected_by_foreign_key() {
        let (repo, _) = setup();
        let err = repo.append(&SessionId::from_raw("sess_nope"), "action", &json!({}));
        assert!(matches!(err, Err(StoreError::Database(_))));
    }
}
