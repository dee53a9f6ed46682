use rand::Rng;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use tandem_core::ids::UserId;

use crate::agents::hash_token;
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::now;

/// Opaque user access tokens. Stands in for the external auth service: it
/// only maps a bearer token to a verified user id.
pub struct UserTokenRepo {
    db: Database,
}

impl UserTokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a new token for `user_id`. Only its hash is stored.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn issue(&self, user_id: &UserId) -> Result<String, StoreError> {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        let ts = now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_tokens (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![hash_token(&token), user_id.as_str(), ts],
            )?;
            Ok(())
        })?;
        Ok(token)
    }

    pub fn resolve(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.db.with_conn(|conn| {
            let user: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM user_tokens WHERE token_hash = ?1",
                    [hash_token(token)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(user.map(UserId::from_raw))
        })
    }

    pub fn revoke(&self, token: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM user_tokens WHERE token_hash = ?1",
                [hash_token(token)],
            )?;
            Ok(n > 0)
        })
    }
}
