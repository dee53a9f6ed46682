use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use tandem_core::ids::{AgentId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now};

const BOT_TOKEN_PREFIX: &str = "ari_";
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const PAIRING_CODE_LEN: usize = 6;
const PAIRING_ATTEMPTS: usize = 8;

/// A registered agent. The bot token itself is never stored, only its hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: AgentId,
    pub name: String,
    pub owner_id: UserId,
    pub pairing_code: String,
    pub created_at: String,
}

/// `ari_` followed by 48 lowercase hex characters.
pub fn generate_bot_token() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    format!("{BOT_TOKEN_PREFIX}{}", to_hex(&bytes))
}

/// Six characters from an alphabet without 0/O or 1/I.
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_ALPHABET[rng.gen_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

/// Hex SHA-256 of a secret token.
pub fn hash_token(token: &str) -> String {
    to_hex(&Sha256::digest(token.as_bytes()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct AgentRepo {
    db: Database,
}

impl AgentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register an agent. Returns the row and the plaintext bot token, which
    /// is shown once and cannot be recovered later.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn create(&self, name: &str, owner_id: &UserId) -> Result<(AgentRow, String), StoreError> {
        let id = AgentId::new();
        let token = generate_bot_token();
        let token_hash = hash_token(&token);
        let ts = now();

        let row = self.db.with_tx(|tx| {
            let pairing_code = unused_pairing_code(tx)?;
            tx.execute(
                "INSERT INTO agents (id, name, owner_id, token_hash, pairing_code, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id.as_str(), name, owner_id.as_str(), token_hash, pairing_code, ts],
            )?;
            load_agent(tx, "id", id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
        })?;
        Ok((row, token))
    }

    pub fn get(&self, id: &AgentId) -> Result<AgentRow, StoreError> {
        self.db
            .with_conn(|conn| load_agent(conn, "id", id.as_str()))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }

    /// Look up the agent owning a plaintext bot token.
    pub fn find_by_token(&self, token: &str) -> Result<Option<AgentRow>, StoreError> {
        if !token.starts_with(BOT_TOKEN_PREFIX) {
            return Ok(None);
        }
        let token_hash = hash_token(token);
        self.db.with_conn(|conn| load_agent(conn, "token_hash", &token_hash))
    }

    pub fn find_by_pairing_code(&self, code: &str) -> Result<Option<AgentRow>, StoreError> {
        self.db
            .with_conn(|conn| load_agent(conn, "pairing_code", &code.to_ascii_uppercase()))
    }
}

fn unused_pairing_code(conn: &Connection) -> Result<String, StoreError> {
    for _ in 0..PAIRING_ATTEMPTS {
        let code = generate_pairing_code();
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM agents WHERE pairing_code = ?1", [&code], |row| row.get(0))
            .optional()?;
        if taken.is_none() {
            return Ok(code);
        }
    }
    Err(StoreError::Conflict("could not allocate a unique pairing code".into()))
}

fn load_agent(conn: &Connection, column: &str, value: &str) -> Result<Option<AgentRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name, owner_id, pairing_code, created_at FROM agents WHERE {column} = ?1"
    ))?;
    let mut rows = stmt.query([value])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    const T: &str = "agents";
    Ok(Some(AgentRow {
        id: AgentId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        owner_id: UserId::from_raw(row_helpers::get::<String>(row, 2, T, "owner_id")?),
        pairing_code: row_helpers::get(row, 3, T, "pairing_code")?,
        created_at: row_helpers::get(row, 4, T, "created_at")?,
    }))
}
