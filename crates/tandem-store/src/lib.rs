//! SQLite persistence for tandem: sessions, participants, session logs,
//! agents, conversations, messages and user access tokens.

pub mod agents;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod session_logs;
pub mod sessions;
pub mod tokens;

pub use database::Database;
pub use error::StoreError;
