//! Resolving user credentials.

use tracing::warn;

use tandem_core::ids::UserId;
use tandem_store::tokens::UserTokenRepo;
use tandem_store::Database;

pub trait Authenticator: Send + Sync {
    /// The user a bearer token belongs to, if any.
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Tokens issued into the `user_tokens` table.
pub struct StoreAuthenticator {
    tokens: UserTokenRepo,
}

impl StoreAuthenticator {
    pub fn new(db: Database) -> Self {
        Self {
            tokens: UserTokenRepo::new(db),
        }
    }
}

impl Authenticator for StoreAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        if token.is_empty() {
            return None;
        }
        match self.tokens.resolve(token) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "token lookup failed");
                None
            }
        }
    }
}
