use std::time::Duration;

/// Error taxonomy shared by every socket channel.
/// Each variant maps to exactly one way the failure is surfaced to a client.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    // Reported to the originating connection, nothing mutated
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("message too large: {size} > {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("{0}")]
    Rejected(String),
    #[error("rate limit exceeded: {limit} messages per minute")]
    RateLimited { limit: u32 },

    // Connection-level
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not authenticated")]
    NotAuthenticated,

    // Treated like a remote error with a synthetic cause
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    // Counterpart not connected or not found
    #[error("{0} is not connected")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),

    // Logged, never fatal
    #[error("degraded: {0}")]
    Degraded(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) | Self::MessageTooLarge { .. } | Self::Rejected(_) => {
                "rejected_input"
            }
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized(_) | Self::NotAuthenticated => "unauthorized",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) | Self::NotFound(_) => "unavailable",
            Self::Degraded(_) => "degraded",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the socket that caused this error should be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Timeout(_))
    }
}
