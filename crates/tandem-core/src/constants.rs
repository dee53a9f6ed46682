use std::time::Duration;

/// WebSocket close codes. Clients branch on these, so they must stay distinct.
pub mod close_code {
    pub const UNAUTHORIZED: u16 = 4001;
    pub const AUTH_TIMEOUT: u16 = 4002;
    pub const INVALID_CREDENTIAL: u16 = 4003;
    pub const SUPERSEDED: u16 = 4004;
}

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const TASK_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub const RATE_LIMIT_PER_MINUTE: u32 = 10;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Largest inbound text frame accepted on any channel.
pub const MAX_MESSAGE_BYTES: usize = 32 * 1024;

pub const DEFAULT_SEND_QUEUE: usize = 256;

/// Missed messages returned per conversation by a reconnect catch-up.
pub const SYNC_MESSAGE_LIMIT: usize = 100;
