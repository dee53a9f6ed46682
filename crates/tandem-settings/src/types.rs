//! Settings types. All structs use camelCase JSON and fill missing fields from
//! their `Default` impls.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TandemSettings {
    pub server: ServerSettings,
    pub runtime: RuntimeSettings,
    pub broker: BrokerSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per socket before new ones are dropped.
    pub max_send_queue: usize,
    pub max_message_bytes: usize,
    pub ping_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            max_message_bytes: 32 * 1024,
            ping_interval_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub auth_timeout_secs: u64,
    pub task_idle_timeout_secs: u64,
    pub rate_limit_per_minute: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 10,
            task_idle_timeout_secs: 600,
            rate_limit_per_minute: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process only; no cross-process fan-out.
    #[default]
    Local,
    Redis,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub redis_url: Option<String>,
    pub channel: String,
    pub resubscribe_delay_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Local,
            redis_url: None,
            channel: "tandem:relay".to_string(),
            resubscribe_delay_secs: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.tandem/database/tandem.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            log_to_sqlite: true,
            log_db_path: "~/.tandem/database/logs.db".to_string(),
        }
    }
}
