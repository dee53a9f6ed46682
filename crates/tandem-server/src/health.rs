//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::runtime::Runtime;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub instance_id: String,
    pub uptime_secs: u64,
    pub connections: ConnectionCounts,
    pub pending_tasks: usize,
    pub active_streams: usize,
    /// `local` or `redis`.
    pub broker: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionCounts {
    pub users: usize,
    pub agents: usize,
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, runtime: &Runtime) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        instance_id: runtime.instance.to_string(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: ConnectionCounts {
            users: runtime.users.len(),
            agents: runtime.agents.len(),
            sessions: runtime.seats.len(),
        },
        pending_tasks: runtime.dispatcher.pending_count(),
        active_streams: runtime.relay.active_streams(),
        broker: runtime.fanout.broker_name().into(),
    }
}
