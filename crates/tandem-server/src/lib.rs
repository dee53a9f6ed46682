//! Socket and HTTP surface of the tandem runtime.
//!
//! Three websocket channels share one [`runtime::Runtime`]: users talk to
//! agents through `/ws`, agents execute tasks over `/ws/agent`, and session
//! participants play through `/ws/session`.

pub mod auth;
pub mod broker;
pub mod dispatcher;
pub mod fanout;
pub mod health;
pub mod notify;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use broker::{LocalBroker, RedisBroker, RelayBroker};
pub use runtime::{Runtime, RuntimeConfig};
pub use server::{build_router, serve, start, AppState, ServerHandle};
pub use shutdown::{wait_for_signal, ShutdownCoordinator};
