//! # tandem-core
//!
//! Shared vocabulary for the tandem runtime:
//!
//! - **Branded IDs**: `SessionId`, `UserId`, `AgentId`, ... as string newtypes
//! - **Protocol**: tagged wire messages for the user, agent and session channels
//! - **Definitions**: the static configuration a session is instantiated from
//! - **Errors**: the `RuntimeError` taxonomy surfaced to clients

#![deny(unsafe_code)]

pub mod constants;
pub mod definition;
pub mod errors;
pub mod ids;
pub mod protocol;
pub mod session;

pub use errors::RuntimeError;
