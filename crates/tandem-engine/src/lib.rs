//! Domain-agnostic session engine: definitions are data, this crate runs them.

pub mod effects;
pub mod error;
pub mod expr;
pub mod machine;
pub mod prizes;
pub mod roles;
pub mod view;

pub use error::EngineError;
pub use machine::{ActionOutcome, PhaseTimer, SessionEngine, SessionEvent};
pub use view::SessionView;
