use tandem_core::definition::DefinitionError;
use tandem_store::StoreError;

use crate::expr::ExprError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Lost a compare-and-set race; the caller may retry.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Store(other),
        }
    }
}

impl From<DefinitionError> for EngineError {
    fn from(e: DefinitionError) -> Self {
        Self::InvalidDefinition(e.to_string())
    }
}

impl EngineError {
    /// Expression errors in a definition are configuration mistakes.
    pub(crate) fn expression(owner: &str, e: ExprError) -> Self {
        Self::InvalidDefinition(format!("{owner}: {e}"))
    }
}
