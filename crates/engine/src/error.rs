use crate::types::SignalId;
use persistence::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Notify error: {0}")]
    Notify(String),

    #[error("Invalid pattern rule: {0}")]
    InvalidRule(String),

    #[error("Signal {0} is not open in the store")]
    Integrity(SignalId),
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        EngineError::Store(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
