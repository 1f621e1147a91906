use thiserror::Error;
use uuid::Uuid;

use crate::types::Channel;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Missing personalization variable: {variable}")]
    MissingVariable { variable: String },

    #[error("{channel:?} adapter failure: {message}")]
    AdapterFailure {
        channel: Channel,
        message: String,
        retriable: bool,
    },

    #[error("Dispatch lease expired for enrollment {0}")]
    LeaseExpired(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for OutreachError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
