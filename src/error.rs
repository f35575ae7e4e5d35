//! Error types for herald-rs.

use thiserror::Error;

use crate::model::Phase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("notification request not found: {0}")]
    NotFound(String),

    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("write conflict on notification request {0}")]
    Conflict(String),

    #[error("invalid notification request: {0}")]
    Validation(String),

    #[error("notification request {0} is terminal and cannot be modified")]
    Immutable(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sanitizer error: {0}")]
    Sanitizer(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
