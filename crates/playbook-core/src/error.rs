//! Error types for Playbook

use crate::types::BulletStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bullet not found: {0}")]
    BulletNotFound(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: BulletStatus,
        to: BulletStatus,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("confirmation required: {count} bullets exceeds threshold {threshold}")]
    ConfirmationRequired { count: usize, threshold: usize },

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_transition(id: impl Into<String>, from: BulletStatus, to: BulletStatus) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from,
            to,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// True for failures that mean the backing store itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Store(_))
    }
}
