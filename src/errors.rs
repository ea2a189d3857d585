// src/errors.rs

//! Crate-wide error types.
//!
//! Lock failures and store failures have their own enums so the scheduler
//! can tell a recoverable lock error apart from everything else without
//! looking at messages.

use std::path::PathBuf;

use thiserror::Error;

use crate::dependency::DependencyKey;
use crate::resource::{ResourceId, ResourceState};

/// A claim on a resource could not be taken (or given back).
///
/// Failing to acquire is never fatal: the job is requeued and retried.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock file {0:?} is already held")]
    Held(PathBuf),

    #[error("token {token} exhausted: {used} used + {requested} requested > limit {limit}")]
    TokensExhausted {
        token: ResourceId,
        used: u32,
        requested: u32,
        limit: u32,
    },

    #[error("dependency {0} holds no lock")]
    NotHeld(DependencyKey),

    #[error("lock on {0} is not bound to a live connector or counter")]
    Unbound(String),

    #[error("lock I/O failure: {0:#}")]
    Io(anyhow::Error),
}

/// Failures of the resource store or of a transaction.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("path {path:?} is already used by resource {existing}")]
    DuplicatePath { path: PathBuf, existing: ResourceId },

    #[error("unknown dependency {0}")]
    MissingDependency(DependencyKey),

    #[error("failed to persist store snapshot {path:?}: {message}")]
    Persist { path: PathBuf, message: String },

    #[error("failed to load store snapshot {path:?}: {message}")]
    Load { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to start job {job}: {message}")]
    Start { job: ResourceId, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Resource not found: {0}")]
    NotFound(ResourceId),

    #[error("resource {id} is {state}: {reason}")]
    InvalidState {
        id: ResourceId,
        state: ResourceState,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    /// Lock errors are recoverable: the job goes back to WAITING.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, SchedulerError::Lock(_))
    }

    pub(crate) fn invalid_state(
        id: ResourceId,
        state: ResourceState,
        reason: impl Into<String>,
    ) -> Self {
        SchedulerError::InvalidState {
            id,
            state,
            reason: reason.into(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SchedulerError>;
