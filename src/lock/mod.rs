// src/lock/mod.rs

//! Acquired claims on resources.
//!
//! A [`Lock`] is a cheap handle: clones share the same claim, and the claim
//! is given back at most once whichever clone closes it. The variants are:
//!
//! - an exclusive marker file (`P.lock`), see [`file`];
//! - an entry in a resource's `P.state` reader/writer registry, see [`status`];
//! - a number of tokens taken from a [`TokenCounter`].
//!
//! Locks are persisted with the dependency that holds them. After a reload
//! they are unbound and must be re-attached to a connector or counter
//! before they can be released.

pub mod file;
pub mod status;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::connector::{Connector, ConnectorId};
use crate::errors::LockError;
use crate::resource::{ResourceId, TokenCounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn flag(self) -> char {
        match self {
            AccessMode::Read => 'r',
            AccessMode::Write => 'w',
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "r" => Some(AccessMode::Read),
            "w" => Some(AccessMode::Write),
            _ => None,
        }
    }
}

/// What a lock holds, independent of any live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockTarget {
    File {
        connector: ConnectorId,
        path: PathBuf,
    },
    Status {
        connector: ConnectorId,
        path: PathBuf,
        mode: AccessMode,
    },
    Token {
        token: ResourceId,
        tokens: u32,
    },
}

#[derive(Debug, Clone)]
enum Binding {
    Connector(Arc<dyn Connector>),
    Counter(Arc<TokenCounter>),
}

#[derive(Debug)]
struct LockInner {
    target: LockTarget,
    owner: Mutex<String>,
    released: AtomicBool,
    binding: Mutex<Option<Binding>>,
}

#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Lock {
    fn build(target: LockTarget, owner: &str, released: bool, binding: Option<Binding>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                target,
                owner: Mutex::new(owner.to_string()),
                released: AtomicBool::new(released),
                binding: Mutex::new(binding),
            }),
        }
    }

    pub(crate) fn with_connector(target: LockTarget, owner: &str, connector: Arc<dyn Connector>) -> Self {
        Self::build(target, owner, false, Some(Binding::Connector(connector)))
    }

    pub(crate) fn with_counter(target: LockTarget, owner: &str, counter: Arc<TokenCounter>) -> Self {
        Self::build(target, owner, false, Some(Binding::Counter(counter)))
    }

    pub fn target(&self) -> &LockTarget {
        &self.inner.target
    }

    pub fn owner(&self) -> String {
        relock(&self.inner.owner).clone()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self) -> bool {
        relock(&self.inner.binding).is_some()
    }

    pub(crate) fn bind_connector(&self, connector: Arc<dyn Connector>) {
        *relock(&self.inner.binding) = Some(Binding::Connector(connector));
    }

    pub(crate) fn bind_counter(&self, counter: Arc<TokenCounter>) {
        *relock(&self.inner.binding) = Some(Binding::Counter(counter));
    }

    fn connector(&self) -> Result<Arc<dyn Connector>, LockError> {
        match relock(&self.inner.binding).as_ref() {
            Some(Binding::Connector(c)) => Ok(Arc::clone(c)),
            _ => Err(LockError::Unbound(self.to_string())),
        }
    }

    fn counter(&self) -> Result<Arc<TokenCounter>, LockError> {
        match relock(&self.inner.binding).as_ref() {
            Some(Binding::Counter(c)) => Ok(Arc::clone(c)),
            _ => Err(LockError::Unbound(self.to_string())),
        }
    }

    /// Hand the claim over to another process id.
    pub fn change_ownership(&self, pid: &str) -> Result<(), LockError> {
        let previous = self.owner();
        if previous == pid {
            return Ok(());
        }
        match &self.inner.target {
            LockTarget::File { path, .. } => {
                self.connector()?
                    .write(path, pid.as_bytes())
                    .map_err(LockError::Io)?;
            }
            LockTarget::Status { path, .. } => {
                status::change_owner(&self.connector()?, path, &previous, pid)?;
            }
            LockTarget::Token { .. } => {}
        }
        debug!(lock = %self, from = %previous, to = %pid, "lock ownership changed");
        *relock(&self.inner.owner) = pid.to_string();
        Ok(())
    }

    /// Release the claim. Closing an already released lock does nothing.
    pub fn close(&self) -> Result<(), LockError> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.release();
        if result.is_err() {
            // Nothing was given back; allow another attempt.
            self.inner.released.store(false, Ordering::SeqCst);
        } else {
            debug!(lock = %self, "lock released");
        }
        result
    }

    fn release(&self) -> Result<(), LockError> {
        match &self.inner.target {
            LockTarget::File { path, .. } => file::release(self.connector()?.as_ref(), path),
            LockTarget::Status { path, .. } => {
                status::release(&self.connector()?, path, &self.owner())
            }
            LockTarget::Token { token, tokens } => {
                self.counter()?.release(*token, *tokens);
                Ok(())
            }
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.target {
            LockTarget::File { connector, path } => {
                write!(f, "file {}:{}", connector, path.display())
            }
            LockTarget::Status {
                connector,
                path,
                mode,
            } => write!(f, "status[{}] {}:{}", mode.flag(), connector, path.display()),
            LockTarget::Token { token, tokens } => write!(f, "{} token(s) of {}", tokens, token),
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("target", &self.inner.target)
            .field("owner", &self.owner())
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct LockRecord {
    target: LockTarget,
    owner: String,
    released: bool,
}

impl Serialize for Lock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        LockRecord {
            target: self.inner.target.clone(),
            owner: self.owner(),
            released: self.is_released(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Lock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = LockRecord::deserialize(deserializer)?;
        Ok(Lock::build(record.target, &record.owner, record.released, None))
    }
}
