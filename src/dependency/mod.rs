// src/dependency/mod.rs

//! Dependency edges between a producing resource and a consuming job.
//!
//! The status of an edge is a cache of [`Dependency::accept`]; it only
//! changes through [`Dependency::update`]. Admission policies are a closed
//! set, see [`DependencyKind`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connector::{Connector, Marker};
use crate::errors::LockError;
use crate::lock::{self, AccessMode, Lock, LockTarget};
use crate::resource::{DependencyStatus, Resource, ResourceId, ResourceState};

/// Identity of an edge: (producer, consumer).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DependencyKey {
    pub from: ResourceId,
    pub to: ResourceId,
}

impl DependencyKey {
    pub fn new(from: ResourceId, to: ResourceId) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyKind {
    /// Read the producer's output; registers a reader in its `.state` file.
    ReadWrite,
    /// Sole access to the producer, through its `.lock` marker.
    Exclusive,
    /// Take `tokens` from a token resource.
    CountToken { tokens: u32 },
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::ReadWrite => f.write_str("read-write"),
            DependencyKind::Exclusive => f.write_str("exclusive"),
            DependencyKind::CountToken { tokens } => write!(f, "token x{}", tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub key: DependencyKey,
    pub kind: DependencyKind,
    status: Option<DependencyStatus>,
    lock: Option<Lock>,
}

impl Dependency {
    pub fn new(from: ResourceId, to: ResourceId, kind: DependencyKind) -> Self {
        Self {
            key: DependencyKey::new(from, to),
            kind,
            status: None,
            lock: None,
        }
    }

    pub fn from(&self) -> ResourceId {
        self.key.from
    }

    pub fn to(&self) -> ResourceId {
        self.key.to
    }

    /// Cached status; `None` until the first [`update`](Self::update).
    pub fn status(&self) -> Option<DependencyStatus> {
        self.status
    }

    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// Whether this edge currently holds a claim on its producer.
    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|l| !l.is_released())
    }

    /// Status implied by the producer's current state and markers.
    pub fn accept(&self, from: &Resource, connector: &dyn Connector) -> DependencyStatus {
        match from.state() {
            ResourceState::Error | ResourceState::OnHold => DependencyStatus::Hold,
            ResourceState::Done => self.accept_done(from, connector),
            _ => DependencyStatus::Wait,
        }
    }

    fn accept_done(&self, from: &Resource, connector: &dyn Connector) -> DependencyStatus {
        match self.kind {
            DependencyKind::ReadWrite => DependencyStatus::OkLock,
            DependencyKind::Exclusive => {
                if connector.exists(&from.marker(Marker::Lock)) {
                    DependencyStatus::Wait
                } else {
                    DependencyStatus::OkLock
                }
            }
            // Admission happens when locking.
            DependencyKind::CountToken { .. } => DependencyStatus::OkLock,
        }
    }

    /// Recompute the cached status. Returns true when it changed.
    pub fn update(&mut self, from: &Resource, connector: &dyn Connector) -> bool {
        let status = self.accept(from, connector);
        if self.status == Some(status) {
            return false;
        }
        debug!(
            dependency = %self.key,
            from = ?self.status,
            to = %status,
            "dependency status changed"
        );
        self.status = Some(status);
        true
    }

    /// Take the claim this edge needs on `from`, without waiting.
    ///
    /// Calling it again while the claim is held returns the same lock.
    pub fn lock_for(
        &mut self,
        pid: &str,
        from: &Resource,
        connector: &Arc<dyn Connector>,
    ) -> Result<Lock, LockError> {
        if let Some(held) = self.lock.as_ref().filter(|l| !l.is_released()) {
            return Ok(held.clone());
        }

        let lock = match self.kind {
            DependencyKind::ReadWrite => {
                lock::status::acquire(connector, &from.path, pid, AccessMode::Read)?
            }
            DependencyKind::Exclusive => {
                lock::file::acquire(connector, &from.marker(Marker::Lock), pid)?
            }
            DependencyKind::CountToken { tokens } => {
                let token = from
                    .as_token()
                    .ok_or_else(|| LockError::Unbound(format!("{} is not a token", from)))?;
                token.counter().try_acquire(self.key.from, tokens)?;
                Lock::with_counter(
                    LockTarget::Token {
                        token: self.key.from,
                        tokens,
                    },
                    pid,
                    Arc::clone(token.counter()),
                )
            }
        };
        self.lock = Some(lock.clone());
        Ok(lock)
    }

    /// Release the claim once the consumer is finished.
    pub fn unactivate(&mut self) -> Result<(), LockError> {
        let lock = self.lock.take().ok_or(LockError::NotHeld(self.key))?;
        self.status = Some(DependencyStatus::Unactive);
        if let Err(e) = lock.close() {
            self.lock = Some(lock);
            return Err(e);
        }
        Ok(())
    }

    /// Forget a lock taken during a start attempt that did not go through.
    pub(crate) fn take_lock(&mut self) -> Option<Lock> {
        self.lock.take()
    }

    pub(crate) fn set_status(&mut self, status: DependencyStatus) {
        self.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorId;
    use crate::connector::mock::MockConnector;

    fn stored(mut r: Resource, id: u64) -> Resource {
        r.set_id(ResourceId(id));
        r
    }

    #[test]
    fn accept_follows_producer_state() {
        let conn = MockConnector::default();
        let dep = Dependency::new(ResourceId(1), ResourceId(2), DependencyKind::ReadWrite);
        let data = |state| stored(Resource::data(ConnectorId::local(), "d").with_state(state), 1);

        assert_eq!(dep.accept(&data(ResourceState::Waiting), &conn), DependencyStatus::Wait);
        assert_eq!(dep.accept(&data(ResourceState::Running), &conn), DependencyStatus::Wait);
        assert_eq!(dep.accept(&data(ResourceState::Error), &conn), DependencyStatus::Hold);
        assert_eq!(dep.accept(&data(ResourceState::OnHold), &conn), DependencyStatus::Hold);
        assert_eq!(dep.accept(&data(ResourceState::Done), &conn), DependencyStatus::OkLock);
    }

    #[test]
    fn exclusive_waits_for_lock_marker() {
        let conn = MockConnector::default();
        let from = stored(Resource::data(ConnectorId::local(), "data/r"), 1);
        let mut dep = Dependency::new(ResourceId(1), ResourceId(2), DependencyKind::Exclusive);

        conn.add_file("data/r.lock", "other");
        assert!(dep.update(&from, &conn));
        assert_eq!(dep.status(), Some(DependencyStatus::Wait));
        assert!(!dep.update(&from, &conn));

        conn.remove_file("data/r.lock");
        assert!(dep.update(&from, &conn));
        assert_eq!(dep.status(), Some(DependencyStatus::OkLock));
    }

    #[test]
    fn token_lock_is_gated_by_limit() {
        let mock = MockConnector::default();
        let conn: Arc<dyn Connector> = Arc::new(mock);
        let token = stored(Resource::token(ConnectorId::local(), "tokens/t", 1), 1);
        let kind = DependencyKind::CountToken { tokens: 1 };
        let mut a = Dependency::new(ResourceId(1), ResourceId(2), kind);
        let mut b = Dependency::new(ResourceId(1), ResourceId(3), kind);

        assert!(b.update(&token, conn.as_ref()));
        assert_eq!(b.status(), Some(DependencyStatus::OkLock));

        a.lock_for("1", &token, &conn).unwrap();
        assert!(matches!(
            b.lock_for("1", &token, &conn),
            Err(LockError::TokensExhausted { .. })
        ));
        assert!(b.lock().is_none());

        a.unactivate().unwrap();
        assert_eq!(a.status(), Some(DependencyStatus::Unactive));
        b.lock_for("1", &token, &conn).unwrap();
    }

    #[test]
    fn unactivate_without_lock_is_rejected() {
        let mut dep = Dependency::new(ResourceId(1), ResourceId(2), DependencyKind::ReadWrite);
        assert!(matches!(dep.unactivate(), Err(LockError::NotHeld(_))));
        assert_eq!(dep.status(), None);
    }
}
