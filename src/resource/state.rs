// src/resource/state.rs

//! Resource states and dependency statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a resource.
///
/// `Locking` is transient: the runner holds a job in it between selecting
/// the job and either starting its process or putting it back to WAITING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Waiting,
    Ready,
    Locking,
    Running,
    OnHold,
    Error,
    Done,
}

impl ResourceState {
    /// States that can be replaced by a newer resource with the same path.
    pub const UPDATABLE: [ResourceState; 4] = [
        ResourceState::Ready,
        ResourceState::OnHold,
        ResourceState::Error,
        ResourceState::Waiting,
    ];

    pub fn is_active(self) -> bool {
        matches!(
            self,
            ResourceState::Waiting | ResourceState::Running | ResourceState::Ready
        )
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, ResourceState::OnHold | ResourceState::Error)
    }

    pub fn is_updatable(self) -> bool {
        Self::UPDATABLE.contains(&self)
    }

    /// Whether a consumer in this state reacts to dependency changes.
    pub fn is_notifiable(self) -> bool {
        !matches!(
            self,
            ResourceState::Running | ResourceState::Done | ResourceState::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Waiting => "waiting",
            ResourceState::Ready => "ready",
            ResourceState::Locking => "locking",
            ResourceState::Running => "running",
            ResourceState::OnHold => "on_hold",
            ResourceState::Error => "error",
            ResourceState::Done => "done",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a dependency edge, ordered by id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    /// Satisfied, nothing to lock.
    Ok,
    /// Satisfied once the lock is taken.
    OkLock,
    Wait,
    Hold,
    Error,
    /// The consuming job finished; the edge no longer takes part in scheduling.
    Unactive,
}

impl DependencyStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, DependencyStatus::Ok | DependencyStatus::OkLock)
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, DependencyStatus::Hold | DependencyStatus::Error)
    }
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyStatus::Ok => "ok",
            DependencyStatus::OkLock => "ok_lock",
            DependencyStatus::Wait => "wait",
            DependencyStatus::Hold => "hold",
            DependencyStatus::Error => "error",
            DependencyStatus::Unactive => "unactive",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_sets() {
        assert!(ResourceState::Waiting.is_active());
        assert!(ResourceState::Running.is_active());
        assert!(!ResourceState::OnHold.is_active());
        assert!(ResourceState::Error.is_blocking());
        assert!(!ResourceState::Done.is_blocking());
        assert!(ResourceState::Error.is_updatable());
        assert!(!ResourceState::Running.is_updatable());
        assert!(!ResourceState::Done.is_updatable());
        assert!(ResourceState::OnHold.is_notifiable());
        assert!(!ResourceState::Running.is_notifiable());
    }

    #[test]
    fn dependency_status_order_and_axes() {
        assert!(DependencyStatus::Ok < DependencyStatus::OkLock);
        assert!(DependencyStatus::Error < DependencyStatus::Unactive);
        assert!(DependencyStatus::OkLock.is_ok());
        assert!(!DependencyStatus::Wait.is_ok());
        assert!(DependencyStatus::Hold.is_blocking());
        assert!(!DependencyStatus::Unactive.is_blocking());
    }

    #[test]
    fn states_display_lowercase() {
        assert_eq!(ResourceState::OnHold.to_string(), "on_hold");
        assert_eq!(DependencyStatus::OkLock.to_string(), "ok_lock");
    }
}
