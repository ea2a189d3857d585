// src/resource/job.rs

//! Job payload: scheduling attributes and dependency counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commands::Commands;
use crate::resource::{DependencyStatus, ResourceState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    /// Higher runs sooner.
    pub priority: i32,
    /// Submission time, used to break priority ties (oldest first).
    pub timestamp: DateTime<Utc>,
    /// Dependencies that are not OK yet.
    pub nb_unsatisfied: u32,
    /// Dependencies that are blocking (a subset of the unsatisfied ones).
    pub nb_holding: u32,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub pid: Option<String>,
    pub exit_code: Option<i32>,
    pub commands: Commands,
}

impl JobDetails {
    pub fn new(commands: Commands) -> Self {
        Self {
            priority: 0,
            timestamp: Utc::now(),
            nb_unsatisfied: 0,
            nb_holding: 0,
            start_timestamp: None,
            end_timestamp: None,
            pid: None,
            exit_code: None,
            commands,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The state implied by the counters.
    pub fn derived_state(&self) -> ResourceState {
        if self.nb_unsatisfied == 0 {
            ResourceState::Ready
        } else if self.nb_holding > 0 {
            ResourceState::OnHold
        } else {
            ResourceState::Waiting
        }
    }

    /// Adjust the counters for one dependency moving from `from` to `to`.
    ///
    /// A dependency that has never been evaluated counts as WAIT. Returns
    /// true when a counter changed.
    pub fn apply_transition(
        &mut self,
        from: Option<DependencyStatus>,
        to: DependencyStatus,
    ) -> bool {
        let from = from.unwrap_or(DependencyStatus::Wait);
        let ok_delta = i64::from(to.is_ok()) - i64::from(from.is_ok());
        let hold_delta = i64::from(to.is_blocking()) - i64::from(from.is_blocking());
        if ok_delta == 0 && hold_delta == 0 {
            return false;
        }

        self.nb_unsatisfied = shift(self.nb_unsatisfied, -ok_delta);
        self.nb_holding = shift(self.nb_holding, hold_delta);
        debug_assert!(
            self.nb_holding <= self.nb_unsatisfied,
            "holding {} > unsatisfied {}",
            self.nb_holding,
            self.nb_unsatisfied
        );
        true
    }

    pub(crate) fn reset_counts(&mut self) {
        self.nb_unsatisfied = 0;
        self.nb_holding = 0;
    }

    /// Count one dependency during a full recount.
    pub(crate) fn count(&mut self, status: DependencyStatus) {
        if !status.is_ok() {
            self.nb_unsatisfied += 1;
        }
        if status.is_blocking() {
            self.nb_holding += 1;
        }
    }

    pub(crate) fn reset_run(&mut self) {
        self.start_timestamp = None;
        self.end_timestamp = None;
        self.pid = None;
        self.exit_code = None;
    }
}

fn shift(value: u32, delta: i64) -> u32 {
    let next = i64::from(value) + delta;
    debug_assert!(next >= 0, "dependency counter went negative");
    u32::try_from(next.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> JobDetails {
        JobDetails::new(Commands::default())
    }

    #[test]
    fn wait_to_ok_makes_job_ready() {
        let mut job = details();
        job.nb_unsatisfied = 1;
        assert!(job.apply_transition(Some(DependencyStatus::Wait), DependencyStatus::OkLock));
        assert_eq!(job.nb_unsatisfied, 0);
        assert_eq!(job.derived_state(), ResourceState::Ready);
    }

    #[test]
    fn hold_is_counted_on_both_axes() {
        let mut job = details();
        job.nb_unsatisfied = 2;
        assert!(job.apply_transition(None, DependencyStatus::Hold));
        assert_eq!((job.nb_unsatisfied, job.nb_holding), (2, 1));
        assert_eq!(job.derived_state(), ResourceState::OnHold);

        assert!(job.apply_transition(Some(DependencyStatus::Hold), DependencyStatus::Ok));
        assert_eq!((job.nb_unsatisfied, job.nb_holding), (1, 0));
        assert_eq!(job.derived_state(), ResourceState::Waiting);
    }

    #[test]
    fn same_axes_change_nothing() {
        let mut job = details();
        job.nb_unsatisfied = 1;
        assert!(!job.apply_transition(Some(DependencyStatus::Ok), DependencyStatus::OkLock));
        assert!(!job.apply_transition(Some(DependencyStatus::Hold), DependencyStatus::Error));
        assert_eq!(job.nb_unsatisfied, 1);
    }

    #[test]
    fn recount_matches_statuses() {
        let mut job = details();
        for status in [
            DependencyStatus::OkLock,
            DependencyStatus::Wait,
            DependencyStatus::Hold,
        ] {
            job.count(status);
        }
        assert_eq!((job.nb_unsatisfied, job.nb_holding), (2, 1));
    }
}
