// src/scheduler/backoff.rs

//! Per-job backoff after lock failures.
//!
//! A READY job whose locks cannot be taken stays READY in the store but is
//! skipped by the runner until its delay expires. Any release of locks
//! clears every entry, since the failing job may now succeed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(failures - 1)`, capped at `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    until: Instant,
}

#[derive(Debug, Default)]
pub struct LockBackoff {
    policy: BackoffPolicy,
    entries: HashMap<ResourceId, Entry>,
}

impl LockBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Note one more failed attempt and return the delay before the next.
    pub fn record_failure(&mut self, job: ResourceId) -> Duration {
        let failures = self.entries.get(&job).map_or(0, |e| e.failures) + 1;
        let delay = self.policy.delay_for(failures);
        self.entries.insert(
            job,
            Entry {
                failures,
                until: Instant::now() + delay,
            },
        );
        delay
    }

    pub fn failures(&self, job: ResourceId) -> u32 {
        self.entries.get(&job).map_or(0, |e| e.failures)
    }

    pub fn clear(&mut self, job: ResourceId) {
        self.entries.remove(&job);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_deferred(&self, job: ResourceId) -> bool {
        self.entries
            .get(&job)
            .is_some_and(|e| e.until > Instant::now())
    }

    /// Earliest moment a deferred job becomes eligible again.
    pub fn next_expiry(&self) -> Option<Instant> {
        let now = Instant::now();
        self.entries
            .values()
            .map(|e| e.until)
            .filter(|until| *until > now)
            .min()
    }
}
