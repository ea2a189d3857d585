// src/scheduler/lifecycle.rs

//! Resource state machine.
//!
//! All functions here run inside a caller-provided transaction, so a
//! dependency change and the cascade it triggers land in the same commit.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Inner, Requirement, RunningJob};
use crate::connector::{Connector, Marker};
use crate::dependency::{Dependency, DependencyKind};
use crate::errors::{Result, SchedulerError};
use crate::resource::{DependencyStatus, Message, Resource, ResourceId, ResourceKind, ResourceState};
use crate::store::Transaction;

impl Inner {
    pub(super) fn submit(
        &self,
        tx: &mut Transaction<'_>,
        resource: Resource,
        requirements: &[Requirement],
    ) -> Result<ResourceId> {
        if !requirements.is_empty() && !resource.is_job() {
            return Err(SchedulerError::ConfigError(format!(
                "{} cannot have requirements, only jobs can",
                resource
            )));
        }
        for requirement in requirements {
            let from = tx.resource(requirement.from)?;
            if let DependencyKind::CountToken { tokens } = requirement.kind {
                if from.as_token().is_none() {
                    return Err(SchedulerError::ConfigError(format!(
                        "{} is not a token and cannot be counted",
                        from
                    )));
                }
                if tokens == 0 {
                    return Err(SchedulerError::ConfigError(format!(
                        "requirement on {} must take at least one token",
                        from
                    )));
                }
            }
        }

        let (id, replaced) = match tx.find_by_path(&resource.connector, &resource.path) {
            Some(existing) => {
                let state = tx.resource(existing)?.state();
                if !state.is_updatable() {
                    return Err(SchedulerError::invalid_state(
                        existing,
                        state,
                        "cannot be replaced in this state",
                    ));
                }
                for key in tx.requirements_of(existing) {
                    let mut old = tx.remove_dependency(key)?;
                    if old.holds_lock() {
                        if let Err(e) = old.unactivate() {
                            warn!(dependency = %key, error = %e, "failed to release replaced dependency");
                        }
                    }
                }
                tx.replace(existing, resource)?;
                info!(resource = %existing, "resource replaced");
                (existing, true)
            }
            None => (tx.persist(resource)?, false),
        };

        for requirement in requirements {
            if requirement.from == id || self.reaches(tx, requirement.from, id) {
                return Err(SchedulerError::ConfigError(format!(
                    "requirement on {} would create a dependency cycle through {}",
                    requirement.from, id
                )));
            }
            tx.add_dependency(Dependency::new(requirement.from, id, requirement.kind))?;
            tx.job_mut(id)?.nb_unsatisfied += 1;
        }

        self.update_status(tx, id)?;
        if replaced {
            self.propagate(tx, id)?;
        }
        let state = tx.resource(id)?.state();
        info!(resource = %id, state = %state, requirements = requirements.len(), "resource submitted");
        Ok(id)
    }

    /// Whether `target` is an upstream requirement of `start`.
    fn reaches(&self, tx: &Transaction<'_>, start: ResourceId, target: ResourceId) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                queue.extend(tx.requirements_of(id).into_iter().map(|k| k.from));
            }
        }
        false
    }

    pub(super) fn handle_message(&self, tx: &mut Transaction<'_>, message: Message) -> Result<()> {
        match message {
            Message::EndOfJob {
                job,
                code,
                timestamp,
            } => self.end_of_job(tx, job, code, timestamp),
            Message::DependencyChanged { dependency, to, .. } => {
                let dep = tx.dependency_mut(dependency)?;
                let previous = dep.status();
                if previous == Some(to) {
                    return Ok(());
                }
                dep.set_status(to);
                let target = tx.resource(dependency.to)?.state();
                if target.is_notifiable() && self.dependency_changed(tx, dependency.to, previous, to)? {
                    self.propagate(tx, dependency.to)?;
                }
                Ok(())
            }
            Message::StateChanged { resource, state } => {
                if tx.set_state(resource, state)? {
                    self.propagate(tx, resource)?;
                }
                Ok(())
            }
            Message::ResourceAdded { resource } => {
                self.update_status(tx, resource)?;
                Ok(())
            }
            Message::ResourceRemoved { resource } => {
                if tx.get(resource).is_some() {
                    self.delete(tx, resource, false)?;
                }
                Ok(())
            }
        }
    }

    /// Re-evaluate every outbound edge of `origin` and cascade to consumers
    /// whose state changes as a result.
    pub(super) fn propagate(&self, tx: &mut Transaction<'_>, origin: ResourceId) -> Result<()> {
        let mut queue = VecDeque::from([origin]);
        while let Some(id) = queue.pop_front() {
            let from = tx.resource(id)?.clone();
            let connector = self.connector_for(&from)?;

            for key in tx.dependents_of(id) {
                let target = tx.resource(key.to)?.state();
                let dep = tx.dependency_mut(key)?;
                let previous = dep.status();
                if previous == Some(DependencyStatus::Unactive) {
                    continue;
                }
                if !dep.update(&from, connector.as_ref()) {
                    continue;
                }
                let Some(status) = dep.status() else {
                    continue;
                };
                tx.emit(Message::DependencyChanged {
                    dependency: key,
                    from: previous,
                    to: status,
                });

                if !target.is_notifiable() {
                    debug!(dependency = %key, state = %target, "consumer not notifiable");
                    continue;
                }
                if self.dependency_changed(tx, key.to, previous, status)? {
                    queue.push_back(key.to);
                }
            }
        }
        Ok(())
    }

    /// Apply one dependency transition to a job's counters and derive its
    /// state. Returns true when the state changed.
    pub(super) fn dependency_changed(
        &self,
        tx: &mut Transaction<'_>,
        job: ResourceId,
        from: Option<DependencyStatus>,
        to: DependencyStatus,
    ) -> Result<bool> {
        let details = tx.job_mut(job)?;
        if !details.apply_transition(from, to) {
            return Ok(false);
        }
        let derived = details.derived_state();
        let current = tx.resource(job)?.state();
        if !matches!(
            current,
            ResourceState::Waiting | ResourceState::Ready | ResourceState::OnHold
        ) {
            return Ok(false);
        }
        tx.set_state(job, derived)
    }

    /// [`do_update_status`](Self::do_update_status), falling back to ON_HOLD
    /// when the markers cannot be read. Propagates when the state changed.
    pub(super) fn update_status(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<bool> {
        let changed = match self.do_update_status(tx, id) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(resource = %id, error = %e, "status update failed; holding resource");
                tx.set_state(id, ResourceState::OnHold)?
            }
        };
        if changed {
            self.propagate(tx, id)?;
        }
        Ok(changed)
    }

    /// Reconcile a resource with its on-disk markers.
    pub(super) fn do_update_status(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<bool> {
        let resource = tx.resource(id)?.clone();
        let connector = self.connector_for(&resource)?;
        let done = resource.marker(Marker::Done);

        match &resource.kind {
            ResourceKind::Job(_) => {
                if connector.exists(&done) {
                    if resource.state() == ResourceState::Done {
                        return Ok(false);
                    }
                    let finished = connector.modified(&done)?;
                    let details = tx.job_mut(id)?;
                    details.end_timestamp.get_or_insert(finished);
                    return tx.set_state(id, ResourceState::Done);
                }
                if !matches!(resource.state(), ResourceState::Waiting | ResourceState::Ready) {
                    return Ok(false);
                }

                let mut statuses = Vec::new();
                for key in tx.requirements_of(id) {
                    let from = tx.resource(key.from)?.clone();
                    let from_connector = self.connector_for(&from)?;
                    let dep = tx.dependency_mut(key)?;
                    dep.update(&from, from_connector.as_ref());
                    statuses.extend(dep.status());
                }
                let details = tx.job_mut(id)?;
                details.reset_counts();
                for status in statuses {
                    details.count(status);
                }
                let derived = details.derived_state();
                tx.set_state(id, derived)
            }
            ResourceKind::Token(token) => {
                let mut held = 0;
                for key in tx.dependents_of(id) {
                    if let Some(dep) = tx.dependency(key) {
                        if let (DependencyKind::CountToken { tokens }, true) = (dep.kind, dep.holds_lock()) {
                            held += tokens;
                        }
                    }
                }
                token.counter().set_used(held);
                Ok(false)
            }
            ResourceKind::Data => {
                if resource.state() != ResourceState::Done && connector.exists(&done) {
                    return tx.set_state(id, ResourceState::Done);
                }
                Ok(false)
            }
        }
    }

    pub(super) fn end_of_job(
        &self,
        tx: &mut Transaction<'_>,
        job: ResourceId,
        code: i32,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let running = self.processes().remove(&job);
        let state = tx.resource(job)?.state();
        // A stopped job is already ERROR but still owns its process.
        let expected = match running {
            Some(_) => matches!(state, ResourceState::Running | ResourceState::Error),
            None => state == ResourceState::Running,
        };
        if !expected {
            debug!(job = %job, state = %state, "end of job for a job not running; ignored");
            if let Some(running) = running {
                dispose_process(job, running);
            }
            return Ok(());
        }

        let details = tx.job_mut(job)?;
        details.end_timestamp = Some(timestamp);
        details.exit_code = Some(code);
        let outcome = if code == 0 {
            ResourceState::Done
        } else {
            ResourceState::Error
        };
        tx.set_state(job, outcome)?;
        info!(job = %job, exit_code = code, state = %outcome, "job finished");

        let producers = self.release_job(tx, job, running)?;
        self.locks_released();
        self.propagate(tx, job)?;
        self.wake_exclusive_waiters(tx, producers)
    }

    /// Give back everything a finished or stopped job holds.
    ///
    /// Returns the producers whose exclusive lock was given back.
    fn release_job(
        &self,
        tx: &mut Transaction<'_>,
        job: ResourceId,
        running: Option<RunningJob>,
    ) -> Result<Vec<ResourceId>> {
        let producers = self.unactivate_requirements(tx, job)?;

        match running {
            Some(running) => dispose_process(job, running),
            None => {
                // Recovered after a restart: only the lock file is left.
                let resource = tx.resource(job)?;
                let connector = self.connector_for(resource)?;
                if let Err(e) = connector.remove(&resource.marker(Marker::Lock)) {
                    warn!(job = %job, error = %e, "failed to remove job lock file");
                }
            }
        }
        Ok(producers)
    }

    /// Close every claim `job` holds through its requirements.
    fn unactivate_requirements(&self, tx: &mut Transaction<'_>, job: ResourceId) -> Result<Vec<ResourceId>> {
        let mut producers = Vec::new();
        for key in tx.requirements_of(job) {
            let dep = tx.dependency_mut(key)?;
            if !dep.holds_lock() {
                continue;
            }
            if dep.kind == DependencyKind::Exclusive {
                producers.push(key.from);
            }
            if let Err(e) = dep.unactivate() {
                warn!(dependency = %key, error = %e, "failed to unactivate dependency");
            }
        }
        Ok(producers)
    }

    /// The `.lock` of these producers is gone: other exclusive users may
    /// now take it.
    fn wake_exclusive_waiters(&self, tx: &mut Transaction<'_>, producers: Vec<ResourceId>) -> Result<()> {
        for producer in producers {
            if tx.get(producer).is_some() {
                self.propagate(tx, producer)?;
            }
        }
        Ok(())
    }

    pub(super) fn stop(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<bool> {
        let resource = tx.resource(id)?;
        let state = resource.state();
        if !resource.is_job() {
            return Err(SchedulerError::invalid_state(id, state, "only jobs can be stopped"));
        }

        let mut producers = Vec::new();
        match state {
            ResourceState::Running => {
                let destroyed = match self.processes().get(&id) {
                    Some(running) => {
                        if let Err(e) = running.process.destroy() {
                            warn!(job = %id, error = %e, "failed to destroy job process");
                        }
                        true
                    }
                    None => false,
                };
                if !destroyed {
                    producers = self.release_job(tx, id, None)?;
                    self.locks_released();
                }
                tx.set_state(id, ResourceState::Error)?;
                info!(job = %id, "running job stopped");
            }
            ResourceState::Ready | ResourceState::Waiting => {
                tx.set_state(id, ResourceState::OnHold)?;
                info!(job = %id, "job put on hold");
            }
            _ => return Ok(false),
        }
        self.propagate(tx, id)?;
        self.wake_exclusive_waiters(tx, producers)?;
        Ok(true)
    }

    pub(super) fn restart(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<bool> {
        let resource = tx.resource(id)?.clone();
        if !resource.is_job() {
            return Err(SchedulerError::invalid_state(
                id,
                resource.state(),
                "only jobs can be restarted",
            ));
        }
        if resource.state().is_active() || resource.state() == ResourceState::Locking {
            debug!(job = %id, state = %resource.state(), "active job not restarted");
            return Ok(false);
        }
        if self.processes().contains_key(&id) {
            debug!(job = %id, "stopped job still has a process; not restarted");
            return Ok(false);
        }

        self.clean(&resource)?;
        tx.job_mut(id)?.reset_run();
        tx.set_state(id, ResourceState::Waiting)?;
        self.update_status(tx, id)?;
        self.propagate(tx, id)?;
        self.backoff().clear(id);
        info!(job = %id, state = %tx.resource(id)?.state(), "job restarted");
        Ok(true)
    }

    /// Remove the markers a run generates. Failures are only logged.
    pub(super) fn clean(&self, resource: &Resource) -> Result<()> {
        let connector = self.connector_for(resource)?;
        clean_markers(connector.as_ref(), resource);
        Ok(())
    }

    pub(super) fn delete(&self, tx: &mut Transaction<'_>, id: ResourceId, recursive: bool) -> Result<()> {
        // Every check passes before a marker is removed: rollback does not
        // restore files.
        let mut order = Vec::new();
        self.collect_deletions(tx, id, recursive, &mut HashSet::new(), &mut order)?;

        let mut released = false;
        let mut producers = Vec::new();
        for id in order {
            let mut step = tx.nested();
            let (held, exclusive) = self.remove_resource(&mut step, id)?;
            step.commit();
            released |= held;
            producers.extend(exclusive);
        }
        if released {
            self.locks_released();
        }
        self.wake_exclusive_waiters(tx, producers)
    }

    /// Remove one resource whose dependents are already gone. Returns
    /// whether it held any lock, and the producers it held exclusively.
    fn remove_resource(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<(bool, Vec<ResourceId>)> {
        let resource = tx.resource(id)?.clone();
        let held = tx
            .requirements_of(id)
            .into_iter()
            .any(|key| tx.dependency(key).is_some_and(|dep| dep.holds_lock()));
        let exclusive = self.unactivate_requirements(tx, id)?;
        if resource.is_job() {
            self.clean(&resource)?;
        }
        tx.remove(id)?;
        self.backoff().clear(id);
        info!(resource = %id, "resource deleted");
        Ok((held, exclusive))
    }

    /// Resources a delete of `id` removes, dependents before their producers.
    fn collect_deletions(
        &self,
        tx: &Transaction<'_>,
        id: ResourceId,
        recursive: bool,
        seen: &mut HashSet<ResourceId>,
        order: &mut Vec<ResourceId>,
    ) -> Result<()> {
        if !seen.insert(id) {
            return Ok(());
        }
        let state = tx.resource(id)?.state();
        let has_process = self.processes().contains_key(&id);
        if has_process || matches!(state, ResourceState::Running | ResourceState::Locking) {
            return Err(SchedulerError::invalid_state(id, state, "cannot delete a running job"));
        }

        let dependents = tx.dependents_of(id);
        if !dependents.is_empty() && !recursive {
            return Err(SchedulerError::invalid_state(
                id,
                state,
                "other resources depend on it",
            ));
        }
        for key in dependents {
            self.collect_deletions(tx, key.to, true, seen, order)?;
        }
        order.push(id);
        Ok(())
    }

    /// Returns true when the new limit unblocks a previously full token.
    pub(super) fn set_token_limit(&self, tx: &mut Transaction<'_>, id: ResourceId, limit: u32) -> Result<bool> {
        let resource = tx.resource_mut(id)?;
        let state = resource.state();
        let token = resource
            .as_token()
            .ok_or_else(|| SchedulerError::invalid_state(id, state, "not a token"))?;
        let before = token.limit();
        let unblocked = token.counter().set_limit(limit);
        info!(token = %id, from = before, to = limit, used = token.used(), "token limit changed");
        Ok(unblocked)
    }

    pub(super) fn reconcile(&self, tx: &mut Transaction<'_>) -> Result<()> {
        // Nothing is mid-launch while we hold the store.
        for id in tx.ids_in_states(&[ResourceState::Locking]) {
            warn!(job = %id, "job left in locking state; requeued");
            tx.set_state(id, ResourceState::Waiting)?;
        }

        for id in tx.ids_in_states(&[
            ResourceState::Waiting,
            ResourceState::Ready,
            ResourceState::OnHold,
        ]) {
            if tx.get(id).is_some() {
                self.update_status(tx, id)?;
            }
        }

        for id in tx.ids_in_states(&[ResourceState::Running]) {
            if self.processes().contains_key(&id) {
                continue;
            }
            let resource = tx.resource(id)?.clone();
            let connector = self.connector_for(&resource)?;
            if let Some((code, finished)) = recorded_exit(connector.as_ref(), &resource) {
                info!(job = %id, exit_code = code, "recovered result of an orphaned job");
                self.end_of_job(tx, id, code, finished)?;
            }
        }
        Ok(())
    }
}

fn clean_markers(connector: &dyn Connector, resource: &Resource) {
    for marker in Marker::GENERATED {
        let path = resource.marker(marker);
        match connector.remove(&path) {
            Ok(true) => debug!(path = %path.display(), "marker removed"),
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove marker"),
        }
    }
}

/// Exit code left on disk by a process nobody is watching any more.
fn recorded_exit(connector: &dyn Connector, resource: &Resource) -> Option<(i32, DateTime<Utc>)> {
    let code_path = resource.marker(Marker::Code);
    if connector.exists(&code_path) {
        let finished = connector.modified(&code_path).unwrap_or_else(|_| Utc::now());
        let code = match connector.read_to_string(&code_path) {
            Ok(text) => text.trim().parse().unwrap_or_else(|_| {
                warn!(path = %code_path.display(), content = %text.trim(), "unreadable exit code");
                -1
            }),
            Err(e) => {
                warn!(path = %code_path.display(), error = %e, "failed to read exit code");
                -1
            }
        };
        return Some((code, finished));
    }

    let done_path = resource.marker(Marker::Done);
    if connector.exists(&done_path) {
        let finished = connector.modified(&done_path).unwrap_or_else(|_| Utc::now());
        return Some((0, finished));
    }
    None
}

fn dispose_process(job: ResourceId, mut running: RunningJob) {
    if let Err(e) = running.process.dispose() {
        warn!(job = %job, error = %e, "failed to dispose job process");
    }
    for lock in &running.locks {
        if let Err(e) = lock.close() {
            warn!(job = %job, lock = %lock, error = %e, "failed to release lock");
        }
    }
}
