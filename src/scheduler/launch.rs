// src/scheduler/launch.rs

//! Selecting and starting jobs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{Inner, Launch, RunningJob, relock};
use crate::connector::{Connector, Marker};
use crate::errors::{Result, SchedulerError};
use crate::exec::StartRequest;
use crate::lock::{self, Lock};
use crate::resource::{Resource, ResourceId, ResourceState};
use crate::store::Transaction;

impl Inner {
    pub(super) fn launch_next(&self) -> Result<Launch> {
        let mut tx = self.store.begin();
        let next = {
            let backoff = self.backoff();
            tx.ready_job(|id| backoff.is_deferred(id))
        };
        let Some(id) = next else {
            return Ok(Launch::Idle);
        };

        tx.set_state(id, ResourceState::Locking)?;
        tx.boundary()?;

        let launch = match self.run_job(&mut tx, id) {
            Ok(launch) => {
                self.backoff().clear(id);
                launch
            }
            Err(e) if e.is_lock_error() => {
                let delay = self.backoff().record_failure(id);
                debug!(job = %id, error = %e, retry_in_ms = delay.as_millis() as u64, "locks unavailable; job requeued");
                tx.set_state(id, ResourceState::Waiting)?;
                self.update_status(&mut tx, id)?;
                Launch::Requeued(id)
            }
            Err(e) => {
                error!(job = %id, error = %e, "job could not be started");
                tx.set_state(id, ResourceState::Error)?;
                self.propagate(&mut tx, id)?;
                Launch::Failed(id)
            }
        };
        tx.commit()?;
        Ok(launch)
    }

    /// Start one job: done check, job lock, dependency locks, process.
    ///
    /// On anything but a start, every lock taken here is given back.
    fn run_job(&self, tx: &mut Transaction<'_>, id: ResourceId) -> Result<Launch> {
        let job = tx.resource(id)?.clone();
        let connector = self.connector_for(&job)?;
        if self.finish_if_done(tx, id, &job, connector.as_ref())? {
            return Ok(Launch::AlreadyDone(id));
        }

        let job_lock = lock::file::acquire(&connector, &job.marker(Marker::Lock), &self.options.pid)?;
        let mut acquired = vec![job_lock];
        let result = self.start_locked(tx, id, &job, &connector, &mut acquired);
        if !matches!(result, Ok(Launch::Started(_))) {
            self.release_attempt(tx, id, &acquired);
        }
        result
    }

    fn start_locked(
        &self,
        tx: &mut Transaction<'_>,
        id: ResourceId,
        job: &Resource,
        connector: &Arc<dyn Connector>,
        acquired: &mut Vec<Lock>,
    ) -> Result<Launch> {
        // Another scheduler may have finished it before we got the lock.
        if self.finish_if_done(tx, id, job, connector.as_ref())? {
            return Ok(Launch::AlreadyDone(id));
        }

        {
            let _ordered = relock(&self.lock_sync);
            for key in tx.requirements_of(id) {
                let from = tx.resource(key.from)?.clone();
                let from_connector = self.connector_for(&from)?;
                let lock = tx
                    .dependency_mut(key)?
                    .lock_for(&self.options.pid, &from, &from_connector)?;
                debug!(job = %id, dependency = %key, lock = %lock, "dependency locked");
                acquired.push(lock);
            }
        }

        let commands = job
            .as_job()
            .map(|details| details.commands.clone())
            .ok_or_else(|| SchedulerError::invalid_state(id, job.state(), "not a job"))?;
        tx.set_state(id, ResourceState::Running)?;
        tx.job_mut(id)?.start_timestamp = Some(Utc::now());

        let request = StartRequest {
            job: id,
            path: &job.path,
            connector,
            commands: &commands,
            locks: acquired.as_slice(),
            messages: &self.messages,
        };
        let process = self.runner.start_job(request).map_err(|e| SchedulerError::Start {
            job: id,
            message: format!("{e:#}"),
        })?;

        let pid = process.pid().to_string();
        for lock in acquired.iter() {
            if let Err(e) = lock.change_ownership(&pid) {
                if let Err(kill) = process.destroy() {
                    warn!(job = %id, error = %kill, "failed to destroy process after ownership failure");
                }
                return Err(SchedulerError::Start {
                    job: id,
                    message: format!("handing {} to process {}: {}", lock, pid, e),
                });
            }
        }

        tx.job_mut(id)?.pid = Some(pid.clone());
        self.processes().insert(
            id,
            RunningJob {
                process,
                locks: acquired.clone(),
            },
        );
        info!(job = %id, pid = %pid, locks = acquired.len(), "job started");
        Ok(Launch::Started(id))
    }

    /// Mark the job DONE if its done marker exists.
    fn finish_if_done(
        &self,
        tx: &mut Transaction<'_>,
        id: ResourceId,
        job: &Resource,
        connector: &dyn Connector,
    ) -> Result<bool> {
        let done = job.marker(Marker::Done);
        if !connector.exists(&done) {
            return Ok(false);
        }
        let finished = connector.modified(&done).unwrap_or_else(|_| Utc::now());
        tx.job_mut(id)?.end_timestamp = Some(finished);
        tx.set_state(id, ResourceState::Done)?;
        info!(job = %id, "done marker present; job not started");
        self.propagate(tx, id)?;
        Ok(true)
    }

    /// Undo a start attempt that did not produce a process.
    fn release_attempt(&self, tx: &mut Transaction<'_>, id: ResourceId, acquired: &[Lock]) {
        for key in tx.requirements_of(id) {
            if let Ok(dep) = tx.dependency_mut(key) {
                dep.take_lock();
            }
        }
        for lock in acquired.iter().rev() {
            if let Err(e) = lock.close() {
                warn!(job = %id, lock = %lock, error = %e, "failed to release lock after aborted start");
            }
        }
        if acquired.len() > 1 {
            self.store.runners().notify_one();
        }
    }
}
