use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use labflow::exec::{JobProcess, JobRunner, StartRequest};
use labflow::lock::LockTarget;
use labflow::resource::MessageSender;
use labflow::{Message, ResourceId};

/// What the fake runner saw when a job was started.
#[derive(Debug, Clone)]
pub struct StartedJob {
    pub job: ResourceId,
    pub path: PathBuf,
    pub pid: String,
    /// Targets of the locks handed to the process, job lock first.
    pub locks: Vec<LockTarget>,
}

#[derive(Debug, Default)]
struct FakeState {
    started: Vec<StartedJob>,
    destroyed: Vec<ResourceId>,
    failing: HashSet<ResourceId>,
    senders: HashMap<ResourceId, MessageSender>,
    auto_exit: Option<i32>,
    next_pid: u32,
}

/// A job runner that never spawns anything.
///
/// - records every started job and the locks it was given
/// - can be told to fail `start_job` for chosen jobs
/// - reports `EndOfJob` either right away (`completing_with`) or when the
///   test calls [`FakeRunner::finish`].
#[derive(Debug, Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every started job exits at once with `code`.
    pub fn completing_with(code: i32) -> Self {
        let runner = Self::new();
        runner.lock().auto_exit = Some(code);
        runner
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make the next start attempts of `job` fail.
    pub fn fail_start(&self, job: ResourceId) {
        self.lock().failing.insert(job);
    }

    pub fn started(&self) -> Vec<ResourceId> {
        self.lock().started.iter().map(|s| s.job).collect()
    }

    pub fn started_jobs(&self) -> Vec<StartedJob> {
        self.lock().started.clone()
    }

    pub fn destroyed(&self) -> Vec<ResourceId> {
        self.lock().destroyed.clone()
    }

    /// Report the end of `job` the way a process monitor would.
    pub fn finish(&self, job: ResourceId, code: i32) -> bool {
        let sender = self.lock().senders.remove(&job);
        match sender {
            Some(tx) => tx.send(Message::end_of_job(job, code)).is_ok(),
            None => false,
        }
    }
}

impl JobRunner for FakeRunner {
    fn start_job(&self, request: StartRequest<'_>) -> Result<Box<dyn JobProcess>> {
        let mut state = self.lock();
        if state.failing.contains(&request.job) {
            bail!("simulated start failure for {}", request.job);
        }

        state.next_pid += 1;
        let pid = format!("fake-{}", state.next_pid);
        state.started.push(StartedJob {
            job: request.job,
            path: request.path.to_path_buf(),
            pid: pid.clone(),
            locks: request.locks.iter().map(|l| l.target().clone()).collect(),
        });

        let exit_code = Arc::new(Mutex::new(None));
        match state.auto_exit {
            Some(code) => {
                *exit_code.lock().unwrap() = Some(code);
                request
                    .messages
                    .send(Message::end_of_job(request.job, code))
                    .map_err(|_| anyhow!("scheduler inbox closed"))?;
            }
            None => {
                state.senders.insert(request.job, request.messages.clone());
            }
        }

        Ok(Box::new(FakeProcess {
            job: request.job,
            pid,
            exit_code,
            runner: self.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    job: ResourceId,
    pid: String,
    exit_code: Arc<Mutex<Option<i32>>>,
    runner: FakeRunner,
}

impl JobProcess for FakeProcess {
    fn pid(&self) -> &str {
        &self.pid
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    /// Killed processes report -1, like a signalled local process.
    fn destroy(&self) -> Result<()> {
        self.runner.lock().destroyed.push(self.job);
        *self.exit_code.lock().unwrap() = Some(-1);
        self.runner.finish(self.job, -1);
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}
