#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use labflow::commands::{Command, Commands};
use labflow::config::{ConfigFile, DataConfig, JobConfig, RawConfigFile, TokenConfig};
use labflow::connector::mock::MockConnector;
use labflow::connector::{ConnectorId, Connectors};
use labflow::scheduler::BackoffPolicy;
use labflow::{
    JobDetails, Launch, Requirement, Resource, ResourceId, ResourceState, Scheduler,
    SchedulerOptions, Store,
};

use crate::fake_runner::FakeRunner;

/// Options with short timings, suitable for tests.
pub fn test_options() -> SchedulerOptions {
    SchedulerOptions {
        pid: "sched".to_string(),
        poll_interval: Duration::from_millis(50),
        backoff: BackoffPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(200),
        },
    }
}

/// A scheduler over an in-memory store, a [`MockConnector`] and a
/// [`FakeRunner`]. Nothing runs in the background unless the test calls
/// `scheduler.start()`.
pub struct TestBed {
    pub scheduler: Scheduler,
    pub connector: MockConnector,
    pub runner: FakeRunner,
}

impl TestBed {
    pub fn new() -> Self {
        Self::build(Arc::new(Store::in_memory()), MockConnector::default(), FakeRunner::new())
    }

    /// Jobs exit with `code` as soon as they are started.
    pub fn completing_with(code: i32) -> Self {
        Self::build(
            Arc::new(Store::in_memory()),
            MockConnector::default(),
            FakeRunner::completing_with(code),
        )
    }

    pub fn build(store: Arc<Store>, connector: MockConnector, runner: FakeRunner) -> Self {
        let connectors = Connectors::new().with(Arc::new(connector.clone()));
        let scheduler = Scheduler::new(store, connectors, Arc::new(runner.clone()), test_options())
            .expect("scheduler over a test store");
        Self {
            scheduler,
            connector,
            runner,
        }
    }

    /// Data that is already available.
    pub fn data(&self, path: &str) -> ResourceId {
        self.scheduler
            .submit(Resource::data(ConnectorId::local(), path), Vec::new())
            .expect("submit data")
    }

    /// Data still to be produced (WAITING until its `.done` marker shows up).
    pub fn pending_data(&self, path: &str) -> ResourceId {
        let resource = Resource::data(ConnectorId::local(), path).with_state(ResourceState::Waiting);
        self.scheduler.submit(resource, Vec::new()).expect("submit data")
    }

    pub fn token(&self, path: &str, limit: u32) -> ResourceId {
        self.scheduler
            .submit(Resource::token(ConnectorId::local(), path, limit), Vec::new())
            .expect("submit token")
    }

    pub fn job(&self, path: &str) -> JobBuilder<'_> {
        JobBuilder::new(self, path)
    }

    pub fn state(&self, id: ResourceId) -> ResourceState {
        self.scheduler.state(id).expect("resource exists")
    }

    pub fn details(&self, id: ResourceId) -> JobDetails {
        self.scheduler
            .resource(id)
            .and_then(|r| r.as_job().cloned())
            .expect("job exists")
    }

    pub fn launch(&self) -> Launch {
        self.scheduler.launch_next().expect("launch_next")
    }

    /// Report the end of a started job and handle the message.
    pub fn finish(&self, id: ResourceId, code: i32) {
        assert!(self.runner.finish(id, code), "job {id} was not started by the fake runner");
        self.scheduler.process_messages().expect("process messages");
    }

    /// Launch and deliver end-of-job messages until nothing is ready.
    ///
    /// Only makes progress with a runner that exits on its own.
    pub fn run_until_idle(&self) -> Vec<Launch> {
        let mut launches = Vec::new();
        for _ in 0..1000 {
            let launch = self.launch();
            self.scheduler.process_messages().expect("process messages");
            if launch == Launch::Idle {
                return launches;
            }
            launches.push(launch);
        }
        panic!("scheduler did not become idle: {launches:?}");
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a job submitted to a [`TestBed`].
pub struct JobBuilder<'a> {
    bed: &'a TestBed,
    path: PathBuf,
    command: Command,
    priority: i32,
    timestamp: Option<DateTime<Utc>>,
    requirements: Vec<Requirement>,
}

impl<'a> JobBuilder<'a> {
    fn new(bed: &'a TestBed, path: &str) -> Self {
        Self {
            bed,
            path: PathBuf::from(path),
            command: Command::from_args(["true"]),
            priority: 0,
            timestamp: None,
            requirements: Vec::new(),
        }
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Command::from_args(args);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn submitted_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn after(mut self, from: ResourceId) -> Self {
        self.requirements.push(Requirement::read(from));
        self
    }

    pub fn exclusive(mut self, from: ResourceId) -> Self {
        self.requirements.push(Requirement::exclusive(from));
        self
    }

    pub fn tokens(mut self, token: ResourceId, count: u32) -> Self {
        self.requirements.push(Requirement::tokens(token, count));
        self
    }

    pub fn resource(&self) -> Resource {
        let mut details =
            JobDetails::new(Commands::single(self.command.clone())).with_priority(self.priority);
        if let Some(ts) = self.timestamp {
            details = details.with_timestamp(ts);
        }
        Resource::job(ConnectorId::local(), &self.path, details)
    }

    pub fn try_submit(self) -> labflow::errors::Result<ResourceId> {
        let resource = self.resource();
        self.bed.scheduler.submit(resource, self.requirements)
    }

    pub fn submit(self) -> ResourceId {
        self.try_submit().expect("submit job")
    }
}

/// Builder for a validated manifest.
pub struct ManifestBuilder {
    raw: RawConfigFile,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawConfigFile::default(),
        }
    }

    pub fn token(mut self, name: &str, limit: u32) -> Self {
        self.raw.token.insert(name.to_string(), TokenConfig { limit });
        self
    }

    pub fn data(mut self, name: &str, path: &str) -> Self {
        self.raw.data.insert(
            name.to_string(),
            DataConfig {
                path: PathBuf::from(path),
                done: true,
            },
        );
        self
    }

    pub fn job(mut self, name: &str, job: JobConfigBuilder) -> Self {
        self.raw.job.insert(name.to_string(), job.build());
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.raw
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.raw).expect("Failed to build valid manifest from builder")
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `JobConfig`.
pub struct JobConfigBuilder {
    job: JobConfig,
}

impl JobConfigBuilder {
    pub fn new(path: &str, command: &[&str]) -> Self {
        Self {
            job: JobConfig {
                path: PathBuf::from(path),
                command: command.iter().map(|s| s.to_string()).collect(),
                priority: 0,
                after: vec![],
                exclusive: vec![],
                tokens: BTreeMap::new(),
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.job.after.push(dep.to_string());
        self
    }

    pub fn exclusive(mut self, dep: &str) -> Self {
        self.job.exclusive.push(dep.to_string());
        self
    }

    pub fn tokens(mut self, token: &str, count: u32) -> Self {
        self.job.tokens.insert(token.to_string(), count);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}
