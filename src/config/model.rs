// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::{BackoffPolicy, SchedulerOptions};

/// Submission manifest as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// workdir = ".labflow"
/// store = "store.json"
///
/// [token.gpu]
/// limit = 2
///
/// [data.corpus]
/// path = "data/corpus"
///
/// [job.train]
/// path = "jobs/train"
/// command = ["python", "train.py"]
/// after = ["prepare"]
/// exclusive = ["corpus"]
/// tokens = { gpu = 1 }
/// ```
///
/// Every section is optional. Use [`ConfigFile`] (via `TryFrom`) for a
/// validated manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    /// `[token.<name>]` sections.
    #[serde(default)]
    pub token: BTreeMap<String, TokenConfig>,

    /// `[data.<name>]` sections.
    #[serde(default)]
    pub data: BTreeMap<String, DataConfig>,

    /// `[job.<name>]` sections.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// `[scheduler]` section, durations still as strings (`"200ms"`, `"5s"`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawSchedulerSection {
    /// Root of the local connector; relative resource paths live under it.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// JSON snapshot of the store, relative to `workdir` unless absolute.
    /// Without it the store lives in memory only.
    #[serde(default)]
    pub store: Option<PathBuf>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".labflow")
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_backoff_base() -> String {
    "200ms".to_string()
}

fn default_backoff_max() -> String {
    "30s".to_string()
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            store: None,
            poll_interval: default_poll_interval(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub path: PathBuf,

    /// Whether the data already exists. When false the resource waits for
    /// its `.done` marker.
    #[serde(default = "default_done")]
    pub done: bool,
}

fn default_done() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub path: PathBuf,

    /// Argument vector of the job's single command.
    pub command: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    /// Read-write dependencies on jobs or data.
    #[serde(default)]
    pub after: Vec<String>,

    /// Exclusive dependencies on jobs or data.
    #[serde(default)]
    pub exclusive: Vec<String>,

    /// Tokens taken while the job runs, by token name.
    #[serde(default)]
    pub tokens: BTreeMap<String, u32>,
}

/// Validated `[scheduler]` section.
#[derive(Debug, Clone)]
pub struct SchedulerSection {
    pub workdir: PathBuf,
    pub store: Option<PathBuf>,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl SchedulerSection {
    /// Where the store snapshot lives, if any.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.as_ref().map(|store| {
            if store.is_absolute() {
                store.clone()
            } else {
                self.workdir.join(store)
            }
        })
    }

    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: self.poll_interval,
            backoff: self.backoff,
            ..SchedulerOptions::default()
        }
    }
}

/// A validated manifest.
///
/// Construct through `ConfigFile::try_from(raw)`, which checks references,
/// paths and the job graph.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub token: BTreeMap<String, TokenConfig>,
    pub data: BTreeMap<String, DataConfig>,
    pub job: BTreeMap<String, JobConfig>,
    job_order: Vec<String>,
}

/// One manifest entry, in submission order.
#[derive(Debug, Clone, Copy)]
pub enum ManifestEntry<'a> {
    Token(&'a str, &'a TokenConfig),
    Data(&'a str, &'a DataConfig),
    Job(&'a str, &'a JobConfig),
}

impl ManifestEntry<'_> {
    pub fn name(&self) -> &str {
        match self {
            ManifestEntry::Token(name, _)
            | ManifestEntry::Data(name, _)
            | ManifestEntry::Job(name, _) => name,
        }
    }
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        scheduler: SchedulerSection,
        token: BTreeMap<String, TokenConfig>,
        data: BTreeMap<String, DataConfig>,
        job: BTreeMap<String, JobConfig>,
        job_order: Vec<String>,
    ) -> Self {
        Self {
            scheduler,
            token,
            data,
            job,
            job_order,
        }
    }

    /// Tokens, then data, then jobs with every job after its requirements.
    pub fn submission_order(&self) -> Vec<ManifestEntry<'_>> {
        let tokens = self
            .token
            .iter()
            .map(|(name, cfg)| ManifestEntry::Token(name, cfg));
        let data = self
            .data
            .iter()
            .map(|(name, cfg)| ManifestEntry::Data(name, cfg));
        let jobs = self
            .job_order
            .iter()
            .filter_map(|name| self.job.get_key_value(name))
            .map(|(name, cfg)| ManifestEntry::Job(name, cfg));
        tokens.chain(data).chain(jobs).collect()
    }
}
