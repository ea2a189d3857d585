// src/resource/mod.rs

//! Persisted resources.
//!
//! A [`Resource`] is one record: identity, location, state and a
//! [`ResourceKind`] payload. Jobs and tokens are kinds, not subtypes; the
//! dependency edges between resources live in the store, keyed by ID.

pub mod job;
pub mod message;
pub mod state;
pub mod token;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::commands::Commands;
use crate::connector::{ConnectorId, Marker};

pub use job::JobDetails;
pub use message::{Message, MessageSender};
pub use state::{DependencyStatus, ResourceState};
pub use token::{TokenCounter, TokenDetails, TokenUsage};

/// Store-assigned identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    /// Data produced outside the scheduler (or by a job).
    Data,
    Job(JobDetails),
    Token(TokenDetails),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    id: Option<ResourceId>,
    pub connector: ConnectorId,
    pub path: PathBuf,
    state: ResourceState,
    version: u64,
    pub kind: ResourceKind,
}

impl Resource {
    fn new(connector: ConnectorId, path: impl Into<PathBuf>, state: ResourceState, kind: ResourceKind) -> Self {
        Self {
            id: None,
            connector,
            path: path.into(),
            state,
            version: 0,
            kind,
        }
    }

    /// A data resource; available (DONE) unless a state is given.
    pub fn data(connector: ConnectorId, path: impl Into<PathBuf>) -> Self {
        Self::new(connector, path, ResourceState::Done, ResourceKind::Data)
    }

    pub fn job(connector: ConnectorId, path: impl Into<PathBuf>, details: JobDetails) -> Self {
        Self::new(connector, path, ResourceState::Waiting, ResourceKind::Job(details))
    }

    /// Tokens are always DONE: availability is checked when locking.
    pub fn token(connector: ConnectorId, path: impl Into<PathBuf>, limit: u32) -> Self {
        Self::new(
            connector,
            path,
            ResourceState::Done,
            ResourceKind::Token(TokenDetails::new(limit)),
        )
    }

    /// Initial state, before the resource is stored.
    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self
    }

    pub fn id(&self) -> Option<ResourceId> {
        self.id
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, ResourceKind::Job(_))
    }

    pub fn as_job(&self) -> Option<&JobDetails> {
        match &self.kind {
            ResourceKind::Job(details) => Some(details),
            _ => None,
        }
    }

    pub fn as_job_mut(&mut self) -> Option<&mut JobDetails> {
        match &mut self.kind {
            ResourceKind::Job(details) => Some(details),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&TokenDetails> {
        match &self.kind {
            ResourceKind::Token(details) => Some(details),
            _ => None,
        }
    }

    /// Path of one of this resource's marker files.
    pub fn marker(&self, marker: Marker) -> PathBuf {
        marker.path_for(&self.path)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ResourceKind::Data => "data",
            ResourceKind::Job(_) => "job",
            ResourceKind::Token(_) => "token",
        }
    }

    pub(crate) fn set_id(&mut self, id: ResourceId) {
        self.id = Some(id);
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) -> bool {
        let changed = self.state != state;
        self.state = state;
        changed
    }

    pub(crate) fn location(&self) -> (&ConnectorId, &Path) {
        (&self.connector, &self.path)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} {} ({})", self.kind_name(), id, self.path.display()),
            None => write!(f, "{} ({})", self.kind_name(), self.path.display()),
        }
    }
}

/// Convenience for a job made of a single argv-style command.
pub fn job_from_args<I, S>(connector: ConnectorId, path: impl Into<PathBuf>, args: I) -> Resource
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let commands = Commands::single(crate::commands::Command::from_args(args));
    Resource::job(connector, path, JobDetails::new(commands))
}
