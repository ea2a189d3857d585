// src/exec/backend.rs

//! Pluggable process spawning.
//!
//! The scheduler talks to a [`JobRunner`] instead of spawning processes
//! itself. Production uses [`LocalJobRunner`](super::LocalJobRunner); tests
//! provide a runner that records starts and never touches the OS.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::commands::Commands;
use crate::connector::Connector;
use crate::lock::Lock;
use crate::resource::{MessageSender, ResourceId};

/// Everything a runner needs to start one job.
pub struct StartRequest<'a> {
    pub job: ResourceId,
    /// Logical path of the job; marker files hang off it.
    pub path: &'a Path,
    pub connector: &'a Arc<dyn Connector>,
    pub commands: &'a Commands,
    /// Locks already taken for the job. The runner must not release them.
    pub locks: &'a [Lock],
    /// Where to send `EndOfJob` once the process exits.
    pub messages: &'a MessageSender,
}

pub trait JobRunner: Send + Sync + Debug {
    /// Start the job's process.
    ///
    /// Must fail (not return a dead handle) when nothing could be started.
    fn start_job(&self, request: StartRequest<'_>) -> Result<Box<dyn JobProcess>>;
}

/// Handle on a started process.
pub trait JobProcess: Send + Sync + Debug {
    fn pid(&self) -> &str;

    /// Exit code, once known.
    fn exit_code(&self) -> Option<i32>;

    /// Kill the process. Its end is still reported through `EndOfJob`.
    fn destroy(&self) -> Result<()>;

    /// Stop tracking the process.
    fn dispose(&mut self) -> Result<()>;
}
