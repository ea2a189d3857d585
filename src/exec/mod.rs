// src/exec/mod.rs

//! Process execution layer.
//!
//! - [`backend`] defines the [`JobRunner`] / [`JobProcess`] traits the
//!   scheduler starts jobs through.
//! - [`local`] runs jobs on this machine with `tokio::process`, reporting
//!   their end back as `EndOfJob` messages.

pub mod backend;
pub mod local;

pub use backend::{JobProcess, JobRunner, StartRequest};
pub use local::LocalJobRunner;
