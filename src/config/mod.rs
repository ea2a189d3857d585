// src/config/mod.rs

//! Submission manifest for the `labflow` binary.
//!
//! - `model.rs`: the TOML data model, raw and validated.
//! - `loader.rs`: reading a manifest from disk.
//! - `validate.rs`: references, paths, limits and the job graph.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_from_str};
pub use model::{
    ConfigFile, DataConfig, JobConfig, ManifestEntry, RawConfigFile, SchedulerSection,
    TokenConfig,
};
pub use validate::parse_duration;
