// src/commands/context.rs

//! Files a job's commands may need next to the job itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::connector::Connector;

/// Naming context for one job: auxiliary files live in the job's folder
/// and are named after the job.
#[derive(Debug)]
pub struct CommandContext<'a> {
    connector: &'a dyn Connector,
    folder: PathBuf,
    name: String,
    counters: HashMap<String, u32>,
    pipes: Vec<PathBuf>,
}

impl<'a> CommandContext<'a> {
    pub fn new(connector: &'a dyn Connector, job_path: &Path) -> Self {
        let folder = job_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = job_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string());
        Self {
            connector,
            folder,
            name,
            counters: HashMap::new(),
            pipes: Vec::new(),
        }
    }

    /// Logical path `<folder>/<name>.<key><suffix>`.
    pub fn aux_file(&self, key: &str, suffix: &str) -> PathBuf {
        self.folder.join(format!("{}.{}{}", self.name, key, suffix))
    }

    /// Logical path `<folder>/<name>.<prefix>-NNNN<suffix>`, new on each call.
    pub fn unique_file(&mut self, prefix: &str, suffix: &str) -> PathBuf {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        *counter += 1;
        self.folder
            .join(format!("{}.{}-{:04}{}", self.name, prefix, counter, suffix))
    }

    /// Write a parameter file and return where it went on the host.
    pub fn write_parameter_file(&self, key: &str, content: &str) -> Result<PathBuf> {
        let path = self.aux_file(key, ".input");
        self.connector
            .write(&path, content.as_bytes())
            .with_context(|| format!("writing parameter file '{}'", key))?;
        Ok(self.resolve(&path))
    }

    /// A fresh named pipe, removed when the script exits.
    pub fn new_pipe(&mut self) -> PathBuf {
        let path = self.unique_file("pipe", ".fifo");
        let resolved = self.resolve(&path);
        self.pipes.push(resolved.clone());
        resolved
    }

    pub fn pipes(&self) -> &[PathBuf] {
        &self.pipes
    }

    pub fn working_directory(&self) -> PathBuf {
        self.resolve(&self.folder)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.connector.resolve(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    #[test]
    fn names_follow_job() {
        let conn = MockConnector::default();
        let mut ctx = CommandContext::new(&conn, Path::new("jobs/train"));
        assert_eq!(ctx.aux_file("params", ".json"), PathBuf::from("jobs/train.params.json"));
        assert_eq!(ctx.unique_file("pipe", ".fifo"), PathBuf::from("jobs/train.pipe-0001.fifo"));
        assert_eq!(ctx.unique_file("pipe", ".fifo"), PathBuf::from("jobs/train.pipe-0002.fifo"));
        assert_eq!(ctx.unique_file("tmp", ""), PathBuf::from("jobs/train.tmp-0001"));
    }

    #[test]
    fn parameter_file_is_written() {
        let conn = MockConnector::default();
        let ctx = CommandContext::new(&conn, Path::new("jobs/train"));
        let path = ctx.write_parameter_file("params", "{\"lr\": 0.1}").unwrap();
        assert_eq!(path, PathBuf::from("jobs/train.params.input"));
        assert_eq!(conn.file(&path).as_deref(), Some("{\"lr\": 0.1}"));
    }
}
