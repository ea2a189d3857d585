// src/connector/mod.rs

//! Host file-system access for marker files.
//!
//! Resource paths are logical; a [`Connector`] resolves them on the host it
//! stands for. Every primitive the scheduler relies on for crash-safe
//! coordination (atomic create-if-absent, delete, mtime) goes through here.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::{self, Debug};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod mock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(pub String);

impl ConnectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn local() -> Self {
        Self::new("local")
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker files kept next to a resource path `P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// `P.lock`: mutual exclusion while a dependent reads or writes.
    Lock,
    /// `P.done`: successful completion.
    Done,
    /// `P.state`: reader/writer registry.
    State,
    /// `P.code`: exit code.
    Code,
    Out,
    Err,
    /// `P.run`: generated run script.
    Run,
}

impl Marker {
    /// Files removed when a job is cleaned.
    pub const GENERATED: [Marker; 5] = [Marker::Done, Marker::Code, Marker::Err, Marker::Out, Marker::Run];

    pub fn suffix(self) -> &'static str {
        match self {
            Marker::Lock => ".lock",
            Marker::Done => ".done",
            Marker::State => ".state",
            Marker::Code => ".code",
            Marker::Out => ".out",
            Marker::Err => ".err",
            Marker::Run => ".run",
        }
    }

    pub fn path_for(self, path: &Path) -> PathBuf {
        with_suffix(path, self.suffix())
    }
}

/// Append `suffix` to the last component of `path` (`a/b` -> `a/b.lock`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Abstract host file-system interface.
pub trait Connector: Send + Sync + Debug {
    fn id(&self) -> &ConnectorId;

    /// Concrete location of a logical path on this host.
    fn resolve(&self, path: &Path) -> PathBuf;

    fn exists(&self, path: &Path) -> bool;

    /// Create `path` with `contents` only if it does not exist yet.
    ///
    /// Returns `Ok(false)` when the file is already there.
    fn create_new(&self, path: &Path, contents: &[u8]) -> Result<bool>;

    /// Delete `path`. Returns whether something was removed.
    fn remove(&self, path: &Path) -> Result<bool>;

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>>;

    fn read_to_string(&self, path: &Path) -> Result<String>;

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Connector for the machine the scheduler runs on.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    id: ConnectorId,
    root: PathBuf,
}

impl LocalConnector {
    /// Relative resource paths resolve under `root`.
    pub fn new(id: ConnectorId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
            }
        }
        Ok(())
    }
}

impl Connector for LocalConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        let full = self.resolve(path);
        self.ensure_parent(&full)?;
        match fs::OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(mut file) => {
                file.write_all(contents)
                    .with_context(|| format!("writing to file {:?}", full))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("creating file {:?}", full)),
        }
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing file {:?}", full)),
        }
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        let full = self.resolve(path);
        let modified = fs::metadata(&full)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("reading mtime of {:?}", full))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let full = self.resolve(path);
        fs::read_to_string(&full).with_context(|| format!("reading file {:?}", full))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        self.ensure_parent(&full)?;
        fs::write(&full, contents).with_context(|| format!("writing to file {:?}", full))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (self.resolve(from), self.resolve(to));
        fs::rename(&from, &to).with_context(|| format!("moving {:?} to {:?}", from, to))
    }
}

/// The connectors known to a scheduler, by id.
#[derive(Debug, Clone, Default)]
pub struct Connectors {
    by_id: HashMap<ConnectorId, Arc<dyn Connector>>,
}

impl Connectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.by_id.insert(connector.id().clone(), connector);
    }

    pub fn get(&self, id: &ConnectorId) -> Result<Arc<dyn Connector>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown connector '{}'", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_paths_append_suffix() {
        let p = Path::new("jobs/train");
        assert_eq!(Marker::Lock.path_for(p), PathBuf::from("jobs/train.lock"));
        assert_eq!(Marker::Done.path_for(p), PathBuf::from("jobs/train.done"));
        assert_eq!(with_suffix(Path::new("a.x"), ".tmp"), PathBuf::from("a.x.tmp"));
    }

    #[test]
    fn local_create_new_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(ConnectorId::local(), dir.path());
        let lock = Path::new("sub/r.lock");
        assert!(conn.create_new(lock, b"1").unwrap());
        assert!(!conn.create_new(lock, b"2").unwrap());
        assert_eq!(conn.read_to_string(lock).unwrap(), "1");
        assert!(conn.remove(lock).unwrap());
        assert!(!conn.remove(lock).unwrap());
        assert!(!conn.exists(lock));
    }
}
