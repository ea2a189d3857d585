// src/connector/mock.rs

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use super::{Connector, ConnectorId};

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MockState {
    files: HashMap<PathBuf, MockFile>,
    broken: HashSet<PathBuf>,
}

/// In-memory connector. Clones share the same files.
#[derive(Debug, Clone)]
pub struct MockConnector {
    id: ConnectorId,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(ConnectorId::local())
    }
}

impl MockConnector {
    pub fn new(id: ConnectorId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.lock().files.insert(
            path.as_ref().to_path_buf(),
            MockFile {
                content: content.into(),
                modified: Utc::now(),
            },
        );
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> bool {
        self.lock().files.remove(path.as_ref()).is_some()
    }

    /// Make reads, mtime lookups and deletions of `path` fail.
    pub fn break_path(&self, path: impl AsRef<Path>) {
        self.lock().broken.insert(path.as_ref().to_path_buf());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock()
            .files
            .get(path.as_ref())
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn check(state: &MockState, path: &Path) -> Result<()> {
        if state.broken.contains(path) {
            return Err(anyhow!("I/O error on {:?}", path));
        }
        Ok(())
    }
}

impl Connector for MockConnector {
    fn id(&self) -> &ConnectorId {
        &self.id
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        Self::check(&state, path)?;
        if state.files.contains_key(path) {
            return Ok(false);
        }
        state.files.insert(
            path.to_path_buf(),
            MockFile {
                content: contents.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(true)
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        let mut state = self.lock();
        Self::check(&state, path)?;
        Ok(state.files.remove(path).is_some())
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        let state = self.lock();
        Self::check(&state, path)?;
        state
            .files
            .get(path)
            .map(|f| f.modified)
            .ok_or_else(|| anyhow!("File not found: {:?}", path))
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let state = self.lock();
        Self::check(&state, path)?;
        match state.files.get(path) {
            Some(file) => String::from_utf8(file.content.clone())
                .map_err(|e| anyhow!("Invalid UTF-8: {}", e)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        {
            let state = self.lock();
            Self::check(&state, path)?;
        }
        self.add_file(path, contents);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock();
        Self::check(&state, from)?;
        let file = state
            .files
            .remove(from)
            .ok_or_else(|| anyhow!("File not found: {:?}", from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }
}
