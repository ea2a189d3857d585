// src/store/mod.rs

//! Arena store for resources and dependency edges.
//!
//! Resources are keyed by [`ResourceId`], edges by [`DependencyKey`]; the
//! producer/consumer adjacency and the connector+path uniqueness index are
//! derived and rebuilt on load. All access goes through a [`Transaction`],
//! which holds the store's writer lock for its whole lifetime: the store is
//! single-writer, so selecting a row and updating it in the same
//! transaction cannot race with another scheduler thread.
//!
//! When opened with a snapshot path, the arena is written as JSON after
//! every committed transaction segment.

pub mod transaction;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

use crate::connector::{ConnectorId, with_suffix};
use crate::dependency::{Dependency, DependencyKey};
use crate::errors::StoreError;
use crate::resource::{Message, Resource, ResourceId};

pub use transaction::{NestedTransaction, Transaction};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct StoreData {
    pub(crate) next_id: u64,
    pub(crate) resources: BTreeMap<ResourceId, Resource>,
    pub(crate) dependencies: BTreeMap<DependencyKey, Dependency>,
    paths: HashMap<(ConnectorId, PathBuf), ResourceId>,
    /// consumer -> producers
    requirements: HashMap<ResourceId, BTreeSet<ResourceId>>,
    /// producer -> consumers
    dependents: HashMap<ResourceId, BTreeSet<ResourceId>>,
}

impl StoreData {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut data = StoreData {
            next_id: snapshot.next_id,
            ..Default::default()
        };
        for resource in snapshot.resources {
            if let Some(id) = resource.id() {
                data.resources.insert(id, resource);
            }
        }
        for dependency in snapshot.dependencies {
            data.dependencies.insert(dependency.key, dependency);
        }
        data.rebuild_indexes();
        data
    }

    pub(crate) fn rebuild_indexes(&mut self) {
        self.paths.clear();
        self.requirements.clear();
        self.dependents.clear();
        let located: Vec<_> = self
            .resources
            .iter()
            .map(|(id, r)| (*id, r.connector.clone(), r.path.clone()))
            .collect();
        for (id, connector, path) in located {
            self.paths.insert((connector, path), id);
        }
        let keys: Vec<_> = self.dependencies.keys().copied().collect();
        for key in keys {
            self.link(key);
        }
    }

    pub(crate) fn find_path(&self, connector: &ConnectorId, path: &Path) -> Option<ResourceId> {
        self.paths
            .get(&(connector.clone(), path.to_path_buf()))
            .copied()
    }

    pub(crate) fn index_path(&mut self, resource: &Resource, id: ResourceId) {
        let (connector, path) = resource.location();
        self.paths.insert((connector.clone(), path.to_path_buf()), id);
    }

    pub(crate) fn unindex_path(&mut self, resource: &Resource) {
        let (connector, path) = resource.location();
        self.paths.remove(&(connector.clone(), path.to_path_buf()));
    }

    pub(crate) fn link(&mut self, key: DependencyKey) {
        self.requirements.entry(key.to).or_default().insert(key.from);
        self.dependents.entry(key.from).or_default().insert(key.to);
    }

    pub(crate) fn unlink(&mut self, key: DependencyKey) {
        if let Some(set) = self.requirements.get_mut(&key.to) {
            set.remove(&key.from);
        }
        if let Some(set) = self.dependents.get_mut(&key.from) {
            set.remove(&key.to);
        }
    }

    pub(crate) fn requirements_of(&self, id: ResourceId) -> Vec<DependencyKey> {
        self.requirements
            .get(&id)
            .map(|froms| froms.iter().map(|from| DependencyKey::new(*from, id)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn dependents_of(&self, id: ResourceId) -> Vec<DependencyKey> {
        self.dependents
            .get(&id)
            .map(|tos| tos.iter().map(|to| DependencyKey::new(id, *to)).collect())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Snapshot {
    next_id: u64,
    resources: Vec<Resource>,
    dependencies: Vec<Dependency>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    next_id: u64,
    resources: Vec<&'a Resource>,
    dependencies: Vec<&'a Dependency>,
}

pub struct Store {
    data: Mutex<StoreData>,
    snapshot: Option<PathBuf>,
    events: broadcast::Sender<Message>,
    runners: Arc<Notify>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Store {
    pub fn in_memory() -> Self {
        Self::with_data(StoreData::default(), None)
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let load_err = |message: String| StoreError::Load {
                path: path.clone(),
                message,
            };
            let text = fs::read_to_string(&path).map_err(|e| load_err(e.to_string()))?;
            let snapshot: Snapshot =
                serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
            let data = StoreData::from_snapshot(snapshot);
            info!(
                path = %path.display(),
                resources = data.resources.len(),
                dependencies = data.dependencies.len(),
                "store loaded"
            );
            data
        } else {
            StoreData::default()
        };
        Ok(Self::with_data(data, Some(path)))
    }

    fn with_data(data: StoreData, snapshot: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data: Mutex::new(data),
            snapshot,
            events,
            runners: Arc::new(Notify::new()),
        }
    }

    pub fn begin(&self) -> Transaction<'_> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Transaction::new(self, guard)
    }

    /// Messages published after each successful commit.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Signalled whenever a job becomes READY.
    pub fn runners(&self) -> Arc<Notify> {
        Arc::clone(&self.runners)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    pub(crate) fn publish(&self, messages: Vec<Message>) {
        for message in messages {
            if let Message::StateChanged {
                state: crate::resource::ResourceState::Ready,
                ..
            } = message
            {
                self.runners.notify_one();
            }
            // No subscribers is fine.
            let _ = self.events.send(message);
        }
    }

    pub(crate) fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let persist_err = |message: String| StoreError::Persist {
            path: path.clone(),
            message,
        };
        let snapshot = SnapshotRef {
            next_id: data.next_id,
            resources: data.resources.values().collect(),
            dependencies: data.dependencies.values().collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| persist_err(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
        }
        let tmp = with_suffix(path, ".tmp");
        fs::write(&tmp, json).map_err(|e| persist_err(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| persist_err(e.to_string()))?;
        debug!(path = %path.display(), "store snapshot written");
        Ok(())
    }
}
