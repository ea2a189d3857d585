// src/store/transaction.rs

//! Units of work over the [`Store`].
//!
//! A transaction records the original value of every resource and edge it
//! touches. `commit` and `boundary` make the changes durable and publish the
//! buffered messages; dropping an uncommitted transaction restores the
//! originals and discards the messages. Nested handles share the outer
//! transaction: only the outermost handle commits or rolls back.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::MutexGuard;

use tracing::{debug, warn};

use super::{Store, StoreData};
use crate::connector::ConnectorId;
use crate::dependency::{Dependency, DependencyKey};
use crate::errors::{Result, SchedulerError, StoreError};
use crate::resource::{JobDetails, Message, Resource, ResourceId, ResourceState};

#[derive(Debug, Default)]
struct Journal {
    next_id: Option<u64>,
    resources: HashMap<ResourceId, Option<Resource>>,
    dependencies: HashMap<DependencyKey, Option<Dependency>>,
}

impl Journal {
    fn is_empty(&self) -> bool {
        self.next_id.is_none() && self.resources.is_empty() && self.dependencies.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Begin,
    Committed,
    RolledBack,
}

pub struct Transaction<'s> {
    store: &'s Store,
    data: MutexGuard<'s, StoreData>,
    journal: Journal,
    pending: Vec<Message>,
    status: Status,
    depth: usize,
}

/// Scheduling order among READY jobs: priority descending, then oldest
/// submission, then lowest id.
fn ready_order(a: (ResourceId, &JobDetails), b: (ResourceId, &JobDetails)) -> Ordering {
    b.1.priority
        .cmp(&a.1.priority)
        .then(a.1.timestamp.cmp(&b.1.timestamp))
        .then(a.0.cmp(&b.0))
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store, data: MutexGuard<'s, StoreData>) -> Self {
        Self {
            store,
            data,
            journal: Journal::default(),
            pending: Vec::new(),
            status: Status::Begin,
            depth: 1,
        }
    }

    // ---- reads -----------------------------------------------------------

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.data.resources.get(&id)
    }

    pub fn resource(&self, id: ResourceId) -> Result<&Resource> {
        self.get(id).ok_or(SchedulerError::NotFound(id))
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.data.resources.values()
    }

    pub fn find_by_path(&self, connector: &ConnectorId, path: &Path) -> Option<ResourceId> {
        self.data.find_path(connector, path)
    }

    pub fn dependency(&self, key: DependencyKey) -> Option<&Dependency> {
        self.data.dependencies.get(&key)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.data.dependencies.values()
    }

    /// Edges where `id` is the consumer.
    pub fn requirements_of(&self, id: ResourceId) -> Vec<DependencyKey> {
        self.data.requirements_of(id)
    }

    /// Edges where `id` is the producer.
    pub fn dependents_of(&self, id: ResourceId) -> Vec<DependencyKey> {
        self.data.dependents_of(id)
    }

    pub fn ids_in_states(&self, states: &[ResourceState]) -> Vec<ResourceId> {
        self.data
            .resources
            .iter()
            .filter(|(_, r)| states.contains(&r.state()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// The READY job to run next, ignoring those `skip` rejects.
    pub fn ready_job(&self, skip: impl Fn(ResourceId) -> bool) -> Option<ResourceId> {
        self.data
            .resources
            .iter()
            .filter(|(_, r)| r.state() == ResourceState::Ready)
            .filter_map(|(id, r)| r.as_job().map(|j| (*id, j)))
            .filter(|(id, _)| !skip(*id))
            .min_by(|a, b| ready_order(*a, *b))
            .map(|(id, _)| id)
    }

    // ---- writes ----------------------------------------------------------

    /// Remember the original of `id`; true on the first touch of this segment.
    fn touch_resource(&mut self, id: ResourceId) -> bool {
        if self.journal.resources.contains_key(&id) {
            return false;
        }
        let original = self.data.resources.get(&id).cloned();
        self.journal.resources.insert(id, original);
        true
    }

    fn touch_dependency(&mut self, key: DependencyKey) {
        if !self.journal.dependencies.contains_key(&key) {
            let original = self.data.dependencies.get(&key).cloned();
            self.journal.dependencies.insert(key, original);
        }
    }

    /// Mutable access; bumps the version once per segment.
    pub fn resource_mut(&mut self, id: ResourceId) -> Result<&mut Resource> {
        if !self.data.resources.contains_key(&id) {
            return Err(SchedulerError::NotFound(id));
        }
        let first = self.touch_resource(id);
        let resource = self
            .data
            .resources
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        if first {
            resource.set_version(resource.version() + 1);
        }
        Ok(resource)
    }

    pub fn job_mut(&mut self, id: ResourceId) -> Result<&mut JobDetails> {
        let resource = self.resource_mut(id)?;
        let state = resource.state();
        resource
            .as_job_mut()
            .ok_or_else(|| SchedulerError::invalid_state(id, state, "not a job"))
    }

    /// Change the state of `id`, queueing a STATE_CHANGED message.
    pub fn set_state(&mut self, id: ResourceId, state: ResourceState) -> Result<bool> {
        let resource = self.resource_mut(id)?;
        let previous = resource.state();
        let changed = resource.set_state(state);
        if changed {
            debug!(resource = %id, from = %previous, to = %state, "state changed");
            self.emit(Message::StateChanged {
                resource: id,
                state,
            });
        }
        Ok(changed)
    }

    /// Store a new resource and assign its id.
    pub fn persist(&mut self, mut resource: Resource) -> Result<ResourceId> {
        if let Some(existing) = self.data.find_path(&resource.connector, &resource.path) {
            return Err(StoreError::DuplicatePath {
                path: resource.path.clone(),
                existing,
            }
            .into());
        }
        if self.journal.next_id.is_none() {
            self.journal.next_id = Some(self.data.next_id);
        }
        self.data.next_id += 1;
        let id = ResourceId(self.data.next_id);
        resource.set_id(id);
        resource.set_version(1);

        self.journal.resources.entry(id).or_insert(None);
        self.data.index_path(&resource, id);
        self.data.resources.insert(id, resource);
        self.emit(Message::ResourceAdded { resource: id });
        Ok(id)
    }

    /// Put `resource` in place of the record `id`, keeping the id.
    pub fn replace(&mut self, id: ResourceId, mut resource: Resource) -> Result<()> {
        let version = self.resource(id)?.version();
        self.touch_resource(id);
        resource.set_id(id);
        resource.set_version(version + 1);
        let state = resource.state();

        if let Some(old) = self.data.resources.remove(&id) {
            self.data.unindex_path(&old);
        }
        self.data.index_path(&resource, id);
        self.data.resources.insert(id, resource);
        self.emit(Message::StateChanged {
            resource: id,
            state,
        });
        Ok(())
    }

    /// Remove a resource and its inbound edges. Fails while it has dependents.
    pub fn remove(&mut self, id: ResourceId) -> Result<Resource> {
        let state = self.resource(id)?.state();
        if !self.dependents_of(id).is_empty() {
            return Err(SchedulerError::invalid_state(id, state, "other resources depend on it"));
        }
        for key in self.requirements_of(id) {
            self.remove_dependency(key)?;
        }
        self.touch_resource(id);
        let resource = self
            .data
            .resources
            .remove(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        self.data.unindex_path(&resource);
        self.emit(Message::ResourceRemoved { resource: id });
        Ok(resource)
    }

    pub fn add_dependency(&mut self, dependency: Dependency) -> Result<()> {
        let key = dependency.key;
        self.resource(key.from)?;
        self.resource(key.to)?;
        self.touch_dependency(key);
        if self.data.dependencies.insert(key, dependency).is_some() {
            warn!(dependency = %key, "overwriting an existing dependency");
        }
        self.data.link(key);
        Ok(())
    }

    pub fn dependency_mut(&mut self, key: DependencyKey) -> Result<&mut Dependency> {
        if !self.data.dependencies.contains_key(&key) {
            return Err(StoreError::MissingDependency(key).into());
        }
        self.touch_dependency(key);
        self.data
            .dependencies
            .get_mut(&key)
            .ok_or_else(|| StoreError::MissingDependency(key).into())
    }

    pub fn remove_dependency(&mut self, key: DependencyKey) -> Result<Dependency> {
        self.touch_dependency(key);
        let dependency = self
            .data
            .dependencies
            .remove(&key)
            .ok_or(StoreError::MissingDependency(key))?;
        self.data.unlink(key);
        Ok(dependency)
    }

    /// Queue a message for publication after commit.
    pub fn emit(&mut self, message: Message) {
        self.pending.push(message);
    }

    // ---- lifecycle -------------------------------------------------------

    /// Number of handles currently sharing this transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn nested(&mut self) -> NestedTransaction<'_, 's> {
        self.depth += 1;
        NestedTransaction { tx: self }
    }

    fn flush(&mut self) -> Result<()> {
        self.store.persist(&self.data)?;
        self.journal = Journal::default();
        let messages = std::mem::take(&mut self.pending);
        self.store.publish(messages);
        Ok(())
    }

    /// Make the current segment durable and keep going in a new one.
    pub fn boundary(&mut self) -> Result<()> {
        self.flush()
    }

    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        self.status = Status::Committed;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.undo();
        self.status = Status::RolledBack;
    }

    fn undo(&mut self) {
        let journal = std::mem::take(&mut self.journal);
        self.pending.clear();
        if journal.is_empty() {
            return;
        }
        if let Some(next_id) = journal.next_id {
            self.data.next_id = next_id;
        }
        for (id, original) in journal.resources {
            match original {
                Some(resource) => {
                    self.data.resources.insert(id, resource);
                }
                None => {
                    self.data.resources.remove(&id);
                }
            }
        }
        for (key, original) in journal.dependencies {
            match original {
                Some(dependency) => {
                    self.data.dependencies.insert(key, dependency);
                }
                None => {
                    self.data.dependencies.remove(&key);
                }
            }
        }
        self.data.rebuild_indexes();
        debug!("transaction rolled back");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status == Status::Begin {
            self.undo();
        }
    }
}

/// A handle on an enclosing transaction.
///
/// Committing it does nothing; the outermost transaction decides.
pub struct NestedTransaction<'t, 's> {
    tx: &'t mut Transaction<'s>,
}

impl NestedTransaction<'_, '_> {
    pub fn commit(self) {
        debug!(depth = self.tx.depth, "nested commit deferred to the outer transaction");
    }
}

impl<'s> Deref for NestedTransaction<'_, 's> {
    type Target = Transaction<'s>;

    fn deref(&self) -> &Self::Target {
        &*self.tx
    }
}

impl DerefMut for NestedTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tx
    }
}

impl Drop for NestedTransaction<'_, '_> {
    fn drop(&mut self) {
        self.tx.depth -= 1;
    }
}
