// src/lock/status.rs

//! Shared read/write locks recorded in a resource's `P.state` file.
//!
//! Each line is `<pid> <r|w>`. The file is only touched while holding the
//! resource's `P.lock` marker; it is rewritten through `P.state.tmp` and a
//! rename, and deleted once the last entry goes away. Many readers may be
//! registered at once; a writer excludes everyone else.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{AccessMode, Lock, LockTarget, file};
use crate::connector::{Connector, Marker, with_suffix};
use crate::errors::LockError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRegistry {
    entries: BTreeMap<String, AccessMode>,
}

impl StatusRegistry {
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(AccessMode::from_flag)) {
                (Some(pid), Some(mode)) => {
                    entries.insert(pid.to_string(), mode);
                }
                _ => warn!(line, "ignoring malformed status entry"),
            }
        }
        Self { entries }
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(pid, mode)| format!("{} {}\n", pid, mode.flag()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn readers(&self) -> usize {
        self.entries.values().filter(|m| **m == AccessMode::Read).count()
    }

    pub fn writers(&self) -> usize {
        self.entries.values().filter(|m| **m == AccessMode::Write).count()
    }

    pub fn mode_of(&self, pid: &str) -> Option<AccessMode> {
        self.entries.get(pid).copied()
    }
}

/// Register `owner` in the status file of `path`.
pub fn acquire(
    connector: &Arc<dyn Connector>,
    path: &Path,
    owner: &str,
    mode: AccessMode,
) -> Result<Lock, LockError> {
    let state_path = Marker::State.path_for(path);
    update(connector, path, owner, |registry| {
        let conflict = match mode {
            AccessMode::Read => registry.writers() > 0,
            AccessMode::Write => !registry.is_empty(),
        };
        if conflict {
            return Err(LockError::Held(state_path.clone()));
        }
        registry.entries.insert(owner.to_string(), mode);
        Ok(())
    })?;
    debug!(path = %path.display(), owner, mode = %mode.flag(), "status lock created");

    Ok(Lock::with_connector(
        LockTarget::Status {
            connector: connector.id().clone(),
            path: path.to_path_buf(),
            mode,
        },
        owner,
        Arc::clone(connector),
    ))
}

pub(crate) fn release(connector: &Arc<dyn Connector>, path: &Path, owner: &str) -> Result<(), LockError> {
    update(connector, path, owner, |registry| {
        if registry.entries.remove(owner).is_none() {
            warn!(path = %path.display(), owner, "no status entry to remove");
        }
        Ok(())
    })
}

pub(crate) fn change_owner(
    connector: &Arc<dyn Connector>,
    path: &Path,
    from: &str,
    to: &str,
) -> Result<(), LockError> {
    update(connector, path, from, |registry| {
        match registry.entries.remove(from) {
            Some(mode) => {
                registry.entries.insert(to.to_string(), mode);
            }
            None => warn!(path = %path.display(), from, "no status entry to hand over"),
        }
        Ok(())
    })
}

fn update<F>(connector: &Arc<dyn Connector>, path: &Path, owner: &str, f: F) -> Result<(), LockError>
where
    F: FnOnce(&mut StatusRegistry) -> Result<(), LockError>,
{
    let guard = file::acquire(connector, &Marker::Lock.path_for(path), owner)?;
    let result = rewrite(connector.as_ref(), path, f);
    if let Err(e) = guard.close() {
        warn!(path = %path.display(), error = %e, "could not remove status guard");
    }
    result
}

fn rewrite<F>(connector: &dyn Connector, path: &Path, f: F) -> Result<(), LockError>
where
    F: FnOnce(&mut StatusRegistry) -> Result<(), LockError>,
{
    let state_path = Marker::State.path_for(path);
    let mut registry = if connector.exists(&state_path) {
        let text = connector.read_to_string(&state_path).map_err(LockError::Io)?;
        StatusRegistry::parse(&text)
    } else {
        StatusRegistry::default()
    };

    f(&mut registry)?;

    if registry.is_empty() {
        connector.remove(&state_path).map_err(LockError::Io)?;
    } else {
        let tmp = with_suffix(&state_path, ".tmp");
        connector
            .write(&tmp, registry.render().as_bytes())
            .map_err(LockError::Io)?;
        connector.rename(&tmp, &state_path).map_err(LockError::Io)?;
    }
    Ok(())
}
