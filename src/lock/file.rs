// src/lock/file.rs

//! Exclusive marker-file locks.
//!
//! Taking the lock is an atomic create-if-absent of the marker; there is no
//! waiting. Releasing deletes the marker.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Lock, LockTarget};
use crate::connector::Connector;
use crate::errors::LockError;

/// Create `path` on behalf of `owner`, or fail with [`LockError::Held`].
pub fn acquire(connector: &Arc<dyn Connector>, path: &Path, owner: &str) -> Result<Lock, LockError> {
    let created = connector
        .create_new(path, owner.as_bytes())
        .map_err(LockError::Io)?;
    if !created {
        return Err(LockError::Held(path.to_path_buf()));
    }
    debug!(path = %path.display(), owner, "lock file created");
    Ok(Lock::with_connector(
        LockTarget::File {
            connector: connector.id().clone(),
            path: path.to_path_buf(),
        },
        owner,
        Arc::clone(connector),
    ))
}

pub(crate) fn release(connector: &dyn Connector, path: &Path) -> Result<(), LockError> {
    let removed = connector.remove(path).map_err(LockError::Io)?;
    if !removed {
        warn!(path = %path.display(), "lock file was already gone");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    #[test]
    fn second_acquire_fails_until_released() {
        let mock = MockConnector::default();
        let conn: Arc<dyn Connector> = Arc::new(mock.clone());
        let path = Path::new("data/r.lock");

        let lock = acquire(&conn, path, "100").unwrap();
        assert_eq!(mock.file(path).as_deref(), Some("100"));
        assert!(matches!(acquire(&conn, path, "200"), Err(LockError::Held(_))));

        lock.close().unwrap();
        assert!(!conn.exists(path));
        acquire(&conn, path, "200").unwrap();
    }
}
