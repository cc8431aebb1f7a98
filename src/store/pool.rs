use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};

use crate::error::AuditError;

/// Small checkout/checkin pool of read-only connections.
///
/// A connection is taken out of the idle list for the duration of one query and
/// handed back on drop, so the mutex is never held while SQLite is working.
pub struct ConnectionPool {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl ConnectionPool {
    pub fn open(db_path: &Path, max_idle: usize) -> Result<Self, AuditError> {
        let first = open_read_only(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            idle: Mutex::new(vec![first]),
            max_idle: max_idle.max(1),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get(&self) -> Result<PooledConnection<'_>, AuditError> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let connection = match reused {
            Some(connection) => connection,
            None => open_read_only(&self.db_path)?,
        };

        Ok(PooledConnection {
            pool: self,
            connection: Some(connection),
        })
    }

    fn give_back(&self, connection: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(connection);
            }
        }
    }
}

pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(connection);
        }
    }
}

fn open_read_only(db_path: &Path) -> Result<Connection, AuditError> {
    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|error| AuditError::Store {
        reason: format!(
            "failed to open database read-only: {}: {error}",
            db_path.display()
        ),
    })
}
