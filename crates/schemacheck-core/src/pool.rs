//! Fixed-size connection pool for concurrent verification workers.
//!
//! A worker checks out one connection and keeps it for a whole
//! before/execute/after cycle, which makes that cycle sequential by
//! construction. Different workers run their cycles concurrently. The pool
//! is the only shared mutable state in the engine.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::Connection;
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::duration_ms;
use tracing::{debug, info, warn};

use crate::executor::DEFAULT_BUSY_TIMEOUT;

/// Connections to one database file.
///
/// Each connection lives in its own slot for the pool's whole life; a
/// checkout hands out a lock on a free slot.
pub struct ConnectionPool {
    path: PathBuf,
    slots: Vec<Mutex<Connection>>,
    /// Indices of slots nobody has checked out.
    free: Mutex<Vec<usize>>,
    returned: Condvar,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("size", &self.slots.len())
            .field("idle", &self.free.lock().len())
            .finish()
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

impl ConnectionPool {
    /// Open `size` connections eagerly. Fails if any cannot be opened.
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SchemaCheckError::invalid_config("pool.size must be at least 1"));
        }
        let path = path.as_ref().to_path_buf();
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = open_connection(&path)
                .map_err(SchemaCheckError::connectivity("open pooled connection"))?;
            slots.push(Mutex::new(conn));
        }
        info!(path = %path.display(), size, "connection pool opened");
        Ok(Self {
            path,
            slots,
            free: Mutex::new((0..size).rev().collect()),
            returned: Condvar::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a connection, waiting up to `timeout` for one to be returned.
    pub fn checkout(&self, timeout: Duration) -> Result<PooledConnection<'_>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut free = self.free.lock();
        loop {
            if let Some(slot) = free.pop() {
                debug!(slot, idle = free.len(), "connection checked out");
                drop(free);
                return Ok(PooledConnection {
                    pool: self,
                    slot,
                    conn: self.slots[slot].lock(),
                });
            }
            if self.returned.wait_until(&mut free, deadline).timed_out() && free.is_empty() {
                let waited_ms = duration_ms(started.elapsed());
                warn!(waited_ms, size = self.slots.len(), "connection pool exhausted");
                return Err(SchemaCheckError::PoolExhausted { waited_ms });
            }
        }
    }

    fn give_back(&self, slot: usize) {
        self.free.lock().push(slot);
        self.returned.notify_one();
    }
}

/// A checked-out connection; returned to the pool on drop.
pub struct PooledConnection<'p> {
    pool: &'p ConnectionPool,
    slot: usize,
    conn: MutexGuard<'p, Connection>,
}

impl std::fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("path", &self.pool.path)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            // A panicking worker can leave a transaction open.
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback on connection return failed");
            }
        }
        // The next holder of this slot waits on the slot lock until this
        // guard's lock is released.
        self.pool.give_back(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_pool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConnectionPool::open(dir.path().join("db.sqlite"), 0).unwrap_err();
        assert!(matches!(err, SchemaCheckError::InvalidConfig { .. }));
    }

    #[test]
    fn checkout_times_out_when_every_connection_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("db.sqlite"), 1).unwrap();
        let held = pool.checkout(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.idle_count(), 0);

        let err = pool.checkout(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, SchemaCheckError::PoolExhausted { waited_ms } if waited_ms >= 30));
        assert!(err.is_connectivity());

        drop(held);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.checkout(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn every_slot_is_handed_out_once_until_returned() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("db.sqlite"), 3).unwrap();
        let held: Vec<_> = (0..3)
            .map(|_| pool.checkout(Duration::from_millis(10)).unwrap())
            .collect();
        let mut slots: Vec<usize> = held.iter().map(|conn| conn.slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(pool.idle_count(), 0);

        drop(held);
        assert_eq!(pool.idle_count(), 3);
        let again = pool.checkout(Duration::from_millis(10)).unwrap();
        let one: i64 = again.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn open_transaction_is_rolled_back_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("db.sqlite"), 1).unwrap();
        {
            let conn = pool.checkout(Duration::from_millis(10)).unwrap();
            conn.execute_batch("BEGIN; CREATE TABLE leaked (x);").unwrap();
        }
        let conn = pool.checkout(Duration::from_millis(10)).unwrap();
        assert!(conn.is_autocommit());
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'leaked'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }
}
