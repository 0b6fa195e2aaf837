//! Local document store for the chat sync core.
//!
//! Documents live in SQLite as JSON blobs keyed by `(collection, id)`.
//! [`SqliteStore`] layers change notification, live query subscriptions and
//! optimistic atomic transactions on top of [`Database`].

pub mod error;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod store;
pub mod subscription;

use std::path::Path;
use std::sync::{Arc, Mutex};

use parley_types::{Clock, SystemClock};
use rusqlite::Connection;
use tracing::info;

pub use error::{StoreError, StoreResult};
pub use models::{
    AtomicOutcome, ChangeKind, Collection, Document, DocumentChange, Fields, Query,
    QuerySnapshot, StoreChange, fields, to_fields,
};
pub use store::{DocumentStore, SqliteStore};
pub use subscription::Subscription;

pub struct Database {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run(&conn)?;

        info!("Store opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to stamp `created_at` on new documents.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }
}
