use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{AtomicOutcome, ChangeKind, Collection, Document, Fields, Query, StoreChange};
use crate::subscription::{self, Subscription};

/// Default number of optimistic attempts before `run_atomic` gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 32;

/// Default depth of each subscription's delivery queue.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Capabilities the sync core needs from the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a live query. The first delivery is the current result set.
    fn subscribe(&self, query: Query) -> Subscription;

    async fn get_once(&self, collection: Collection, id: Uuid) -> StoreResult<Option<Document>>;

    /// One-shot read of a query's current result set.
    async fn fetch(&self, query: &Query) -> StoreResult<Vec<Document>>;

    /// Conditional read-modify-write. `update` may run more than once and
    /// returns `None` to abandon without writing.
    async fn run_atomic(
        &self,
        collection: Collection,
        id: Uuid,
        update: &(dyn for<'d> Fn(&'d Document) -> Option<Fields> + Send + Sync),
    ) -> StoreResult<AtomicOutcome>;

    /// Unconditional last-write-wins merge, creating the document if needed.
    async fn write_merge(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<()>;

    /// Merge into an existing document. Returns false if it does not exist.
    async fn update(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<bool>;

    /// Insert a document with a store-assigned id and timestamp.
    async fn append(&self, collection: Collection, fields: Fields) -> StoreResult<Document>;
}

/// [`DocumentStore`] over a local SQLite [`Database`].
///
/// Blocking SQL runs on the blocking pool. Every committed write is published
/// on an in-process broadcast channel that feeds live subscriptions.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Database,
    changes: broadcast::Sender<StoreChange>,
    max_attempts: u32,
    subscription_buffer: usize,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self::build(db, DEFAULT_MAX_ATTEMPTS, DEFAULT_SUBSCRIPTION_BUFFER)
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.rebuild(|inner| inner.max_attempts = max_attempts.max(1))
    }

    pub fn with_subscription_buffer(self, buffer: usize) -> Self {
        self.rebuild(|inner| inner.subscription_buffer = buffer.max(1))
    }

    fn build(db: Database, max_attempts: u32, subscription_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                db,
                changes,
                max_attempts,
                subscription_buffer,
            }),
        }
    }

    /// Builder helper; only valid before the store has been cloned.
    fn rebuild(self, f: impl FnOnce(&mut StoreInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self { inner: Arc::new(inner) }
            }
            Err(shared) => {
                warn!("SqliteStore already shared; ignoring configuration change");
                Self { inner: shared }
            }
        }
    }

    /// Run a blocking database call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner.db)).await?
    }

    fn publish(&self, collection: Collection, kind: ChangeKind, document: Document) {
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.inner.changes.send(StoreChange {
            collection,
            kind,
            document,
        });
    }

    pub(crate) async fn load(&self, query: Query) -> StoreResult<Vec<Document>> {
        self.blocking(move |db| match query {
            Query::Tail { collection, limit } => db.tail_documents(collection, limit),
            Query::FieldEquals { collection, .. } => {
                let docs = db.collection_documents(collection)?;
                Ok(docs.into_iter().filter(|d| query.matches(d)).collect())
            }
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn subscribe(&self, query: Query) -> Subscription {
        // Subscribe to changes before the initial read so nothing committed
        // in between is missed.
        let changes = self.inner.changes.subscribe();
        subscription::spawn(self.clone(), changes, query, self.inner.subscription_buffer)
    }

    async fn get_once(&self, collection: Collection, id: Uuid) -> StoreResult<Option<Document>> {
        self.blocking(move |db| db.get_document(collection, id)).await
    }

    async fn fetch(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.load(query.clone()).await
    }

    async fn run_atomic(
        &self,
        collection: Collection,
        id: Uuid,
        update: &(dyn for<'d> Fn(&'d Document) -> Option<Fields> + Send + Sync),
    ) -> StoreResult<AtomicOutcome> {
        let max_attempts = self.inner.max_attempts;

        for attempt in 1..=max_attempts {
            let Some(current) = self.get_once(collection, id).await? else {
                return Ok(AtomicOutcome::NotFound);
            };

            let Some(fields) = update(&current) else {
                return Ok(AtomicOutcome::Skipped);
            };

            let expected = current.version;
            let committed = self
                .blocking(move |db| db.compare_and_merge(collection, id, expected, &fields))
                .await?;

            match committed {
                Some(document) => {
                    self.publish(collection, ChangeKind::Modified, document.clone());
                    return Ok(AtomicOutcome::Committed {
                        attempts: attempt,
                        document,
                    });
                }
                None => {
                    debug!(
                        collection = collection.as_str(),
                        %id,
                        attempt,
                        "Atomic write lost a race, retrying"
                    );
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(StoreError::Contention {
            attempts: max_attempts,
        })
    }

    async fn write_merge(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<()> {
        let (kind, document) = self
            .blocking(move |db| db.merge_document(collection, id, &fields))
            .await?;
        self.publish(collection, kind, document);
        Ok(())
    }

    async fn update(&self, collection: Collection, id: Uuid, fields: Fields) -> StoreResult<bool> {
        let updated = self
            .blocking(move |db| db.update_document(collection, id, &fields))
            .await?;
        match updated {
            Some(document) => {
                self.publish(collection, ChangeKind::Modified, document);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append(&self, collection: Collection, fields: Fields) -> StoreResult<Document> {
        let document = self
            .blocking(move |db| db.insert_document(collection, &fields))
            .await?;
        self.publish(collection, ChangeKind::Added, document.clone());
        Ok(document)
    }
}
