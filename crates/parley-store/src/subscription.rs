use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{ChangeKind, Document, DocumentChange, Query, QuerySnapshot, StoreChange};
use crate::store::SqliteStore;

/// Handle to a live query.
///
/// Deliveries arrive in commit order through a bounded queue. Dropping the
/// handle stops the producer; [`Subscription::cancel`] also waits for it to
/// finish so no further deliveries can race a replacement subscription.
pub struct Subscription {
    rx: mpsc::Receiver<StoreResult<QuerySnapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Build a subscription from a raw delivery queue. Used by stores that
    /// produce snapshots themselves.
    pub fn from_parts(
        rx: mpsc::Receiver<StoreResult<QuerySnapshot>>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, cancel, task }
    }

    /// Next delivery, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<StoreResult<QuerySnapshot>> {
        self.rx.recv().await
    }

    /// Stop the producer and wait for it. Undelivered snapshots are dropped.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn(
    store: SqliteStore,
    changes: broadcast::Receiver<StoreChange>,
    query: Query,
    buffer: usize,
) -> Subscription {
    let (tx, rx) = mpsc::channel(buffer);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(store, changes, query, tx, cancel.clone()));
    Subscription::from_parts(rx, cancel, Some(task))
}

async fn run(
    store: SqliteStore,
    mut changes: broadcast::Receiver<StoreChange>,
    query: Query,
    tx: mpsc::Sender<StoreResult<QuerySnapshot>>,
    cancel: CancellationToken,
) {
    let mut state = QueryState::new(query.clone());

    match store.load(query.clone()).await {
        Ok(docs) => {
            let initial = state.reset(docs);
            if !deliver(&tx, &cancel, Ok(state.snapshot(initial))).await {
                return;
            }
        }
        Err(e) => {
            warn!(collection = query.collection().as_str(), "Initial query failed: {}", e);
            deliver(&tx, &cancel, Err(e)).await;
            return;
        }
    }

    loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };

        let applied = match change {
            Ok(change) => {
                if change.collection != query.collection() {
                    continue;
                }
                state.apply(change)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(
                    collection = query.collection().as_str(),
                    "Subscription lagged by {} changes, re-reading query", n
                );
                match store.load(query.clone()).await {
                    Ok(docs) => state.reset(docs),
                    Err(e) => {
                        deliver(&tx, &cancel, Err(e)).await;
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if applied.is_empty() {
            continue;
        }
        if !deliver(&tx, &cancel, Ok(state.snapshot(applied))).await {
            break;
        }
    }

    debug!(collection = query.collection().as_str(), "Subscription ended");
}

/// Push one delivery, giving up if the subscription is cancelled or the
/// consumer has gone away. Returns false when the producer should stop.
async fn deliver(
    tx: &mpsc::Sender<StoreResult<QuerySnapshot>>,
    cancel: &CancellationToken,
    item: StoreResult<QuerySnapshot>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// The result set a subscription currently holds, kept ascending by
/// `(created_at, id)`.
#[derive(Debug)]
pub(crate) struct QueryState {
    query: Query,
    docs: Vec<Document>,
}

impl QueryState {
    pub(crate) fn new(query: Query) -> Self {
        Self {
            query,
            docs: Vec::new(),
        }
    }

    pub(crate) fn snapshot(&self, changes: Vec<DocumentChange>) -> QuerySnapshot {
        QuerySnapshot {
            changes,
            docs: self.docs.clone(),
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.docs.iter().position(|d| d.id == id)
    }

    fn insert_sorted(&mut self, doc: Document) -> usize {
        let key = doc.order_key();
        let idx = self.docs.partition_point(|d| d.order_key() < key);
        self.docs.insert(idx, doc);
        idx
    }

    /// Replace the held set with `fresh` and describe the difference.
    pub(crate) fn reset(&mut self, fresh: Vec<Document>) -> Vec<DocumentChange> {
        let mut held: HashMap<Uuid, Document> =
            self.docs.drain(..).map(|d| (d.id, d)).collect();
        let mut changes = Vec::new();

        for doc in &fresh {
            match held.remove(&doc.id) {
                Some(old) if old.version != doc.version => {
                    changes.push(DocumentChange::modified(doc.clone()))
                }
                Some(_) => {}
                None => changes.push(DocumentChange::added(doc.clone())),
            }
        }

        let mut gone: Vec<Document> = held.into_values().collect();
        gone.sort_by_key(Document::order_key);
        let mut out: Vec<DocumentChange> = gone.into_iter().map(DocumentChange::removed).collect();
        out.extend(changes);

        self.docs = fresh;
        self.docs.sort_by_key(Document::order_key);
        out
    }

    /// Fold one committed write into the held set.
    pub(crate) fn apply(&mut self, change: StoreChange) -> Vec<DocumentChange> {
        let doc = change.document;

        if let Some(idx) = self.position(doc.id) {
            if doc.version <= self.docs[idx].version {
                trace!(id = %doc.id, version = doc.version, "Ignoring stale change");
                return Vec::new();
            }
            if !self.query.matches(&doc) {
                let old = self.docs.remove(idx);
                return vec![DocumentChange::removed(old)];
            }
            self.docs[idx] = doc.clone();
            return vec![DocumentChange::modified(doc)];
        }

        if !self.query.matches(&doc) {
            return Vec::new();
        }

        let limit = match self.query {
            Query::Tail { limit, .. } => limit,
            Query::FieldEquals { .. } => {
                self.insert_sorted(doc.clone());
                return vec![DocumentChange::added(doc)];
            }
        };

        // An unseen document can arrive as Modified while its insert
        // notification is still in flight; both enter the window the same way.
        if change.kind == ChangeKind::Removed || limit == 0 {
            return Vec::new();
        }
        let idx = self.insert_sorted(doc.clone());
        if self.docs.len() <= limit {
            return vec![DocumentChange::added(doc)];
        }
        let evicted = self.docs.remove(0);
        if idx == 0 {
            // Older than everything in a full window.
            return Vec::new();
        }
        vec![DocumentChange::added(doc), DocumentChange::removed(evicted)]
    }
}
