use std::sync::Arc;

use parley_store::{Collection, DocumentStore, Query, QuerySnapshot, StoreResult, Subscription};
use tracing::{debug, info, warn};

use crate::feed::{FeedUpdate, MessageFeed};

/// Keeps the local message feed in step with a tail-limited subscription.
///
/// Growing the window replaces the subscription: the old one is fully
/// cancelled before the new one is opened, and the new one replays its whole
/// window as `added`, which the feed deduplicates.
pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    feed: MessageFeed,
    subscription: Option<Subscription>,
    window: usize,
}

impl Reconciler {
    /// Subscribe to the newest `window` messages.
    pub fn open(store: Arc<dyn DocumentStore>, window: usize) -> Self {
        let subscription = Some(store.subscribe(Query::tail(Collection::Messages, window)));
        info!(window, "Message subscription opened");
        Self {
            store,
            feed: MessageFeed::new(),
            subscription,
            window,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn feed(&self) -> &MessageFeed {
        &self.feed
    }

    /// Load `increment` older messages by resubscribing with a larger tail.
    pub async fn grow_window(&mut self, increment: usize) {
        if let Some(old) = self.subscription.take() {
            old.cancel().await;
        }
        self.window = self.window.saturating_add(increment);
        self.subscription = Some(
            self.store
                .subscribe(Query::tail(Collection::Messages, self.window)),
        );
        info!(window = self.window, "Message window grown");
    }

    /// Wait for the next delivery. Pends forever once the subscription has
    /// ended, so it can sit in a `select!` without spinning.
    pub async fn next_delivery(&mut self) -> StoreResult<QuerySnapshot> {
        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                return std::future::pending().await;
            };
            match subscription.next().await {
                Some(delivery) => return delivery,
                None => {
                    debug!("Message subscription closed");
                    self.subscription = None;
                }
            }
        }
    }

    /// Fold a delivery into the feed. Errors leave the feed untouched.
    pub fn reconcile(&mut self, delivery: StoreResult<QuerySnapshot>) -> Vec<FeedUpdate> {
        match delivery {
            Ok(snapshot) => self.feed.apply_changes(&snapshot.changes),
            Err(e) => {
                warn!("Error listening to messages: {}", e);
                Vec::new()
            }
        }
    }

    /// Stop listening. The feed keeps its contents.
    pub async fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel().await;
        }
    }
}
