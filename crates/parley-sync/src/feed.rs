use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_store::{ChangeKind, DocumentChange};
use parley_types::{ClientEvent, Message};
use tracing::{debug, trace, warn};
use uuid::Uuid;

type FeedKey = (DateTime<Utc>, Uuid);

/// What a delivery did to the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    /// Inserted at `index`. Appends land at the end; pagination replays of
    /// older messages land earlier.
    Added { index: usize, message: Message },
    Updated { message: Message },
}

impl FeedUpdate {
    pub fn into_event(self) -> ClientEvent {
        match self {
            Self::Added { index, message } => ClientEvent::MessageAdded { index, message },
            Self::Updated { message } => ClientEvent::MessageUpdated { message },
        }
    }
}

/// Local read-through projection of the message window.
///
/// Entries stay sorted by `(timestamp, id)` and are unique by id. The feed
/// never removes entries: deletes are tombstones, and messages scrolling out
/// of a tail window stay rendered.
#[derive(Debug, Default)]
pub struct MessageFeed {
    entries: Vec<Message>,
    keys: HashMap<Uuid, FeedKey>,
}

impl MessageFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Message> {
        let key = self.keys.get(&id)?;
        self.index_of(*key).map(|idx| &self.entries[idx])
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    fn index_of(&self, key: FeedKey) -> Option<usize> {
        self.entries
            .binary_search_by(|m| m.order_key().cmp(&key))
            .ok()
    }

    /// Apply an `added` delivery. Already-held ids are ignored.
    pub fn insert(&mut self, mut message: Message) -> Option<FeedUpdate> {
        if self.contains(message.id) {
            trace!(id = %message.id, "Duplicate add ignored");
            return None;
        }
        if message.deleted {
            message.text.clear();
        }
        let key = message.order_key();
        let index = self.entries.partition_point(|m| m.order_key() < key);
        self.keys.insert(message.id, key);
        self.entries.insert(index, message.clone());
        Some(FeedUpdate::Added { index, message })
    }

    /// Apply a `modified` delivery in place. Unknown ids are dropped rather
    /// than buffered; they reappear as `added` on the next resubscription.
    pub fn patch(&mut self, mut message: Message) -> Option<FeedUpdate> {
        let Some(key) = self.keys.get(&message.id).copied() else {
            debug!(id = %message.id, "Dropping modification for message not in feed");
            return None;
        };
        let Some(index) = self.index_of(key) else {
            warn!(id = %message.id, "Feed index out of sync, dropping modification");
            return None;
        };

        let held = &mut self.entries[index];
        // Timestamps are immutable and deletion is one-way.
        message.timestamp = held.timestamp;
        if held.deleted {
            message.deleted = true;
            message.text.clear();
        }
        if *held == message {
            return None;
        }
        *held = message.clone();
        Some(FeedUpdate::Updated { message })
    }

    /// Apply one store change. Undecodable documents are dropped.
    pub fn apply_change(&mut self, change: &DocumentChange) -> Option<FeedUpdate> {
        if change.kind == ChangeKind::Removed {
            // A message scrolled out of the tail window; keep showing it.
            return None;
        }
        let message = match change.document.decode::<Message>() {
            Ok(message) => message,
            Err(e) => {
                warn!(id = %change.document.id, "Dropping undecodable message: {}", e);
                return None;
            }
        };
        match change.kind {
            ChangeKind::Added => self.insert(message),
            ChangeKind::Modified => self.patch(message),
            ChangeKind::Removed => None,
        }
    }

    /// Apply a batch in delivery order.
    pub fn apply_changes<'a>(
        &mut self,
        changes: impl IntoIterator<Item = &'a DocumentChange>,
    ) -> Vec<FeedUpdate> {
        changes
            .into_iter()
            .filter_map(|change| self.apply_change(change))
            .collect()
    }

    /// Case-insensitive substring match over author, text and attachment
    /// name. An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        self.entries
            .iter()
            .filter(|m| needle.is_empty() || m.searchable_text().to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }
}
