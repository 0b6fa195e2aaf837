use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Notifications the sync core hands to the application shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// A message entered the local feed at `index` (0 is oldest).
    MessageAdded { index: usize, message: Message },

    /// A message already in the feed changed in place.
    MessageUpdated { message: Message },

    /// Online headcount or the set of typists changed.
    PresenceChanged {
        online_count: usize,
        typing: Vec<String>,
        indicator: Option<String>,
    },

    /// One-shot user-facing failure. The shell should keep the input intact.
    Notice { message: String },
}
