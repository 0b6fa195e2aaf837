use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reactions offered as one-tap buttons under every message.
pub const QUICK_REACTIONS: [&str; 4] = ["👍", "❤️", "😂", "🎉"];

/// Fallback display name for user records that never set one.
pub const UNKNOWN_USER_NAME: &str = "Someone";

// -- Messages --

/// A message as the store holds it once it has an id and a server timestamp.
///
/// `timestamp` is assigned exactly once by the store and is the only sort key.
/// `deleted` is a one-way tombstone: once set the text stays cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_color: String,
    #[serde(default)]
    pub text: String,
    /// Not validated: the target may have scrolled out or never existed.
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(flatten)]
    pub reactions: ReactionState,
}

impl Message {
    /// Sort key used by every ordered view of the feed.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.timestamp, self.id)
    }

    /// Text a search filter matches against.
    pub fn searchable_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.author_name);
        out.push(' ');
        out.push_str(&self.text);
        if let Some(name) = self.attachment.as_ref().and_then(|a| a.name.as_deref()) {
            out.push(' ');
            out.push_str(name);
        }
        out
    }

    /// Short label for the pinned bar.
    pub fn preview(&self, max_chars: usize) -> String {
        let source = if !self.text.is_empty() {
            self.text.as_str()
        } else if let Some(name) = self.attachment.as_ref().and_then(|a| a.name.as_deref()) {
            name
        } else {
            "Pinned"
        };
        source.chars().take(max_chars).collect()
    }
}

/// A message the client has composed but the store has not yet accepted.
/// It has no id and no timestamp until `append` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub author_id: Uuid,
    pub author_name: String,
    pub author_color: String,
    pub text: String,
    pub reply_to: Option<Uuid>,
    pub deleted: bool,
    pub pinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

// -- Attachments --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    /// Classify an upload by its MIME type.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, url: impl Into<String>, name: Option<String>) -> Self {
        let ext = name
            .as_deref()
            .and_then(|n| n.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty());
        Self {
            kind,
            url: url.into(),
            name,
            ext,
        }
    }
}

// -- Reactions --

/// Per-message reaction state.
///
/// `voters` is the source of truth. `counts` is a denormalized copy kept for
/// cheap rendering and must equal the voter set sizes after every toggle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionState {
    #[serde(rename = "reaction_maps", default)]
    pub voters: BTreeMap<String, BTreeSet<Uuid>>,
    #[serde(rename = "reactions", default)]
    pub counts: BTreeMap<String, u64>,
}

impl ReactionState {
    /// Flip `user_id`'s vote for `emoji`. Returns true if the vote was added.
    pub fn toggle(&mut self, emoji: &str, user_id: Uuid) -> bool {
        let voters = self.voters.entry(emoji.to_string()).or_default();
        let added = if voters.remove(&user_id) {
            false
        } else {
            voters.insert(user_id);
            true
        };
        if voters.is_empty() {
            self.voters.remove(emoji);
        }
        self.sync_counts();
        added
    }

    /// Rebuild `counts` from `voters`. Empty emoji entries are dropped.
    pub fn sync_counts(&mut self) {
        self.voters.retain(|_, set| !set.is_empty());
        self.counts = self
            .voters
            .iter()
            .map(|(emoji, set)| (emoji.clone(), set.len() as u64))
            .collect();
    }

    pub fn count(&self, emoji: &str) -> u64 {
        self.counts.get(emoji).copied().unwrap_or(0)
    }

    pub fn has_voted(&self, emoji: &str, user_id: Uuid) -> bool {
        self.voters.get(emoji).is_some_and(|set| set.contains(&user_id))
    }

    /// True when every count matches its voter set.
    pub fn is_consistent(&self) -> bool {
        let voted = self.voters.iter().filter(|(_, set)| !set.is_empty());
        let counted = self.counts.iter().filter(|(_, n)| **n > 0);
        voted.clone().count() == counted.count()
            && voted.into_iter().all(|(emoji, set)| self.count(emoji) == set.len() as u64)
    }
}

// -- Users --

/// A user's presence document. The `online` flag is advisory; liveness is
/// decided from `last_seen` against the online window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub last_typing: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_USER_NAME)
    }
}
