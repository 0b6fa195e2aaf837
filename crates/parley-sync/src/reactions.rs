use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_store::{AtomicOutcome, Collection, Document, DocumentStore, Fields};
use parley_types::ReactionState;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Outcome of a reaction toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
    /// The message is gone or unreadable; nothing was written.
    NoTarget,
}

/// Read the reaction fields of a message document.
pub fn reaction_state(doc: &Document) -> Result<ReactionState, serde_json::Error> {
    let mut subset = Fields::new();
    for key in ["reaction_maps", "reactions"] {
        if let Some(value) = doc.fields.get(key) {
            subset.insert(key.to_string(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(subset))
}

/// Performs conflict-safe reaction toggles.
///
/// The voter sets and the derived counts are written together in one atomic
/// commit, so the two never diverge.
pub struct ReactionTransactor {
    store: Arc<dyn DocumentStore>,
}

impl ReactionTransactor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn toggle(&self, message_id: Uuid, emoji: &str, user_id: Uuid) -> SyncResult<ReactionToggle> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(SyncError::InvalidInput("emoji must not be empty"));
        }

        // The update closure may run several times; the last run is the one
        // that committed.
        let added = AtomicBool::new(false);
        let update = |doc: &Document| -> Option<Fields> {
            let mut state = match reaction_state(doc) {
                Ok(state) => state,
                Err(e) => {
                    warn!(id = %doc.id, "Unreadable reactions on message: {}", e);
                    return None;
                }
            };
            added.store(state.toggle(emoji, user_id), Ordering::Relaxed);

            let mut fields = Fields::new();
            fields.insert("reaction_maps".into(), serde_json::to_value(&state.voters).ok()?);
            fields.insert("reactions".into(), serde_json::to_value(&state.counts).ok()?);
            Some(fields)
        };

        match self.store.run_atomic(Collection::Messages, message_id, &update).await? {
            AtomicOutcome::Committed { attempts, .. } => {
                let outcome = if added.load(Ordering::Relaxed) {
                    ReactionToggle::Added
                } else {
                    ReactionToggle::Removed
                };
                debug!(%message_id, emoji, attempts, ?outcome, "Reaction toggled");
                Ok(outcome)
            }
            AtomicOutcome::NotFound | AtomicOutcome::Skipped => {
                debug!(%message_id, emoji, "Reaction target missing, nothing to do");
                Ok(ReactionToggle::NoTarget)
            }
        }
    }
}
