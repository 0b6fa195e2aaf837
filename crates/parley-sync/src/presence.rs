use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_store::{Document, QuerySnapshot, StoreResult};
use parley_types::{ClientEvent, Clock, UserRecord};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::window::ActivityWindow;

/// Derived presence for one users-snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceView {
    pub online_count: usize,
    /// Display names of other users currently typing, in snapshot order.
    pub typing: Vec<String>,
}

impl PresenceView {
    pub fn indicator(&self) -> Option<String> {
        typing_indicator(&self.typing)
    }

    pub fn to_event(&self) -> ClientEvent {
        ClientEvent::PresenceChanged {
            online_count: self.online_count,
            typing: self.typing.clone(),
            indicator: self.indicator(),
        }
    }
}

/// Phrase the typing indicator. `None` hides it.
pub fn typing_indicator(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing...", one)),
        [a, b] => Some(format!("{} and {} are typing...", a, b)),
        _ => Some("Several people are typing...".to_string()),
    }
}

/// Turns snapshots of users flagged online into a headcount and typists.
///
/// The store's `online` flag goes stale when a client dies without signing
/// out, so every record is re-checked against its own timestamps.
pub struct PresenceEngine {
    local_user: Uuid,
    online: ActivityWindow,
    typing: ActivityWindow,
    clock: Arc<dyn Clock>,
    last: Option<PresenceView>,
}

impl PresenceEngine {
    pub fn new(local_user: Uuid, config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_user,
            online: ActivityWindow::new(config.online_window),
            typing: ActivityWindow::new(config.typing_window),
            clock,
            last: None,
        }
    }

    /// Pure evaluation of one snapshot at `now`.
    pub fn evaluate(&self, users: &[UserRecord], now: DateTime<Utc>) -> PresenceView {
        let active: Vec<&UserRecord> = users
            .iter()
            .filter(|u| self.online.is_active(u.last_seen, now))
            .collect();

        let typing = active
            .iter()
            .filter(|u| u.id != self.local_user)
            .filter(|u| u.is_typing && self.typing.is_active(u.last_typing, now))
            .map(|u| u.display_name().to_string())
            .collect();

        PresenceView {
            online_count: active.len(),
            typing,
        }
    }

    /// Fold a delivered snapshot. Returns the view when it differs from the
    /// previous one.
    pub fn apply_snapshot(&mut self, docs: &[Document]) -> Option<PresenceView> {
        let users: Vec<UserRecord> = docs
            .iter()
            .filter_map(|doc| match doc.decode::<UserRecord>() {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(id = %doc.id, "Skipping malformed user record: {}", e);
                    None
                }
            })
            .collect();

        let view = self.evaluate(&users, self.clock.now());
        if self.last.as_ref() == Some(&view) {
            return None;
        }
        debug!(
            online = view.online_count,
            typing = view.typing.len(),
            "Presence changed"
        );
        self.last = Some(view.clone());
        Some(view)
    }

    /// Fold one subscription delivery. A failed delivery is logged and the
    /// previous view stands.
    pub fn apply_delivery(&mut self, delivery: StoreResult<QuerySnapshot>) -> Option<PresenceView> {
        match delivery {
            Ok(snapshot) => self.apply_snapshot(&snapshot.docs),
            Err(e) => {
                warn!("Error listening to presence: {}", e);
                None
            }
        }
    }

    /// Last published view, left untouched when a subscription fails.
    pub fn current(&self) -> Option<&PresenceView> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_types::ManualClock;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn user(name: &str, seen_ago_ms: i64, typing_ago_ms: Option<i64>) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            username: Some(name.to_string()),
            color: None,
            online: true,
            last_seen: Some(now() - Duration::milliseconds(seen_ago_ms)),
            is_typing: typing_ago_ms.is_some(),
            last_typing: typing_ago_ms.map(|ms| now() - Duration::milliseconds(ms)),
        }
    }

    fn engine(local: Uuid) -> PresenceEngine {
        PresenceEngine::new(local, &SyncConfig::default(), Arc::new(ManualClock::new(now())))
    }

    #[test]
    fn test_indicator_phrasing() {
        fn names(v: &[&str]) -> Vec<String> {
            v.iter().map(|s| s.to_string()).collect()
        }
        assert_eq!(typing_indicator(&[]), None);
        assert_eq!(typing_indicator(&names(&["Ann"])).as_deref(), Some("Ann is typing..."));
        assert_eq!(
            typing_indicator(&names(&["Ann", "Bo"])).as_deref(),
            Some("Ann and Bo are typing...")
        );
        assert_eq!(
            typing_indicator(&names(&["Ann", "Bo", "Cy"])).as_deref(),
            Some("Several people are typing...")
        );
    }

    #[test]
    fn test_stale_online_flags_are_not_counted() {
        let users = vec![user("Ann", 1_000, None), user("Bo", 31_000, None), user("Cy", 30_000, None)];
        let view = engine(Uuid::new_v4()).evaluate(&users, now());
        assert_eq!(view.online_count, 2);
    }

    #[test]
    fn test_typing_excludes_self_stale_and_offline() {
        let me = user("Me", 0, Some(0));
        let users = vec![
            me.clone(),
            user("Ann", 0, Some(1_000)),
            user("Bo", 0, Some(5_000)),      // typing flag went stale
            user("Cy", 40_000, Some(1_000)), // not online any more
            user("Di", 0, None),
        ];
        let view = engine(me.id).evaluate(&users, now());
        assert_eq!(view.online_count, 4);
        assert_eq!(view.typing, vec!["Ann".to_string()]);
        assert_eq!(view.indicator().as_deref(), Some("Ann is typing..."));
    }

    #[test]
    fn test_typing_flag_without_timestamp_is_ignored() {
        let mut ann = user("Ann", 0, None);
        ann.is_typing = true;
        let view = engine(Uuid::new_v4()).evaluate(&[ann], now());
        assert!(view.typing.is_empty());
    }

    #[test]
    fn test_apply_snapshot_reports_only_changes() {
        let clock = Arc::new(ManualClock::new(now()));
        let mut engine = PresenceEngine::new(Uuid::new_v4(), &SyncConfig::default(), clock.clone());
        let doc = Document {
            id: Uuid::new_v4(),
            created_at: now(),
            version: 1,
            fields: parley_store::fields(serde_json::json!({
                "username": "Ann",
                "online": true,
                "last_seen": now(),
            })),
        };

        let first = engine.apply_snapshot(std::slice::from_ref(&doc)).unwrap();
        assert_eq!(first.online_count, 1);
        assert!(engine.apply_snapshot(std::slice::from_ref(&doc)).is_none());

        clock.advance(Duration::seconds(31));
        let gone = engine.apply_snapshot(&[doc]).unwrap();
        assert_eq!(gone.online_count, 0);
    }

    #[test]
    fn test_failed_delivery_keeps_last_view() {
        let clock = Arc::new(ManualClock::new(now()));
        let mut engine = PresenceEngine::new(Uuid::new_v4(), &SyncConfig::default(), clock);
        assert!(engine.current().is_none());

        let doc = Document {
            id: Uuid::new_v4(),
            created_at: now(),
            version: 1,
            fields: parley_store::fields(serde_json::json!({
                "username": "Bo",
                "online": true,
                "last_seen": now(),
                "is_typing": true,
                "last_typing": now(),
            })),
        };
        let snapshot = QuerySnapshot {
            changes: Vec::new(),
            docs: vec![doc],
        };
        let view = engine.apply_delivery(Ok(snapshot)).unwrap();
        assert_eq!(view.typing, vec!["Bo".to_string()]);

        let failed = engine.apply_delivery(Err(parley_store::StoreError::LockPoisoned));
        assert!(failed.is_none());
        assert_eq!(engine.current(), Some(&view));
    }
}
