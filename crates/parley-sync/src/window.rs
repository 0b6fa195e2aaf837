use std::time::Duration;

use chrono::{DateTime, Utc};

/// True iff `last_event` happened no more than `window` before `now`.
/// The boundary is inclusive. A missing timestamp is never active.
pub fn is_active(last_event: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(last) = last_event else {
        return false;
    };
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(last) <= window
}

/// A named liveness window, e.g. "online" or "typing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityWindow {
    window: Duration,
}

impl ActivityWindow {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn is_active(&self, last_event: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        is_active(last_event, now, self.window)
    }
}
