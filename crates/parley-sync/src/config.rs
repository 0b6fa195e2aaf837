use std::time::Duration;

use tracing::warn;

/// Tunables for the sync core. Defaults match the production client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// A user counts as online if seen within this window.
    pub online_window: Duration,
    /// A user counts as typing if their typing flag was refreshed within this window.
    pub typing_window: Duration,
    /// Period of the liveness ping while a session is active.
    pub heartbeat_interval: Duration,
    /// Keystroke silence after which typing is considered stopped.
    pub typing_idle: Duration,
    /// Initial tail size of the message subscription, and the default growth step.
    pub page_size: usize,
    /// Depth of the bounded delivery queue between store and reconciler.
    pub queue_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            online_window: Duration::from_millis(30_000),
            typing_window: Duration::from_millis(4_000),
            heartbeat_interval: Duration::from_millis(10_000),
            typing_idle: Duration::from_millis(1_000),
            page_size: 50,
            queue_depth: 256,
        }
    }
}

impl SyncConfig {
    /// Read overrides from `PARLEY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };

        Self {
            online_window: millis("PARLEY_ONLINE_WINDOW_MS", defaults.online_window),
            typing_window: millis("PARLEY_TYPING_WINDOW_MS", defaults.typing_window),
            heartbeat_interval: millis("PARLEY_HEARTBEAT_MS", defaults.heartbeat_interval),
            typing_idle: millis("PARLEY_TYPING_IDLE_MS", defaults.typing_idle),
            page_size: parse_or(&lookup, "PARLEY_PAGE_SIZE", defaults.page_size as u64)
                .map_or(defaults.page_size, |v| v as usize),
            queue_depth: parse_or(&lookup, "PARLEY_QUEUE_DEPTH", defaults.queue_depth as u64)
                .map_or(defaults.queue_depth, |v| v as usize),
        }
    }
}

/// Parse a positive integer override, falling back to `default` when unset
/// and to `None` (caller's default) when unparsable or zero.
fn parse_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Option<u64> {
    let Some(raw) = lookup(key) else {
        return Some(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
