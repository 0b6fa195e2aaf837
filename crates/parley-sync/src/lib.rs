//! Synchronization core of the chat client.
//!
//! Folds an eventually-consistent document store into an ordered message
//! feed and a presence view, keeps the session's own liveness and typing
//! flags fresh, and applies reaction votes atomically.

pub mod config;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod presence;
pub mod reactions;
pub mod reconciler;
pub mod session;
pub mod window;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use feed::{FeedUpdate, MessageFeed};
pub use heartbeat::HeartbeatScheduler;
pub use presence::{PresenceEngine, PresenceView, typing_indicator};
pub use reactions::{ReactionToggle, ReactionTransactor};
pub use reconciler::Reconciler;
pub use session::{ChatSession, PINNED_LIMIT};
pub use window::{ActivityWindow, is_active};
