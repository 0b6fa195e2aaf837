use parley_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures the sync core reports to the shell.
///
/// Writes aimed at messages or users that no longer exist are not errors;
/// they resolve to "nothing happened" values instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity or storage failure. The operation was abandoned and
    /// local state was left as it was.
    #[error("store unavailable: {0}")]
    Transient(#[from] StoreError),

    /// A user action failed in a way the user should be told about.
    #[error("failed to {action}: {source}")]
    UserFacing {
        action: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The session's sync loop has already shut down.
    #[error("session closed")]
    Closed,
}
