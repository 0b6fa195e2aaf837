use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt document: {0}")]
    Corrupt(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("transaction gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
