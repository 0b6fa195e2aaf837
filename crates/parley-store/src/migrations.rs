use rusqlite::Connection;
use tracing::info;

use crate::error::StoreResult;

pub fn run(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            collection  TEXT    NOT NULL,
            id          TEXT    NOT NULL,
            created_at  INTEGER NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1,
            data        TEXT    NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_order
            ON documents(collection, created_at, id);
        ",
    )?;

    info!("Store migrations complete");
    Ok(())
}
