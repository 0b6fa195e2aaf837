use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::Database;
use crate::error::StoreResult;
use crate::models::{ChangeKind, Collection, Document, DocumentRow, Fields};

const SELECT_COLUMNS: &str = "id, created_at, version, data";

impl Database {
    /// Insert a new document with a store-assigned id and timestamp.
    /// Timestamps strictly increase within a collection, even if the clock
    /// steps back.
    pub fn insert_document(&self, collection: Collection, fields: &Fields) -> StoreResult<Document> {
        let id = Uuid::new_v4();
        let now = self.clock.now().timestamp_micros();
        let data = serde_json::to_string(fields)?;

        self.with_conn(|conn| {
            let latest: Option<i64> = conn.query_row(
                "SELECT MAX(created_at) FROM documents WHERE collection = ?1",
                [collection.as_str()],
                |row| row.get(0),
            )?;
            let created_at = latest.map_or(now, |l| now.max(l + 1));

            conn.execute(
                "INSERT INTO documents (collection, id, created_at, version, data) VALUES (?1, ?2, ?3, 1, ?4)",
                params![collection.as_str(), id.to_string(), created_at, data],
            )?;

            Document::try_from(DocumentRow {
                id: id.to_string(),
                created_at,
                version: 1,
                data,
            })
        })
    }

    pub fn get_document(&self, collection: Collection, id: Uuid) -> StoreResult<Option<Document>> {
        self.with_conn(|conn| query_document(conn, collection, id))
    }

    /// The newest `limit` documents of a collection, oldest first.
    pub fn tail_documents(&self, collection: Collection, limit: usize) -> StoreResult<Vec<Document>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {cols} FROM (
                    SELECT {cols} FROM documents
                    WHERE collection = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?2
                 ) ORDER BY created_at ASC, id ASC",
                cols = SELECT_COLUMNS
            );
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            query_rows(conn, &sql, params![collection.as_str(), limit])
        })
    }

    /// Every document of a collection, oldest first.
    pub fn collection_documents(&self, collection: Collection) -> StoreResult<Vec<Document>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM documents WHERE collection = ?1 ORDER BY created_at ASC, id ASC",
                SELECT_COLUMNS
            );
            query_rows(conn, &sql, params![collection.as_str()])
        })
    }

    /// Upsert: merge `fields` into the document, creating it if absent.
    pub fn merge_document(
        &self,
        collection: Collection,
        id: Uuid,
        fields: &Fields,
    ) -> StoreResult<(ChangeKind, Document)> {
        let now = self.clock.now().timestamp_micros();
        self.with_conn(|conn| match query_document(conn, collection, id)? {
            Some(existing) => {
                let doc = write_merged(conn, collection, existing, fields)?;
                Ok((ChangeKind::Modified, doc))
            }
            None => {
                let data = serde_json::to_string(fields)?;
                conn.execute(
                    "INSERT INTO documents (collection, id, created_at, version, data) VALUES (?1, ?2, ?3, 1, ?4)",
                    params![collection.as_str(), id.to_string(), now, data],
                )?;
                let doc = Document::try_from(DocumentRow {
                    id: id.to_string(),
                    created_at: now,
                    version: 1,
                    data,
                })?;
                Ok((ChangeKind::Added, doc))
            }
        })
    }

    /// Merge `fields` into an existing document. `None` if it does not exist.
    pub fn update_document(
        &self,
        collection: Collection,
        id: Uuid,
        fields: &Fields,
    ) -> StoreResult<Option<Document>> {
        self.with_conn(|conn| match query_document(conn, collection, id)? {
            Some(existing) => write_merged(conn, collection, existing, fields).map(Some),
            None => Ok(None),
        })
    }

    /// Merge `fields` only if the stored version is still `expected_version`.
    /// `Ok(None)` means someone else committed first.
    pub fn compare_and_merge(
        &self,
        collection: Collection,
        id: Uuid,
        expected_version: u64,
        fields: &Fields,
    ) -> StoreResult<Option<Document>> {
        self.with_conn(|conn| match query_document(conn, collection, id)? {
            Some(existing) if existing.version == expected_version => {
                write_merged(conn, collection, existing, fields).map(Some)
            }
            _ => Ok(None),
        })
    }
}

fn write_merged(
    conn: &Connection,
    collection: Collection,
    mut doc: Document,
    fields: &Fields,
) -> StoreResult<Document> {
    for (key, value) in fields {
        doc.fields.insert(key.clone(), value.clone());
    }
    doc.version += 1;
    let data = serde_json::to_string(&doc.fields)?;
    conn.execute(
        "UPDATE documents SET data = ?1, version = ?2 WHERE collection = ?3 AND id = ?4",
        params![data, doc.version as i64, collection.as_str(), doc.id.to_string()],
    )?;
    Ok(doc)
}

fn query_document(conn: &Connection, collection: Collection, id: Uuid) -> StoreResult<Option<Document>> {
    let sql = format!(
        "SELECT {} FROM documents WHERE collection = ?1 AND id = ?2",
        SELECT_COLUMNS
    );
    let mut rows = query_rows(conn, &sql, params![collection.as_str(), id.to_string()])?;
    Ok(rows.pop())
}

fn query_rows(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(DocumentRow {
                id: row.get(0)?,
                created_at: row.get(1)?,
                version: row.get(2)?,
                data: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(Document::try_from).collect()
}
