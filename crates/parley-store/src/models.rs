use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Top-level document fields. Merges replace keys one level deep.
pub type Fields = serde_json::Map<String, Value>;

/// Named document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Messages,
    Users,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Users => "users",
        }
    }
}

/// A stored document. `created_at` is server-assigned and immutable;
/// `version` increases by one on every committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub fields: Fields,
}

impl Document {
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    /// Deserialize into a typed record. The document id and creation time
    /// are exposed to the record as `id` and `timestamp`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut map = self.fields.clone();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("timestamp".into(), serde_json::to_value(self.created_at)?);
        serde_json::from_value(Value::Object(map))
    }

    pub fn get_bool(&self, field: &str) -> bool {
        self.fields.get(field).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Build a field map from a JSON object literal. Non-objects yield no fields.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Serialize a record into document fields.
pub fn to_fields<T: Serialize>(record: &T) -> StoreResult<Fields> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Corrupt(format!("expected an object, got {}", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

impl DocumentChange {
    pub fn added(document: Document) -> Self {
        Self { kind: ChangeKind::Added, document }
    }

    pub fn modified(document: Document) -> Self {
        Self { kind: ChangeKind::Modified, document }
    }

    pub fn removed(document: Document) -> Self {
        Self { kind: ChangeKind::Removed, document }
    }
}

/// One delivery from a live query: what changed, and the full result set
/// after applying it.
#[derive(Debug, Clone, Default)]
pub struct QuerySnapshot {
    pub changes: Vec<DocumentChange>,
    pub docs: Vec<Document>,
}

/// Live or one-shot query over a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// The newest `limit` documents, ascending by `(created_at, id)`.
    Tail { collection: Collection, limit: usize },
    /// Documents whose top-level `field` equals `value`.
    FieldEquals {
        collection: Collection,
        field: String,
        value: Value,
    },
}

impl Query {
    pub fn tail(collection: Collection, limit: usize) -> Self {
        Self::Tail { collection, limit }
    }

    pub fn field_equals(collection: Collection, field: impl Into<String>, value: Value) -> Self {
        Self::FieldEquals {
            collection,
            field: field.into(),
            value,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Self::Tail { collection, .. } | Self::FieldEquals { collection, .. } => *collection,
        }
    }

    /// Whether `doc` passes the query's filter, ignoring any limit.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Tail { .. } => true,
            Self::FieldEquals { field, value, .. } => doc.fields.get(field) == Some(value),
        }
    }
}

/// Notification published by the store after every committed write.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub collection: Collection,
    pub kind: ChangeKind,
    pub document: Document,
}

/// Result of `run_atomic`.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicOutcome {
    Committed { attempts: u32, document: Document },
    /// The update function declined to write.
    Skipped,
    NotFound,
}

/// Database row type. Distinct from `Document` so the SQL layer stays
/// independent of JSON parsing.
pub struct DocumentRow {
    pub id: String,
    pub created_at: i64,
    pub version: i64,
    pub data: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> StoreResult<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| StoreError::Corrupt(format!("document id '{}': {}", row.id, e)))?;
        let created_at = DateTime::from_timestamp_micros(row.created_at).ok_or_else(|| {
            StoreError::Corrupt(format!("created_at {} on document {}", row.created_at, row.id))
        })?;
        let fields = match serde_json::from_str::<Value>(&row.data)? {
            Value::Object(map) => map,
            _ => return Err(StoreError::Corrupt(format!("document {} is not an object", row.id))),
        };
        Ok(Self {
            id,
            created_at,
            version: row.version.max(0) as u64,
            fields,
        })
    }
}
