//! Record store boundary.
//!
//! The core persists experiments through the generic [`RecordStore`]
//! operations only; all SQL lives in this module. Records are JSON field
//! maps, predicates are column-equality filters.

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection or statement error.
    #[error("database error: {0}")]
    Connection(#[from] rusqlite::Error),

    /// Record not found in storage.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data error.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One stored record as a column → JSON value map.
pub type Record = serde_json::Map<String, Value>;

/// Column-equality predicate for fetch operations.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    clauses: Vec<(String, Value)>,
}

impl Predicate {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches the record with the given id.
    #[must_use]
    pub fn by_id(id: i64) -> Self {
        Self::all().eq("id", Value::from(id))
    }

    /// Adds a `column = value` clause.
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.clauses.push((column.into(), value));
        self
    }

    fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }
}

/// Generic record persistence used by the training core.
///
/// Updates replace the named fields in one statement, so a concurrent reader
/// sees either the old or the new record, never a torn one.
pub trait RecordStore: Send + Sync {
    /// Inserts a record and returns its assigned id.
    fn insert(&self, table: &str, fields: &Record) -> StorageResult<i64>;

    /// Fetches the first record matching the predicate, if any.
    fn fetch_one(&self, table: &str, predicate: &Predicate) -> StorageResult<Option<Record>>;

    /// Fetches all records matching the predicate.
    fn fetch_all(&self, table: &str, predicate: &Predicate) -> StorageResult<Vec<Record>>;

    /// Replaces the named fields of the record with the given id.
    fn update(&self, table: &str, id: i64, fields: &Record) -> StorageResult<()>;
}

/// SQLite-backed record store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the store at the given path.
    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store, used by tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        info!("initializing experiment store schema");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER,
                name TEXT NOT NULL,
                dataset_id INTEGER,
                config TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT,
                completed_at TEXT,
                metrics TEXT,
                message TEXT
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiments_project_id ON experiments(project_id)",
            [],
        )?;
        Ok(())
    }
}

/// Column and table names are spliced into statements, so they must be plain
/// identifiers.
fn check_identifier(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::InvalidData(format!("invalid identifier: {name:?}")))
    }
}

fn to_sql_value(value: &Value) -> StorageResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                return Err(StorageError::InvalidData(format!("unstorable number: {n}")));
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested documents are stored as JSON text columns.
        Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

fn from_sql_value(value: rusqlite::types::ValueRef<'_>) -> StorageResult<Value> {
    use rusqlite::types::ValueRef;
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(
            std::str::from_utf8(bytes)
                .map_err(|e| StorageError::InvalidData(format!("non-utf8 text column: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(_) => {
            return Err(StorageError::InvalidData("blob columns are not supported".to_string()));
        }
    })
}

impl RecordStore for SqliteStore {
    fn insert(&self, table: &str, fields: &Record) -> StorageResult<i64> {
        check_identifier(table)?;
        if fields.is_empty() {
            return Err(StorageError::InvalidData("insert with no fields".to_string()));
        }

        let mut columns = Vec::with_capacity(fields.len());
        let mut placeholders = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len());
        for (column, value) in fields {
            check_identifier(column)?;
            placeholders.push(format!("?{}", params.len() + 1));
            columns.push(column.as_str());
            params.push(to_sql_value(value)?);
        }

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock().unwrap();
        conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_one(&self, table: &str, predicate: &Predicate) -> StorageResult<Option<Record>> {
        let mut records = self.fetch_all(table, predicate)?;
        if records.is_empty() { Ok(None) } else { Ok(Some(records.swap_remove(0))) }
    }

    fn fetch_all(&self, table: &str, predicate: &Predicate) -> StorageResult<Vec<Record>> {
        check_identifier(table)?;

        let mut sql = format!("SELECT * FROM {table}");
        let mut params = Vec::with_capacity(predicate.clauses().len());
        for (i, (column, value)) in predicate.clauses().iter().enumerate() {
            check_identifier(column)?;
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{column} = ?{}", i + 1));
            params.push(to_sql_value(value)?);
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|c| (*c).to_string()).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (idx, column) in column_names.iter().enumerate() {
                record.insert(column.clone(), from_sql_value(row.get_ref(idx)?)?);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn update(&self, table: &str, id: i64, fields: &Record) -> StorageResult<()> {
        check_identifier(table)?;
        if fields.is_empty() {
            return Err(StorageError::InvalidData("update with no fields".to_string()));
        }

        let mut assignments = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len() + 1);
        for (column, value) in fields {
            check_identifier(column)?;
            assignments.push(format!("{column} = ?{}", params.len() + 1));
            params.push(to_sql_value(value)?);
        }
        params.push(SqlValue::Integer(id));
        let sql = format!(
            "UPDATE {table} SET {} WHERE id = ?{}",
            assignments.join(", "),
            params.len()
        );

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("{table} id {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn experiment_fields(name: &str, project_id: Option<i64>) -> Record {
        let mut fields = Record::new();
        fields.insert("name".to_string(), json!(name));
        fields.insert("project_id".to_string(), json!(project_id));
        fields.insert("status".to_string(), json!("running"));
        fields.insert("metrics".to_string(), json!("{}"));
        fields
    }

    #[test]
    fn test_insert_assigns_distinct_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert("experiments", &experiment_fields("a", None)).unwrap();
        let second = store.insert("experiments", &experiment_fields("b", None)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_fetch_one_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert("experiments", &experiment_fields("run1", Some(3))).unwrap();

        let record = store.fetch_one("experiments", &Predicate::by_id(id)).unwrap().unwrap();
        assert_eq!(record["name"], json!("run1"));
        assert_eq!(record["project_id"], json!(3));
        assert_eq!(record["status"], json!("running"));
        assert_eq!(record["completed_at"], Value::Null);
    }

    #[test]
    fn test_fetch_one_absent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.fetch_one("experiments", &Predicate::by_id(999)).unwrap().is_none());
    }

    #[test]
    fn test_fetch_all_with_predicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert("experiments", &experiment_fields("a", Some(1))).unwrap();
        store.insert("experiments", &experiment_fields("b", Some(1))).unwrap();
        store.insert("experiments", &experiment_fields("c", Some(2))).unwrap();

        let all = store.fetch_all("experiments", &Predicate::all()).unwrap();
        assert_eq!(all.len(), 3);

        let project_one = store
            .fetch_all("experiments", &Predicate::all().eq("project_id", json!(1)))
            .unwrap();
        assert_eq!(project_one.len(), 2);
    }

    #[test]
    fn test_update_replaces_named_fields_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert("experiments", &experiment_fields("run1", None)).unwrap();

        let mut fields = Record::new();
        fields.insert("status".to_string(), json!("completed"));
        fields.insert("completed_at".to_string(), json!("2024-01-01T12:00:00+00:00"));
        store.update("experiments", id, &fields).unwrap();

        let record = store.fetch_one("experiments", &Predicate::by_id(id)).unwrap().unwrap();
        assert_eq!(record["status"], json!("completed"));
        assert_eq!(record["completed_at"], json!("2024-01-01T12:00:00+00:00"));
        // Untouched fields survive.
        assert_eq!(record["name"], json!("run1"));
    }

    #[test]
    fn test_update_unknown_id_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut fields = Record::new();
        fields.insert("status".to_string(), json!("failed"));
        assert!(matches!(
            store.update("experiments", 42, &fields),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_nested_documents_stored_as_json_text() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut fields = experiment_fields("run1", None);
        fields.insert("config".to_string(), json!({"name": "run1", "max_steps": 10}));
        let id = store.insert("experiments", &fields).unwrap();

        let record = store.fetch_one("experiments", &Predicate::by_id(id)).unwrap().unwrap();
        let config: Value = serde_json::from_str(record["config"].as_str().unwrap()).unwrap();
        assert_eq!(config["max_steps"], json!(10));
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut fields = Record::new();
        fields.insert("name; DROP TABLE experiments".to_string(), json!("x"));
        assert!(store.insert("experiments", &fields).is_err());
        assert!(store.fetch_all("bad table", &Predicate::all()).is_err());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.db");
        {
            let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
            store.insert("experiments", &experiment_fields("persisted", None)).unwrap();
        }
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        let all = store.fetch_all("experiments", &Predicate::all()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["name"], json!("persisted"));
    }
}
