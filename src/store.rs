use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

/// Prefix of every per-problem document key
pub const KEY_PREFIX: &str = "timebox:";

pub const LANGUAGE_KEY: &str = "language";
pub const CODE_KEY: &str = "code";
pub const START_KEY: &str = "start";
pub const TRANSCRIPT_KEY: &str = "transcript";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed session document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to create storage directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("key path must have at least one segment")]
    EmptyPath,
}

/// Durable string storage keyed by document name
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, document: &str) -> Result<(), StoreError>;
}

/// Sqlite-backed storage, one row per problem document
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database file and its table
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session_documents (
                key TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let document = conn
            .query_row(
                "SELECT document FROM session_documents WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(document)
    }

    fn write(&self, key: &str, document: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            r#"
            INSERT INTO session_documents (key, document, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
            params![key, document, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Volatile storage; also the fallback when the database cannot be opened
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(key).cloned())
    }

    fn write(&self, key: &str, document: &str) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.insert(key.to_string(), document.to_string());
        Ok(())
    }
}

/// Nested JSON document for one problem, addressed by ordered key paths.
///
/// Every `save` re-reads and re-writes the whole document, so several handles
/// to the same problem never hold stale copies. Failures are logged and
/// swallowed: editing must keep working when storage does not.
#[derive(Clone)]
pub struct ProblemStore {
    backend: Arc<dyn StorageBackend>,
    root: String,
}

impl std::fmt::Debug for ProblemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ProblemStore {
    pub fn new(backend: Arc<dyn StorageBackend>, problem_id: &str) -> Self {
        Self {
            backend,
            root: format!("{KEY_PREFIX}{problem_id}"),
        }
    }

    pub fn in_memory(problem_id: &str) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), problem_id)
    }

    pub fn root_key(&self) -> &str {
        &self.root
    }

    /// Persist `value` at `path`, creating missing intermediate mappings
    pub fn save<V: Serialize + ?Sized>(&self, path: &[&str], value: &V) {
        if let Err(err) = self.try_save(path, value) {
            warn!(key = %self.root, ?path, %err, "failed to persist session field");
        }
    }

    pub fn try_save<V: Serialize + ?Sized>(
        &self,
        path: &[&str],
        value: &V,
    ) -> Result<(), StoreError> {
        let (last, parents) = path.split_last().ok_or(StoreError::EmptyPath)?;
        let value = serde_json::to_value(value)?;
        let mut document = self.load_or_empty();

        let mut node = &mut document;
        for segment in parents {
            node = as_object(node)
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        as_object(node).insert(last.to_string(), value);

        self.backend.write(&self.root, &serde_json::to_string(&document)?)
    }

    /// Read the value at `path`; missing segments and bad data read as `None`
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Option<T> {
        if path.is_empty() {
            return None;
        }
        let document = match self.load() {
            Ok(document) => document,
            Err(err) => {
                warn!(key = %self.root, %err, "failed to read session document");
                return None;
            }
        };

        let mut node = &document;
        for segment in path {
            node = node.get(*segment)?;
        }

        match serde_json::from_value(node.clone()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %self.root, ?path, %err, "ignoring unreadable session field");
                None
            }
        }
    }

    /// Delete the sub-tree at `path`; a missing path is not an error
    pub fn remove(&self, path: &[&str]) {
        let Some((last, parents)) = path.split_last() else {
            warn!(key = %self.root, "refusing to remove with an empty key path");
            return;
        };
        let mut document = self.load_or_empty();

        let mut node = &mut document;
        for segment in parents {
            match node.get_mut(*segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        let removed = node
            .as_object_mut()
            .and_then(|map| map.remove(*last))
            .is_some();

        if removed {
            let written = serde_json::to_string(&document)
                .map_err(StoreError::from)
                .and_then(|text| self.backend.write(&self.root, &text));
            if let Err(err) = written {
                warn!(key = %self.root, ?path, %err, "failed to remove session field");
            }
        }
    }

    fn load(&self) -> Result<Value, StoreError> {
        match self.backend.read(&self.root)? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(Value::Object(Map::new())),
        }
    }

    fn load_or_empty(&self) -> Value {
        self.load().unwrap_or_else(|err| {
            warn!(key = %self.root, %err, "starting a fresh session document");
            Value::Object(Map::new())
        })
    }
}

fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was replaced with an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }

        fn write(&self, _key: &str, _document: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("quota exceeded")))
        }
    }

    #[test]
    fn save_creates_intermediate_mappings() {
        let store = ProblemStore::in_memory("dna");
        store.save(&[CODE_KEY, "python"], "print(1)");

        assert_eq!(
            store.get::<String>(&[CODE_KEY, "python"]),
            Some("print(1)".to_string())
        );
        assert!(store.get::<String>(&[CODE_KEY, "javascript"]).is_none());
    }

    #[test]
    fn get_missing_segments_is_none() {
        let store = ProblemStore::in_memory("dna");
        assert!(store.get::<String>(&["no", "such", "path"]).is_none());
        assert!(store.get::<String>(&[]).is_none());
    }

    #[test]
    fn get_with_wrong_type_is_none() {
        let store = ProblemStore::in_memory("dna");
        store.save(&[START_KEY], &42);
        assert!(store.get::<chrono::DateTime<chrono::Utc>>(&[START_KEY]).is_none());
    }

    #[test]
    fn saving_through_a_scalar_replaces_it() {
        let store = ProblemStore::in_memory("dna");
        store.save(&[CODE_KEY], "oops");
        store.save(&[CODE_KEY, "python"], "x = 1");
        assert_eq!(
            store.get::<String>(&[CODE_KEY, "python"]).as_deref(),
            Some("x = 1")
        );
    }

    #[test]
    fn remove_deletes_only_the_subtree() {
        let store = ProblemStore::in_memory("dna");
        store.save(&[CODE_KEY, "python"], "a");
        store.save(&[LANGUAGE_KEY], "python");
        store.remove(&[CODE_KEY]);
        store.remove(&["missing", "path"]);

        assert!(store.get::<String>(&[CODE_KEY, "python"]).is_none());
        assert_eq!(store.get::<String>(&[LANGUAGE_KEY]).as_deref(), Some("python"));
    }

    #[test]
    fn problems_are_namespaced() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let dna = ProblemStore::new(backend.clone(), "dna");
        let rna = ProblemStore::new(backend, "rna");
        dna.save(&[LANGUAGE_KEY], "javascript");

        assert_eq!(dna.root_key(), "timebox:dna");
        assert!(rna.get::<String>(&[LANGUAGE_KEY]).is_none());
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let store = ProblemStore::new(Arc::new(BrokenBackend), "dna");
        store.save(&[LANGUAGE_KEY], "python");
        store.remove(&[LANGUAGE_KEY]);
        assert!(store.get::<String>(&[LANGUAGE_KEY]).is_none());
        assert!(store.try_save(&[LANGUAGE_KEY], "python").is_err());
    }

    #[test]
    fn empty_path_is_rejected() {
        let store = ProblemStore::in_memory("dna");
        assert!(matches!(
            store.try_save(&[], "x"),
            Err(StoreError::EmptyPath)
        ));
    }

    #[test]
    fn corrupt_document_reads_as_empty() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("timebox:dna", "{not json").unwrap();
        let store = ProblemStore::new(backend, "dna");

        assert!(store.get::<String>(&[LANGUAGE_KEY]).is_none());
        store.save(&[LANGUAGE_KEY], "python");
        assert_eq!(store.get::<String>(&[LANGUAGE_KEY]).as_deref(), Some("python"));
    }

    #[test]
    fn sqlite_backend_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");

        {
            let store = ProblemStore::new(Arc::new(SqliteBackend::open(&path).unwrap()), "dna");
            store.save(&[CODE_KEY, "javascript"], "console.log(1)");
        }

        let store = ProblemStore::new(Arc::new(SqliteBackend::open(&path).unwrap()), "dna");
        assert_eq!(
            store.get::<String>(&[CODE_KEY, "javascript"]).as_deref(),
            Some("console.log(1)")
        );
    }

    #[test]
    fn sqlite_upsert_overwrites() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.write("k", "1").unwrap();
        backend.write("k", "2").unwrap();
        assert_eq!(backend.read("k").unwrap().as_deref(), Some("2"));
        assert_eq!(backend.read("other").unwrap(), None);
    }
}
