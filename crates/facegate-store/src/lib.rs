//! facegate-store: SQLite-backed identity registry.
//!
//! One row per identity. Embeddings are stored as little-endian f32 blobs
//! tagged with the backend that produced them; a registry handle only sees
//! rows of its own backend.

use facegate_core::registry::{IdentityRegistry, InsertOutcome, RegistryError};
use facegate_core::{Backend, Embedding, IdentityRecord, SimilarityMatcher};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    backend     TEXT NOT NULL,
    dim         INTEGER NOT NULL,
    embedding   BLOB NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS identities_backend ON identities(backend);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt embedding for identity {0}")]
    CorruptEmbedding(String),
    #[error("database mutex poisoned")]
    Poisoned,
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::Storage(err.to_string())
    }
}

/// Identity registry persisted in a SQLite database.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    backend: Backend,
}

impl SqliteRegistry {
    /// Open (creating if needed) the database at `path`, scoped to `backend`.
    pub fn open(path: &Path, backend: Backend) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "sqlite journal mode");
        let registry = Self::init(conn, backend)?;
        tracing::info!(path = %path.display(), %backend, "opened identity registry");
        Ok(registry)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory(backend: Backend) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, backend)
    }

    fn init(conn: Connection, backend: Backend) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            backend,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn load(conn: &Connection, backend: Backend) -> Result<Vec<IdentityRecord>, StoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, dim, embedding, created_at, updated_at
             FROM identities WHERE backend = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![backend.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, dim, blob, created_at, updated_at) = row?;
            let embedding = Embedding::from_le_bytes(&blob, backend)
                .filter(|e| e.len() as i64 == dim)
                .ok_or_else(|| StoreError::CorruptEmbedding(id.clone()))?;
            records.push(IdentityRecord {
                id,
                embedding,
                created_at,
                updated_at,
            });
        }
        Ok(records)
    }

    fn insert(
        conn: &Connection,
        id: &str,
        embedding: &Embedding,
    ) -> Result<IdentityRecord, RegistryError> {
        let now = chrono::Utc::now().to_rfc3339();
        let exists = conn
            .query_row("SELECT 1 FROM identities WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map_err(StoreError::from)?
            .is_some();
        if exists {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }

        conn.execute(
            "INSERT INTO identities (id, backend, dim, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                id,
                embedding.backend.as_str(),
                embedding.len() as i64,
                embedding.to_le_bytes(),
                now
            ],
        )
        .map_err(StoreError::from)?;

        Ok(IdentityRecord {
            id: id.to_string(),
            embedding: embedding.clone(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    fn check_backend(&self, embedding: &Embedding) -> Result<(), RegistryError> {
        if embedding.backend != self.backend {
            return Err(RegistryError::Storage(format!(
                "registry holds {} embeddings, refusing {}",
                self.backend, embedding.backend
            )));
        }
        Ok(())
    }
}

impl IdentityRegistry for SqliteRegistry {
    fn list_all(&self) -> Result<Vec<IdentityRecord>, RegistryError> {
        let conn = self.conn()?;
        Ok(Self::load(&conn, self.backend)?)
    }

    fn create(&self, id: &str, embedding: &Embedding) -> Result<IdentityRecord, RegistryError> {
        self.check_backend(embedding)?;
        let conn = self.conn()?;
        Self::insert(&conn, id, embedding)
    }

    /// Scan and insert inside one `BEGIN IMMEDIATE` transaction, so the write
    /// lock is held from the duplicate check to the commit, across processes.
    fn insert_if_absent(
        &self,
        id: &str,
        embedding: &Embedding,
        matcher: &SimilarityMatcher,
    ) -> Result<InsertOutcome, RegistryError> {
        self.check_backend(embedding)?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let gallery = Self::load(&tx, self.backend)?;
        if let Some(m) = matcher.best_match(embedding, &gallery)? {
            // Dropping the transaction rolls it back; nothing was written.
            return Ok(InsertOutcome::Duplicate(m));
        }

        let record = Self::insert(&tx, id, embedding)?;
        tx.commit().map_err(StoreError::from)?;
        tracing::debug!(identity = %record.id, scanned = gallery.len(), "identity inserted");
        Ok(InsertOutcome::Inserted(record))
    }

    fn update_embedding(&self, id: &str, embedding: &Embedding) -> Result<(), RegistryError> {
        self.check_backend(embedding)?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE identities SET dim = ?2, embedding = ?3, updated_at = ?4
                 WHERE id = ?1 AND backend = ?5",
                params![
                    id,
                    embedding.len() as i64,
                    embedding.to_le_bytes(),
                    chrono::Utc::now().to_rfc3339(),
                    self.backend.as_str()
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM identities WHERE id = ?1 AND backend = ?2",
                params![id, self.backend.as_str()],
            )
            .map_err(StoreError::from)?;
        Ok(changed > 0)
    }

    fn count(&self) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM identities WHERE backend = ?1",
                params![self.backend.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::EmbeddingProfile;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn unit(values: &[f32]) -> Embedding {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let mut padded: Vec<f32> = values.iter().map(|v| v / norm).collect();
        padded.resize(512, 0.0);
        Embedding::new(padded, Backend::CanonicalCrop)
    }

    fn matcher() -> SimilarityMatcher {
        SimilarityMatcher::new(EmbeddingProfile::default_for(Backend::CanonicalCrop))
    }

    #[test]
    fn test_insert_and_list_preserves_bits_and_order() {
        let reg = SqliteRegistry::open_in_memory(Backend::CanonicalCrop).unwrap();
        let a = unit(&[1.0, 0.0, 0.0]);
        let b = unit(&[0.0, 0.0, 1.0]);
        reg.create("a", &a).unwrap();
        reg.create("b", &b).unwrap();

        let all = reg.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].embedding, a);
        assert_eq!(all[1].id, "b");
        assert_eq!(all[1].embedding, b);
        assert!(chrono::DateTime::parse_from_rfc3339(&all[0].created_at).is_ok());
    }

    #[test]
    fn test_insert_if_absent_rejects_duplicate_without_writing() {
        let reg = SqliteRegistry::open_in_memory(Backend::CanonicalCrop).unwrap();
        let first = reg.insert_if_absent("a", &unit(&[1.0, 0.0]), &matcher()).unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = reg
            .insert_if_absent("b", &unit(&[1.0, 0.05]), &matcher())
            .unwrap();
        match second {
            InsertOutcome::Duplicate(m) => assert_eq!(m.identity, "a"),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(reg.count().unwrap(), 1);
    }

    #[test]
    fn test_rejects_other_backend() {
        let reg = SqliteRegistry::open_in_memory(Backend::CanonicalCrop).unwrap();
        let landmark = Embedding::new(vec![0.5; 128], Backend::Landmark);
        assert!(matches!(reg.create("x", &landmark), Err(RegistryError::Storage(_))));
    }

    #[test]
    fn test_update_and_remove() {
        let reg = SqliteRegistry::open_in_memory(Backend::CanonicalCrop).unwrap();
        reg.create("a", &unit(&[1.0, 0.0])).unwrap();

        let replacement = unit(&[0.0, 1.0]);
        reg.update_embedding("a", &replacement).unwrap();
        assert_eq!(reg.list_all().unwrap()[0].embedding, replacement);

        assert!(matches!(
            reg.update_embedding("missing", &replacement),
            Err(RegistryError::NotFound(_))
        ));
        assert!(reg.remove("a").unwrap());
        assert!(!reg.remove("a").unwrap());
        assert_eq!(reg.count().unwrap(), 0);
    }

    #[test]
    fn test_backends_are_isolated_in_one_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.db");

        let canonical = SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();
        canonical.create("c", &unit(&[1.0])).unwrap();

        let landmark = SqliteRegistry::open(&path, Backend::Landmark).unwrap();
        landmark
            .create("l", &Embedding::new(vec![0.2; 128], Backend::Landmark))
            .unwrap();

        assert_eq!(canonical.list_all().unwrap().len(), 1);
        assert_eq!(landmark.list_all().unwrap()[0].id, "l");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/faces.db");
        {
            let reg = SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();
            reg.create("kept", &unit(&[0.3, 0.4])).unwrap();
        }
        let reg = SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();
        assert_eq!(reg.list_all().unwrap()[0].id, "kept");
    }

    #[test]
    fn test_concurrent_handles_enroll_same_face_once() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("faces.db"));
        SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    // Separate connections, as separate processes would have.
                    let reg = SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();
                    let id = uuid::Uuid::new_v4().to_string();
                    reg.insert_if_absent(&id, &unit(&[0.6, 0.8]), &matcher()).unwrap()
                })
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, InsertOutcome::Inserted(_)))
            .count();
        assert_eq!(inserted, 1);

        let reg = SqliteRegistry::open(&path, Backend::CanonicalCrop).unwrap();
        assert_eq!(reg.count().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_blob_is_reported() {
        let reg = SqliteRegistry::open_in_memory(Backend::CanonicalCrop).unwrap();
        reg.conn()
            .unwrap()
            .execute(
                "INSERT INTO identities VALUES ('bad', 'canonical-crop', 512, x'0102', 't', 't')",
                [],
            )
            .unwrap();
        assert!(matches!(reg.list_all(), Err(RegistryError::Storage(_))));
    }
}
