//! Identity registry contract and an in-memory implementation.
//!
//! The registry owns identity records. The pipeline only proposes new
//! records and, when refresh-on-verify is enabled, replacement embeddings.

use crate::matcher::{Match, MatchError, SimilarityMatcher};
use crate::types::{Embedding, IdentityRecord};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("storage: {0}")]
    Storage(String),
}

/// Result of an insert-if-absent request.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(IdentityRecord),
    /// An existing identity already matches; nothing was written.
    Duplicate(Match),
}

/// Storage collaborator for identity records.
pub trait IdentityRegistry {
    /// Every record, in insertion order.
    fn list_all(&self) -> Result<Vec<IdentityRecord>, RegistryError>;

    /// Unconditionally create a record under `id`.
    fn create(&self, id: &str, embedding: &Embedding) -> Result<IdentityRecord, RegistryError>;

    /// Scan for a matching identity and, if none matches, create `id`.
    ///
    /// Implementations should run the scan and the insert as one atomic step.
    /// This default lists, matches, then creates: two concurrent calls for the
    /// same unseen face can both pass the scan and both insert. Use it only
    /// for backends with no transactional primitive.
    fn insert_if_absent(
        &self,
        id: &str,
        embedding: &Embedding,
        matcher: &SimilarityMatcher,
    ) -> Result<InsertOutcome, RegistryError> {
        let gallery = self.list_all()?;
        if let Some(m) = matcher.best_match(embedding, &gallery)? {
            return Ok(InsertOutcome::Duplicate(m));
        }
        self.create(id, embedding).map(InsertOutcome::Inserted)
    }

    /// Replace the stored embedding of an existing identity.
    fn update_embedding(&self, id: &str, embedding: &Embedding) -> Result<(), RegistryError>;

    /// Delete an identity. Returns whether it existed.
    fn remove(&self, id: &str) -> Result<bool, RegistryError>;

    fn count(&self) -> Result<usize, RegistryError> {
        Ok(self.list_all()?.len())
    }
}

/// Process-local registry guarded by a mutex.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<Vec<IdentityRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<IdentityRecord>>, RegistryError> {
        self.records
            .lock()
            .map_err(|_| RegistryError::Storage("registry mutex poisoned".into()))
    }

    fn new_record(id: &str, embedding: &Embedding) -> IdentityRecord {
        let now = timestamp();
        IdentityRecord {
            id: id.to_string(),
            embedding: embedding.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl IdentityRegistry for MemoryRegistry {
    fn list_all(&self) -> Result<Vec<IdentityRecord>, RegistryError> {
        Ok(self.lock()?.clone())
    }

    fn create(&self, id: &str, embedding: &Embedding) -> Result<IdentityRecord, RegistryError> {
        let mut records = self.lock()?;
        if records.iter().any(|r| r.id == id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        let record = Self::new_record(id, embedding);
        records.push(record.clone());
        Ok(record)
    }

    /// Holds the lock across scan and insert.
    fn insert_if_absent(
        &self,
        id: &str,
        embedding: &Embedding,
        matcher: &SimilarityMatcher,
    ) -> Result<InsertOutcome, RegistryError> {
        let mut records = self.lock()?;
        if let Some(m) = matcher.best_match(embedding, &records)? {
            return Ok(InsertOutcome::Duplicate(m));
        }
        if records.iter().any(|r| r.id == id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        let record = Self::new_record(id, embedding);
        records.push(record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    fn update_embedding(&self, id: &str, embedding: &Embedding) -> Result<(), RegistryError> {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.embedding = embedding.clone();
        record.updated_at = timestamp();
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn count(&self) -> Result<usize, RegistryError> {
        Ok(self.lock()?.len())
    }
}
