//! Durable saga storage: the stored row and the store contract.
//!
//! The row mirrors the persisted layout: `(id_value, id_class, status,
//! payload, created_at, expire_date, closed_at)` with the primary key
//! `(id_value, id_class)`. The payload is an opaque, versioned blob owned
//! by the provider; stores never look inside it.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::saga::{SagaId, SagaStatus};

/// The persisted form of a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSaga {
    pub id: SagaId,
    pub status: SagaStatus,
    /// Opaque encoded snapshot of the saga instance.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Keyed store for saga rows.
///
/// Error vocabulary is restricted to [`StorageError`]; transient variants
/// (`ConnectionFailed`, `InteractionFailed`) are retried by the provider.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert a new row.
    ///
    /// # Errors
    ///
    /// [`StorageError::UniqueConstraintViolation`] if the key already exists.
    async fn save(&self, stored: StoredSaga) -> Result<(), StorageError>;

    /// Update an existing row by key.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no row matched.
    async fn update(&self, stored: StoredSaga) -> Result<(), StorageError>;

    /// Load a row by key.
    async fn load(&self, id: &SagaId) -> Result<Option<StoredSaga>, StorageError>;

    /// Delete a row by key. Idempotent.
    async fn remove(&self, id: &SagaId) -> Result<(), StorageError>;
}

type RowKey = (String, String);

fn row_key(id: &SagaId) -> RowKey {
    (id.value().to_string(), id.saga_type().to_string())
}

/// In-memory saga store for tests and embedded deployments.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    rows: RwLock<HashMap<RowKey, StoredSaga>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, stored: StoredSaga) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("store lock poisoned");
        let key = row_key(&stored.id);
        if rows.contains_key(&key) {
            return Err(StorageError::UniqueConstraintViolation);
        }
        rows.insert(key, stored);
        Ok(())
    }

    async fn update(&self, stored: StoredSaga) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("store lock poisoned");
        let key = row_key(&stored.id);
        match rows.get_mut(&key) {
            Some(row) => {
                *row = stored;
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn load(&self, id: &SagaId) -> Result<Option<StoredSaga>, StorageError> {
        let rows = self.rows.read().expect("store lock poisoned");
        Ok(rows.get(&row_key(id)).cloned())
    }

    async fn remove(&self, id: &SagaId) -> Result<(), StorageError> {
        let mut rows = self.rows.write().expect("store lock poisoned");
        rows.remove(&row_key(id));
        Ok(())
    }
}
