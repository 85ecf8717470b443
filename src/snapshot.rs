//! Point-in-time aggregate snapshots.
//!
//! A snapshot is an opaque blob plus the stream version it was taken at.
//! The replay subsystem uses it as a starting point and applies only events
//! with a greater version, short-circuiting full history replays.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A persisted aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// The aggregate instance this snapshot belongs to.
    pub aggregate_id: String,
    /// Stream version at snapshot time; replay resumes after it.
    pub version: u64,
    /// Opaque encoded aggregate state.
    pub payload: Vec<u8>,
}

/// Keyed store for aggregate snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot, replacing any previous one for the aggregate.
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<(), StorageError>;

    /// Load the snapshot for an aggregate, if one exists.
    async fn load(&self, aggregate_id: &str) -> Result<Option<AggregateSnapshot>, StorageError>;

    /// Delete the snapshot for an aggregate. Idempotent.
    async fn remove(&self, aggregate_id: &str) -> Result<(), StorageError>;
}

/// In-memory snapshot store for tests and embedded deployments.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, AggregateSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .expect("snapshot lock poisoned")
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> Result<Option<AggregateSnapshot>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .expect("snapshot lock poisoned")
            .get(aggregate_id)
            .cloned())
    }

    async fn remove(&self, aggregate_id: &str) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .expect("snapshot lock poisoned")
            .remove(aggregate_id);
        Ok(())
    }
}
