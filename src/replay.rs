//! Aggregate replay: reconstituting state from a persisted event stream,
//! fast-forwarded through snapshots.
//!
//! [`AggregateReplay`] loads the latest snapshot (if any), folds only the
//! events with a greater version, and optionally writes a refreshed
//! snapshot back so the next load starts further along.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, StorageError};
use crate::snapshot::{AggregateSnapshot, SnapshotStore};

/// Current snapshot payload encoding version.
const SNAPSHOT_BLOB_VERSION: u32 = 1;

/// Refresh the snapshot after folding this many new events, by default.
const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// An aggregate whose state is a fold over its event history.
///
/// `apply` must be pure and total; it takes ownership of the current state
/// and returns the next one.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies the aggregate type (e.g. `"order"`).
    const AGGREGATE_TYPE: &'static str;

    /// The events this aggregate folds.
    type Event: DeserializeOwned + Send + Sync;

    /// Apply one event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// One persisted event of an aggregate stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub aggregate_id: String,
    /// Monotonic position within the aggregate's stream, starting at 1.
    pub version: u64,
    /// Encoded domain event.
    pub payload: Vec<u8>,
}

/// Read access to persisted aggregate events.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Events of `aggregate_id` with version greater than `after_version`,
    /// ascending.
    async fn read_after(
        &self,
        aggregate_id: &str,
        after_version: u64,
    ) -> Result<Vec<PersistedEvent>, StorageError>;
}

/// Versioned envelope around a serialized aggregate state.
#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    version: u32,
    state: serde_json::Value,
}

/// Reconstitutes aggregates from events, fast-forwarded via snapshots.
pub struct AggregateReplay {
    events: Arc<dyn EventStream>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_every: u64,
}

impl AggregateReplay {
    pub fn new(events: Arc<dyn EventStream>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            events,
            snapshots,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
        }
    }

    /// Refresh the snapshot whenever a load folds at least `every` new
    /// events. Zero disables write-back.
    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    /// Load an aggregate: snapshot fast-forward plus event fold.
    ///
    /// Returns the state and the stream version it reflects (0 for an
    /// empty stream without snapshot).
    pub async fn load<A: Aggregate>(&self, aggregate_id: &str) -> Result<(A, u64), ReplayError> {
        let (mut state, mut version) = match self.snapshots.load(aggregate_id).await? {
            Some(snapshot) => decode_snapshot::<A>(&snapshot)?,
            None => (A::default(), 0),
        };

        let events = self.events.read_after(aggregate_id, version).await?;
        let folded = events.len() as u64;
        for event in &events {
            let domain: A::Event =
                serde_json::from_slice(&event.payload).map_err(ReplayError::Decode)?;
            state = state.apply(&domain);
            version = event.version;
        }

        if self.snapshot_every > 0 && folded >= self.snapshot_every {
            let snapshot = encode_snapshot(aggregate_id, version, &state)?;
            self.snapshots.save(snapshot).await?;
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id,
                version,
                folded,
                "snapshot refreshed"
            );
        }

        Ok((state, version))
    }

    /// Drop the stored snapshot; the next load replays from scratch.
    pub async fn invalidate_snapshot(&self, aggregate_id: &str) -> Result<(), ReplayError> {
        self.snapshots.remove(aggregate_id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for AggregateReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateReplay")
            .field("snapshot_every", &self.snapshot_every)
            .finish()
    }
}

fn encode_snapshot<A: Aggregate>(
    aggregate_id: &str,
    version: u64,
    state: &A,
) -> Result<AggregateSnapshot, ReplayError> {
    let blob = SnapshotBlob {
        version: SNAPSHOT_BLOB_VERSION,
        state: serde_json::to_value(state).map_err(ReplayError::Decode)?,
    };
    Ok(AggregateSnapshot {
        aggregate_id: aggregate_id.to_string(),
        version,
        payload: serde_json::to_vec(&blob).map_err(ReplayError::Decode)?,
    })
}

fn decode_snapshot<A: Aggregate>(snapshot: &AggregateSnapshot) -> Result<(A, u64), ReplayError> {
    let blob: SnapshotBlob =
        serde_json::from_slice(&snapshot.payload).map_err(ReplayError::Decode)?;
    if blob.version != SNAPSHOT_BLOB_VERSION {
        return Err(ReplayError::UnknownVersion {
            found: blob.version,
            supported: SNAPSHOT_BLOB_VERSION,
        });
    }
    let state = serde_json::from_value(blob.state).map_err(ReplayError::Decode)?;
    Ok((state, snapshot.version))
}

/// In-memory event stream for tests and embedded deployments.
///
/// Events are expected to be appended in ascending version order per
/// aggregate.
#[derive(Debug, Default)]
pub struct InMemoryEventStream {
    streams: RwLock<HashMap<String, Vec<PersistedEvent>>>,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event to its aggregate's stream.
    pub fn append(&self, event: PersistedEvent) {
        self.streams
            .write()
            .expect("stream lock poisoned")
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn read_after(
        &self,
        aggregate_id: &str,
        after_version: u64,
    ) -> Result<Vec<PersistedEvent>, StorageError> {
        let streams = self.streams.read().expect("stream lock poisoned");
        Ok(streams
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InMemorySnapshotStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Ledger fixture: folds credit events into a running total.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: i64,
    }

    impl Aggregate for Ledger {
        const AGGREGATE_TYPE: &'static str = "ledger";

        type Event = Credited;

        fn apply(mut self, event: &Credited) -> Self {
            self.total += event.amount;
            self
        }
    }

    /// Decorator recording the `after_version` each read starts from.
    #[derive(Default)]
    struct RecordingStream {
        inner: InMemoryEventStream,
        last_read_after: AtomicU64,
    }

    #[async_trait]
    impl EventStream for RecordingStream {
        async fn read_after(
            &self,
            aggregate_id: &str,
            after_version: u64,
        ) -> Result<Vec<PersistedEvent>, StorageError> {
            self.last_read_after.store(after_version, Ordering::SeqCst);
            self.inner.read_after(aggregate_id, after_version).await
        }
    }

    fn credited(aggregate_id: &str, version: u64, amount: i64) -> PersistedEvent {
        PersistedEvent {
            aggregate_id: aggregate_id.to_string(),
            version,
            payload: serde_json::to_vec(&Credited { amount }).unwrap(),
        }
    }

    #[tokio::test]
    async fn empty_stream_yields_default_state() {
        let replay = AggregateReplay::new(
            Arc::new(InMemoryEventStream::new()),
            Arc::new(InMemorySnapshotStore::new()),
        );

        let (ledger, version) = replay.load::<Ledger>("l-1").await.unwrap();
        assert_eq!(ledger, Ledger::default());
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn events_fold_in_stream_order() {
        let events = Arc::new(InMemoryEventStream::new());
        events.append(credited("l-1", 1, 10));
        events.append(credited("l-1", 2, 5));
        events.append(credited("l-2", 1, 99));

        let replay = AggregateReplay::new(events, Arc::new(InMemorySnapshotStore::new()));
        let (ledger, version) = replay.load::<Ledger>("l-1").await.unwrap();

        assert_eq!(ledger.total, 15);
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn snapshot_short_circuits_the_replay() {
        let events = Arc::new(RecordingStream::default());
        events.inner.append(credited("l-1", 1, 10));
        events.inner.append(credited("l-1", 2, 5));

        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let replay = AggregateReplay::new(events.clone(), snapshots.clone())
            .with_snapshot_every(1);

        // First load folds everything and writes a snapshot at version 2.
        let (ledger, version) = replay.load::<Ledger>("l-1").await.unwrap();
        assert_eq!((ledger.total, version), (15, 2));
        assert!(snapshots.load("l-1").await.unwrap().is_some());

        // Second load resumes after the snapshot version.
        events.inner.append(credited("l-1", 3, 1));
        let (ledger, version) = replay.load::<Ledger>("l-1").await.unwrap();
        assert_eq!((ledger.total, version), (16, 3));
        assert_eq!(events.last_read_after.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn write_back_respects_the_threshold() {
        let events = Arc::new(InMemoryEventStream::new());
        events.append(credited("l-1", 1, 10));

        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let replay = AggregateReplay::new(events, snapshots.clone()).with_snapshot_every(5);

        // One folded event is below the threshold: no snapshot.
        replay.load::<Ledger>("l-1").await.unwrap();
        assert!(snapshots.load("l-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_snapshot_version_fails_loudly() {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        snapshots
            .save(AggregateSnapshot {
                aggregate_id: "l-1".to_string(),
                version: 4,
                payload: serde_json::to_vec(&serde_json::json!({
                    "version": 99,
                    "state": {"total": 0},
                }))
                .unwrap(),
            })
            .await
            .unwrap();

        let replay = AggregateReplay::new(Arc::new(InMemoryEventStream::new()), snapshots);
        let err = replay.load::<Ledger>("l-1").await.unwrap_err();
        assert!(matches!(
            err,
            ReplayError::UnknownVersion {
                found: 99,
                supported: SNAPSHOT_BLOB_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn malformed_event_payload_fails_the_load() {
        let events = Arc::new(InMemoryEventStream::new());
        events.append(PersistedEvent {
            aggregate_id: "l-1".to_string(),
            version: 1,
            payload: vec![0xFF],
        });

        let replay =
            AggregateReplay::new(events, Arc::new(InMemorySnapshotStore::new()));
        let err = replay.load::<Ledger>("l-1").await.unwrap_err();
        assert!(matches!(err, ReplayError::Decode(_)));
    }

    #[tokio::test]
    async fn invalidate_forces_a_full_replay() {
        let events = Arc::new(RecordingStream::default());
        events.inner.append(credited("l-1", 1, 10));

        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let replay = AggregateReplay::new(events.clone(), snapshots.clone())
            .with_snapshot_every(1);

        replay.load::<Ledger>("l-1").await.unwrap();
        assert!(snapshots.load("l-1").await.unwrap().is_some());

        replay.invalidate_snapshot("l-1").await.unwrap();
        assert!(snapshots.load("l-1").await.unwrap().is_none());

        let (ledger, _) = replay.load::<Ledger>("l-1").await.unwrap();
        assert_eq!(ledger.total, 10);
        assert_eq!(events.last_read_after.load(Ordering::SeqCst), 0);
    }
}
