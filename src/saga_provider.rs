//! Saga lifecycle: start, obtain, save.
//!
//! The provider owns the store-and-forward discipline: serialize the
//! instance, persist it (retrying transient storage failures with a
//! constant backoff), and only then deliver the fired commands and raised
//! events through the context. The store is the system of record; a replay
//! must never emit messages that are not durably backed by saga state.
//!
//! Per-saga serialization is a keyed mutex: `obtain` takes the id's lock
//! and hands it to the returned instance; `save` releases it. One in-flight
//! handler per saga id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::{DeliveryOptions, KernelContext};
use crate::error::{DeliveryError, HandlerError, SagaError, StorageError};
use crate::saga::{Saga, SagaId, SagaInstance, SagaMetadataCollection};
use crate::saga_store::{SagaStore, StoredSaga};

/// Maximum store attempts for one persist (initial try included).
const STORE_RETRY_ATTEMPTS: u32 = 5;

/// Constant delay between store attempts.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Current saga payload encoding version.
const SAGA_BLOB_VERSION: u32 = 1;

/// Versioned envelope around the serialized saga instance.
///
/// Loading a blob written by an unknown version fails loudly instead of
/// silently corrupting state.
#[derive(Serialize, Deserialize)]
struct SagaBlob {
    version: u32,
    saga_type: String,
    instance: serde_json::Value,
}

fn encode_saga<S: Saga>(instance: &SagaInstance<S>) -> Result<Vec<u8>, serde_json::Error> {
    let blob = SagaBlob {
        version: SAGA_BLOB_VERSION,
        saga_type: S::SAGA_TYPE.to_string(),
        instance: serde_json::to_value(instance)?,
    };
    serde_json::to_vec(&blob)
}

fn decode_saga<S: Saga>(payload: &[u8]) -> Result<SagaInstance<S>, HandlerError> {
    let blob: SagaBlob = serde_json::from_slice(payload)?;
    if blob.version != SAGA_BLOB_VERSION {
        return Err(format!(
            "unknown saga payload version {} (supported: {SAGA_BLOB_VERSION})",
            blob.version
        )
        .into());
    }
    if blob.saga_type != S::SAGA_TYPE {
        return Err(format!(
            "payload belongs to saga type '{}', expected '{}'",
            blob.saga_type,
            S::SAGA_TYPE
        )
        .into());
    }
    Ok(serde_json::from_value(blob.instance)?)
}

/// Whether a persist inserts a new row or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Insert,
    Update,
}

/// Failure inside the persist-then-emit sequence.
enum DoStoreError {
    Encode(serde_json::Error),
    Storage(StorageError),
    Delivery(DeliveryError),
}

impl DoStoreError {
    fn into_source(self) -> HandlerError {
        match self {
            DoStoreError::Encode(e) => Box::new(e),
            DoStoreError::Storage(e) => Box::new(e),
            DoStoreError::Delivery(e) => Box::new(e),
        }
    }
}

/// Saga lifecycle manager: `start`, `obtain`, `save`.
///
/// Shared across handlers through the dependency resolver. All shared
/// state (the metadata collection) is frozen at construction; the keyed
/// lock registry is the only mutable member.
pub struct SagaProvider {
    store: Arc<dyn SagaStore>,
    metadata: SagaMetadataCollection,
    locks: Mutex<HashMap<SagaId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SagaProvider {
    pub fn new(store: Arc<dyn SagaStore>, metadata: SagaMetadataCollection) -> Self {
        Self {
            store,
            metadata,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The frozen metadata collection, for handler-boundary id extraction.
    pub fn metadata(&self) -> &SagaMetadataCollection {
        &self.metadata
    }

    /// Extract the saga id for `S` from the context's incoming package.
    ///
    /// Handlers correlating a message to a running saga call this before
    /// [`obtain`](SagaProvider::obtain). Reads the id header configured in
    /// the saga's metadata; returns `Ok(None)` when the incoming package
    /// carries no such header.
    ///
    /// # Errors
    ///
    /// [`SagaError::MetadataNotFound`] when `S` is not registered.
    pub fn extract_saga_id<S: Saga>(
        &self,
        ctx: &KernelContext,
    ) -> Result<Option<SagaId>, SagaError> {
        self.metadata
            .saga_id_from_headers(S::SAGA_TYPE, ctx.incoming_headers())
    }

    /// Create, start, and persist a new saga.
    ///
    /// Computes the expire date from the registered metadata, invokes the
    /// saga's `start` entry point, inserts the row, and delivers everything
    /// the entry point queued. The returned instance has empty queues.
    ///
    /// # Errors
    ///
    /// [`SagaError::MetadataNotFound`] for an unregistered saga type,
    /// [`SagaError::DuplicateId`] when the id already exists, and
    /// [`SagaError::StartFailed`] for any other failure.
    pub async fn start<S: Saga>(
        &self,
        id: SagaId,
        trigger: S::Trigger,
        ctx: &KernelContext,
    ) -> Result<SagaInstance<S>, SagaError> {
        let metadata = self
            .metadata
            .get(id.saga_type())
            .ok_or(SagaError::MetadataNotFound {
                saga_type: id.saga_type().to_string(),
            })?;
        let expire_after = metadata.expire_after();

        // Hold the id's lock across the insert so a concurrent obtain
        // cannot observe a half-started saga.
        let _guard = self.lock_for(&id).lock_owned().await;

        let mut instance = SagaInstance::create(id.clone(), S::default(), expire_after, Utc::now());
        S::start(&mut instance, trigger);

        self.do_store(&mut instance, ctx, StoreMode::Insert)
            .await
            .map_err(|err| match err {
                DoStoreError::Storage(StorageError::UniqueConstraintViolation) => {
                    SagaError::DuplicateId(id.clone())
                }
                other => SagaError::StartFailed {
                    id: id.clone(),
                    source: other.into_source(),
                },
            })?;

        Ok(instance)
    }

    /// Load a saga by id.
    ///
    /// Returns `Ok(None)` when no row exists. A saga past its expire date
    /// is closed (`InProgress → Expired`, persisted, queued events flushed)
    /// and surfaced as [`SagaError::ExpiredLoaded`]. A saga already in a
    /// terminal status is rejected with [`SagaError::AlreadyClosed`]:
    /// closed sagas accept no further domain messages.
    ///
    /// The returned instance holds the id's lock until the next
    /// [`save`](SagaProvider::save) (or until it is dropped).
    pub async fn obtain<S: Saga>(
        &self,
        id: &SagaId,
        ctx: &KernelContext,
    ) -> Result<Option<SagaInstance<S>>, SagaError> {
        let guard = self.lock_for(id).lock_owned().await;

        let row = self
            .store
            .load(id)
            .await
            .map_err(|err| SagaError::LoadFailed {
                id: id.clone(),
                source: Box::new(err),
            })?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut instance =
            decode_saga::<S>(&row.payload).map_err(|source| SagaError::LoadFailed {
                id: id.clone(),
                source,
            })?;

        if !instance.is_expired_at(Utc::now()) {
            instance.ensure_open()?;
            instance.attach_lock(guard);
            return Ok(Some(instance));
        }

        self.close_expired(&mut instance, ctx).await?;
        Err(SagaError::ExpiredLoaded(id.clone()))
    }

    /// Persist a saga and deliver its queued messages.
    ///
    /// Guards against silent upsert: the row must already exist (created
    /// by [`start`](SagaProvider::start)). A row that already reached a
    /// terminal status is rejected with [`SagaError::AlreadyClosed`]; the
    /// save that closes a saga is the last one it accepts. Releases the
    /// instance's per-id lock whether or not the save succeeds.
    pub async fn save<S: Saga>(
        &self,
        saga: &mut SagaInstance<S>,
        ctx: &KernelContext,
    ) -> Result<(), SagaError> {
        let result = self.save_inner(saga, ctx).await;
        saga.release_lock();
        result
    }

    async fn save_inner<S: Saga>(
        &self,
        saga: &mut SagaInstance<S>,
        ctx: &KernelContext,
    ) -> Result<(), SagaError> {
        let id = saga.id().clone();
        let row = self
            .store
            .load(&id)
            .await
            .map_err(|err| SagaError::SaveFailed {
                id: id.clone(),
                source: Box::new(err),
            })?;
        let Some(row) = row else {
            return Err(SagaError::SaveFailed {
                id,
                source: "saga does not exist in the store; use start() first".into(),
            });
        };
        if row.status.is_terminal() {
            return Err(SagaError::AlreadyClosed(id));
        }

        self.do_store(saga, ctx, StoreMode::Update)
            .await
            .map_err(|err| SagaError::SaveFailed {
                id,
                source: err.into_source(),
            })
    }

    /// Close an expired saga: transition, persist, flush queued events.
    ///
    /// No-op when the saga already reached a terminal status.
    async fn close_expired<S: Saga>(
        &self,
        saga: &mut SagaInstance<S>,
        ctx: &KernelContext,
    ) -> Result<(), SagaError> {
        if saga.status().is_terminal() {
            return Ok(());
        }
        saga.make_expired();
        self.do_store(saga, ctx, StoreMode::Update)
            .await
            .map_err(|err| SagaError::LoadFailed {
                id: saga.id().clone(),
                source: err.into_source(),
            })
    }

    /// Persist-then-emit.
    ///
    /// 1. Serialize the instance into the versioned blob.
    /// 2. Insert/update with up to [`STORE_RETRY_ATTEMPTS`] attempts,
    ///    [`STORE_RETRY_DELAY`] apart, retrying only transient errors.
    /// 3. Drain the queues and deliver commands then events, in insertion
    ///    order, through the context.
    async fn do_store<S: Saga>(
        &self,
        saga: &mut SagaInstance<S>,
        ctx: &KernelContext,
        mode: StoreMode,
    ) -> Result<(), DoStoreError> {
        let payload = encode_saga(saga).map_err(DoStoreError::Encode)?;
        let stored = StoredSaga {
            id: saga.id().clone(),
            status: saga.status(),
            payload,
            created_at: saga.created_at(),
            expire_date: saga.expire_date(),
            closed_at: saga.closed_at(),
        };

        let mut attempt = 1u32;
        loop {
            let result = match mode {
                StoreMode::Insert => self.store.save(stored.clone()).await,
                StoreMode::Update => self.store.update(stored.clone()).await,
            };
            match result {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                    tracing::warn!(
                        saga_id = %saga.id(),
                        attempt,
                        error = %err,
                        "transient saga store failure, retrying"
                    );
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => return Err(DoStoreError::Storage(err)),
            }
        }

        let (commands, events) = saga.take_fired_messages();
        for message in commands.into_iter().chain(events) {
            ctx.delivery_any(message, DeliveryOptions::default())
                .await
                .map_err(DoStoreError::Delivery)?;
        }
        Ok(())
    }

    /// The keyed mutex for `id`, pruning entries nobody holds.
    fn lock_for(&self, id: &SagaId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id.clone()).or_default().clone()
    }
}

impl std::fmt::Debug for SagaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaProvider").finish()
    }
}
