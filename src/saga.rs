//! Saga aggregate: identity, status machine, lifecycle fields, and the
//! message queues drained on every save.
//!
//! User-defined saga state implements [`Saga`]; the runtime wraps it in a
//! [`SagaInstance`] that owns the lifecycle fields. Lifecycle mutation goes
//! exclusively through the transition methods; fired commands and raised
//! events accumulate in-memory and are drained explicitly via
//! [`take_fired_messages`](SagaInstance::take_fired_messages).

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::SagaError;
use crate::message::{AnyMessage, Message};

/// Identity of a saga: an opaque value tied to a concrete saga type.
///
/// Two ids are equal iff both the value and the saga type match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId {
    value: String,
    saga_type: String,
}

impl SagaId {
    /// Build an id for saga type `S`.
    pub fn new<S: Saga>(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            saga_type: S::SAGA_TYPE.to_string(),
        }
    }

    /// Build an id from an explicit saga type label.
    pub fn with_type(value: impl Into<String>, saga_type: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            saga_type: saga_type.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.saga_type, self.value)
    }
}

/// Saga lifecycle status.
///
/// `InProgress` is the only non-terminal state; every transition out of it
/// is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl SagaStatus {
    /// Stable lowercase label matching the persisted row format.
    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SagaStatus::InProgress)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-defined saga state.
///
/// The state starts from `Default` and evolves through handler code holding
/// a `&mut SagaInstance<Self>`. [`start`](Saga::start) is the entry point
/// invoked exactly once by [`SagaProvider::start`](crate::SagaProvider::start).
pub trait Saga: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this saga type; used as the `saga_type` half of the
    /// persisted key.
    const SAGA_TYPE: &'static str;

    /// The command that starts this saga.
    type Trigger: Message;

    /// React to the trigger: mutate state, fire commands, raise events.
    fn start(instance: &mut SagaInstance<Self>, trigger: Self::Trigger);
}

/// A live saga: lifecycle fields, user state, and pending message queues.
///
/// Constructed only by the provider (`start`/`obtain`); serialized as the
/// opaque payload of the stored row. The pending queues are transient and
/// never persisted: every successful save drains them first.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct SagaInstance<S> {
    id: SagaId,
    status: SagaStatus,
    created_at: DateTime<Utc>,
    expire_date: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    state: S,
    #[serde(skip)]
    fired_commands: Vec<AnyMessage>,
    #[serde(skip)]
    raised_events: Vec<AnyMessage>,
    /// Per-id serialization guard held from `obtain` until `save`.
    #[serde(skip)]
    lock: Option<OwnedMutexGuard<()>>,
}

impl<S> SagaInstance<S> {
    pub(crate) fn create(id: SagaId, state: S, expire_after: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SagaStatus::InProgress,
            created_at: now,
            expire_date: now + expire_after,
            closed_at: None,
            state,
            fired_commands: Vec::new(),
            raised_events: Vec::new(),
            lock: None,
        }
    }

    pub fn id(&self) -> &SagaId {
        &self.id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expire_date(&self) -> DateTime<Utc> {
        self.expire_date
    }

    /// Set iff the saga left `InProgress`.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Whether the saga's expire date has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_date <= now
    }

    /// Queue a command for delivery on the next save.
    pub fn fire<M: Message>(&mut self, command: M) {
        self.fired_commands.push(AnyMessage::new(command));
    }

    /// Queue an event for delivery on the next save.
    pub fn raise<M: Message>(&mut self, event: M) {
        self.raised_events.push(AnyMessage::new(event));
    }

    /// Commands and events queued but not yet drained.
    pub fn pending_message_count(&self) -> usize {
        self.fired_commands.len() + self.raised_events.len()
    }

    /// Drain the queues: `(fired_commands, raised_events)`, insertion order.
    pub fn take_fired_messages(&mut self) -> (Vec<AnyMessage>, Vec<AnyMessage>) {
        (
            std::mem::take(&mut self.fired_commands),
            std::mem::take(&mut self.raised_events),
        )
    }

    /// Transition `InProgress → Completed`. No-op on a closed saga.
    pub fn complete(&mut self) {
        self.close(SagaStatus::Completed);
    }

    /// Transition `InProgress → Failed`. No-op on a closed saga.
    pub fn fail(&mut self) {
        self.close(SagaStatus::Failed);
    }

    /// Transition `InProgress → Expired`. No-op on a closed saga.
    pub fn make_expired(&mut self) {
        self.close(SagaStatus::Expired);
    }

    /// Guard for the handler boundary: closed sagas accept no messages.
    pub fn ensure_open(&self) -> Result<(), SagaError> {
        if self.status.is_terminal() {
            return Err(SagaError::AlreadyClosed(self.id.clone()));
        }
        Ok(())
    }

    fn close(&mut self, status: SagaStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.closed_at = Some(Utc::now());
    }

    pub(crate) fn attach_lock(&mut self, lock: OwnedMutexGuard<()>) {
        self.lock = Some(lock);
    }

    pub(crate) fn release_lock(&mut self) {
        self.lock = None;
    }
}

impl<S> fmt::Debug for SagaInstance<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaInstance")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("expire_date", &self.expire_date)
            .field("pending", &self.pending_message_count())
            .finish()
    }
}

/// Compile-time-known facts about a saga type.
#[derive(Debug, Clone)]
pub struct SagaMetadata {
    saga_type: &'static str,
    expire_after: Duration,
    id_header: String,
}

impl SagaMetadata {
    pub fn new<S: Saga>(expire_after: Duration, id_header: impl Into<String>) -> Self {
        Self {
            saga_type: S::SAGA_TYPE,
            expire_after,
            id_header: id_header.into(),
        }
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Lifetime granted to new sagas: `expire_date = created_at + expire_after`.
    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }

    /// Incoming header that carries the saga id for correlated messages.
    pub fn id_header(&self) -> &str {
        &self.id_header
    }
}

/// Frozen registry of saga metadata, keyed by saga type.
#[derive(Debug, Default)]
pub struct SagaMetadataCollection {
    entries: HashMap<&'static str, SagaMetadata>,
}

impl SagaMetadataCollection {
    pub fn builder() -> SagaMetadataCollectionBuilder {
        SagaMetadataCollectionBuilder {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, saga_type: &str) -> Option<&SagaMetadata> {
        self.entries.get(saga_type)
    }

    /// Extract the saga id for `saga_type` from incoming package headers.
    ///
    /// Returns `Ok(None)` when the configured id header is absent;
    /// [`SagaError::MetadataNotFound`] when the saga type is unregistered.
    pub fn saga_id_from_headers(
        &self,
        saga_type: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Option<SagaId>, SagaError> {
        let metadata = self.get(saga_type).ok_or(SagaError::MetadataNotFound {
            saga_type: saga_type.to_string(),
        })?;
        Ok(headers
            .get(metadata.id_header())
            .map(|value| SagaId::with_type(value.clone(), saga_type)))
    }
}

/// Collects registrations for a [`SagaMetadataCollection`].
pub struct SagaMetadataCollectionBuilder {
    entries: HashMap<&'static str, SagaMetadata>,
}

impl SagaMetadataCollectionBuilder {
    pub fn register<S: Saga>(mut self, expire_after: Duration, id_header: impl Into<String>) -> Self {
        self.entries
            .insert(S::SAGA_TYPE, SagaMetadata::new::<S>(expire_after, id_header));
        self
    }

    pub fn build(self) -> SagaMetadataCollection {
        SagaMetadataCollection {
            entries: self.entries,
        }
    }
}
