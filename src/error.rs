//! Crate-level error types for the pipeline, delivery, saga, and storage layers.

use crate::message::Violation;
use crate::saga::SagaId;

/// Errors produced by user handlers.
///
/// Handlers are free to fail with any error type; the executor either
/// translates the failure into a configured error event or surfaces it to
/// the processor for logging.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-layer failures.
///
/// These are the only errors allowed to escape
/// [`EntryPointProcessor::handle`](crate::EntryPointProcessor::handle).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The broker connection is down or could not be established.
    #[error("transport connection failed: {0}")]
    ConnectionFailed(String),

    /// Sending an outgoing package failed.
    #[error("sending outgoing package failed: {0}")]
    SendFailed(String),

    /// A terminal acknowledgement (ack or nack) failed.
    #[error("acknowledging package failed: {0}")]
    AckFailed(String),
}

/// Failure to turn an incoming package into a typed message.
///
/// Always recovered locally: the processor logs the failure and acks the
/// package so a malformed message cannot poison the queue.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The package carries no message-type header.
    #[error("package carries no '{header}' header")]
    MissingTypeHeader { header: &'static str },

    /// The type key is not registered with the codec.
    #[error("no decoder registered for message type '{type_key}'")]
    UnknownMessageType { type_key: String },

    /// The payload does not deserialize into the registered type.
    #[error("malformed payload for message type '{type_key}': {source}")]
    MalformedPayload {
        type_key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to serialize an outgoing message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The message type is not registered with the codec.
    #[error("no encoder registered for message type '{type_key}'")]
    UnknownMessageType { type_key: String },

    /// Serialization itself failed.
    #[error("serializing message '{type_key}' failed: {source}")]
    Serialize {
        type_key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to route or hand an outgoing message to a transport.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// `send` requires exactly one endpoint for the message type.
    #[error("no endpoint configured for '{type_key}': {matched} matched, exactly one required")]
    EndpointNotConfigured { type_key: String, matched: usize },

    /// The outgoing message could not be serialized.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport rejected the outgoing package.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The execution context was cancelled before the send completed.
    #[error("delivery cancelled")]
    Cancelled,
}

/// Failure of a single handler execution.
///
/// Caught by the processor, logged, and never aborts the remaining
/// executors for the same package.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Input validation rejected the message and no validation-failed
    /// event type is configured for the handler.
    #[error("message validation failed with {} violation(s)", .0.len())]
    ValidationFailed(Vec<Violation>),

    /// A declared handler dependency is missing from the resolver.
    #[error("cannot resolve handler dependency '{parameter}'")]
    ArgumentResolutionFailed { parameter: &'static str },

    /// The user handler failed and no throwable event type is configured.
    #[error("handler '{description}' failed: {source}")]
    HandlerFailed {
        description: String,
        #[source]
        source: HandlerError,
    },

    /// Emitting a message through the context failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The execution context was cancelled before the handler settled.
    #[error("execution cancelled")]
    Cancelled,
}

/// Storage-contract failures surfaced by saga, snapshot, and event stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The storage backend is unreachable. Transient.
    #[error("storage connection failed: {0}")]
    ConnectionFailed(String),

    /// The backend was reached but the interaction failed. Transient.
    #[error("storage interaction failed: {0}")]
    InteractionFailed(String),

    /// An insert collided with an existing unique key.
    #[error("unique constraint violated")]
    UniqueConstraintViolation,

    /// An update or delete matched no row.
    #[error("row not found")]
    NotFound,

    /// Any other backend failure.
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

impl StorageError {
    /// Whether retrying the operation may succeed.
    ///
    /// Only connection and interaction failures are retried by
    /// [`SagaProvider`](crate::SagaProvider); everything else propagates
    /// immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionFailed(_) | StorageError::InteractionFailed(_)
        )
    }
}

/// Saga lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// No metadata registered for the saga type named by the id.
    #[error("saga metadata not found for '{saga_type}'")]
    MetadataNotFound { saga_type: String },

    /// `start` collided with an already-persisted saga id.
    #[error("saga '{0}' already exists")]
    DuplicateId(SagaId),

    /// `start` failed after instantiation (storage or delivery).
    #[error("starting saga '{id}' failed: {source}")]
    StartFailed {
        id: SagaId,
        #[source]
        source: HandlerError,
    },

    /// `obtain` failed to load or decode the stored saga.
    #[error("loading saga '{id}' failed: {source}")]
    LoadFailed {
        id: SagaId,
        #[source]
        source: HandlerError,
    },

    /// `save` failed: the row is missing, storage gave up, or delivery of
    /// fired messages failed.
    #[error("saving saga '{id}' failed: {source}")]
    SaveFailed {
        id: SagaId,
        #[source]
        source: HandlerError,
    },

    /// `obtain` found the saga past its expire date; it has been closed.
    #[error("saga '{0}' has expired")]
    ExpiredLoaded(SagaId),

    /// A domain message reached a saga in a terminal status.
    #[error("saga '{0}' is closed and no longer accepts messages")]
    AlreadyClosed(SagaId),
}

/// Failure to reconstitute an aggregate from its event stream.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Reading events or snapshots failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted event or snapshot payload does not deserialize.
    #[error("decoding persisted state failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The snapshot blob was written by an unknown encoding version.
    #[error("unknown snapshot encoding version {found} (supported: {supported})")]
    UnknownVersion { found: u32, supported: u32 },
}
