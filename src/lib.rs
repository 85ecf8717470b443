//! Message-processing and saga-orchestration core for service-bus
//! applications.
//!
//! `sagabus` provides the runtime backbone of a message-driven service:
//! it consumes transport packages, decodes them into typed domain messages,
//! routes each message to its registered handlers, executes those handlers
//! under a per-message context that can emit further commands and events,
//! and manages long-lived business transactions (sagas) with durable state,
//! expiration, and at-least-once delivery of fired messages.
//!
//! Transports, wire codecs beyond JSON, and physical storage backends are
//! external collaborators behind traits; in-memory implementations of each
//! are included for tests and embedded use.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Message`] | Typed domain message: command, event, or query |
//! | [`HandlerCatalog`] | Frozen registry of handlers with per-handler options |
//! | [`Router`] | Message instance → ordered executor list (supertype-aware) |
//! | [`EndpointRouter`] | Outgoing message type → named transport destinations |
//! | [`KernelContext`] | Per-message handle for `send`/`publish` and structured logs |
//! | [`EntryPointProcessor`] | Decode → route → fan-out → ack pipeline |
//! | [`Saga`] / [`SagaInstance`] | Stateful coordinator of a long-lived transaction |
//! | [`SagaProvider`] | Saga lifecycle: `start`, `obtain`, `save`, expiration, retry |
//! | [`AggregateReplay`] | Event-stream fold fast-forwarded through snapshots |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//!
//! use sagabus::{
//!     DependencyResolver, EndpointRouter, EntryPointConfig, EntryPointProcessor,
//!     Environment, HandlerCatalog, HandlerOptions, InMemoryTransport, JsonCodec,
//!     KernelContext, LogLevel, Message, MessageHandler, MessageKind, Router,
//!     Transport,
//! };
//!
//! // 1. Define a message.
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct PlaceOrder {
//!     order_id: String,
//! }
//!
//! impl Message for PlaceOrder {
//!     const TYPE_KEY: &'static str = "order.place";
//!     const KIND: MessageKind = MessageKind::Command;
//! }
//!
//! // 2. Define a handler.
//! struct PlaceOrderHandler;
//!
//! #[async_trait]
//! impl MessageHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(
//!         &self,
//!         message: Arc<PlaceOrder>,
//!         ctx: &KernelContext,
//!         _deps: &DependencyResolver,
//!     ) -> Result<(), sagabus::HandlerError> {
//!         ctx.log_context_message(
//!             LogLevel::Info,
//!             "order placed",
//!             &[("order_id", message.order_id.clone())],
//!         );
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 3. Wire the pipeline and consume.
//! let transport = Arc::new(InMemoryTransport::new());
//! let codec = Arc::new(JsonCodec::builder().register::<PlaceOrder>().build());
//! let catalog = HandlerCatalog::builder()
//!     .register::<PlaceOrder, _>(PlaceOrderHandler, HandlerOptions::default())
//!     .build();
//!
//! let processor =
//!     EntryPointProcessor::builder(EntryPointConfig::new("orders", Environment::Development)?)
//!         .codec(codec)
//!         .router(Router::new(catalog))
//!         .endpoints(EndpointRouter::builder().build())
//!         .build()?;
//!
//! processor.run(transport as Arc<dyn Transport>).await?;
//! # Ok(())
//! # }
//! ```

mod catalog;
mod codec;
mod config;
mod context;
mod endpoint;
mod error;
mod executor;
mod logger;
mod message;
mod processor;
mod replay;
mod router;
mod saga;
mod saga_provider;
mod saga_store;
mod snapshot;
mod transport;

pub use catalog::{
    AnyMessageHandler, DEFAULT_LOGGER_CHANNEL, FailureDetails, HandlerCatalog,
    HandlerCatalogBuilder, HandlerDescriptor, HandlerOptions, MessageHandler,
};
pub use codec::{JsonCodec, JsonCodecBuilder, MessageDecoder, MessageEncoder};
pub use config::{ConfigurationError, EntryPointConfig, Environment};
pub use context::{DeliveryOptions, KernelContext};
pub use endpoint::{Endpoint, EndpointRouter, EndpointRouterBuilder};
pub use error::{
    DecodeError, DeliveryError, EncodeError, ExecutionError, HandlerError, ReplayError, SagaError,
    StorageError, TransportError,
};
pub use executor::{DependencyKey, DependencyResolver, DependencyResolverBuilder, MessageExecutor};
pub use logger::{LogEntry, LogLevel, Logger, RecordingLogger, TracingLogger};
pub use message::{AnyMessage, Message, MessageKind, Validate, Violation};
pub use processor::{EntryPointProcessor, EntryPointProcessorBuilder};
pub use replay::{Aggregate, AggregateReplay, EventStream, InMemoryEventStream, PersistedEvent};
pub use router::Router;
pub use saga::{
    Saga, SagaId, SagaInstance, SagaMetadata, SagaMetadataCollection,
    SagaMetadataCollectionBuilder, SagaStatus,
};
pub use saga_provider::SagaProvider;
pub use saga_store::{InMemorySagaStore, SagaStore, StoredSaga};
pub use snapshot::{AggregateSnapshot, InMemorySnapshotStore, SnapshotStore};
pub use transport::{
    InMemoryIncomingPackage, InMemoryTransport, IncomingPackage, MESSAGE_TYPE_HEADER,
    ORIGIN_HEADER, OutgoingPackage, Transport,
};
