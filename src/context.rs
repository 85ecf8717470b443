//! Per-message execution context.
//!
//! A fresh [`KernelContext`] is constructed for every executor run. It
//! snapshots the incoming package's identity, carries the frozen endpoint
//! table and codec, and is the only way user code emits further messages
//! or structured logs. Contexts are never shared between executors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog::HandlerOptions;
use crate::codec::MessageEncoder;
use crate::endpoint::EndpointRouter;
use crate::error::DeliveryError;
use crate::logger::{LogLevel, Logger};
use crate::message::{AnyMessage, Message, MessageKind};
use crate::transport::{IncomingPackage, MESSAGE_TYPE_HEADER, ORIGIN_HEADER, OutgoingPackage};

/// Options for one outgoing delivery.
///
/// Missing fields default from the incoming package: the trace id falls
/// back to the package's trace id, headers are merged with the stamped
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Trace id override; defaults to the incoming package's trace id.
    pub trace_id: Option<String>,
    /// Extra headers for the outgoing package.
    pub headers: HashMap<String, String>,
    /// Broker-side delivery delay.
    pub delivery_delay: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = Some(delay);
        self
    }
}

/// Per-message execution context handed to handlers.
pub struct KernelContext {
    package_id: String,
    trace_id: String,
    incoming_headers: HashMap<String, String>,
    endpoints: Arc<EndpointRouter>,
    encoder: Arc<dyn MessageEncoder>,
    logger: Arc<dyn Logger>,
    origin: String,
    cancellation: CancellationToken,
    options: HandlerOptions,
}

impl KernelContext {
    /// Snapshot a package into a fresh context.
    pub fn new(
        package: &dyn IncomingPackage,
        endpoints: Arc<EndpointRouter>,
        encoder: Arc<dyn MessageEncoder>,
        logger: Arc<dyn Logger>,
        origin: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            package_id: package.id().to_string(),
            trace_id: package.trace_id().to_string(),
            incoming_headers: package.headers().clone(),
            endpoints,
            encoder,
            logger,
            origin: origin.into(),
            cancellation,
            options: HandlerOptions::default(),
        }
    }

    /// Id of the package being processed.
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    /// Trace id of the causal chain this message belongs to.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Headers of the incoming package.
    pub fn incoming_headers(&self) -> &HashMap<String, String> {
        &self.incoming_headers
    }

    /// The cancellation token governing this execution.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The options installed by the executor before user code ran.
    pub fn current_execution_options(&self) -> &HandlerOptions {
        &self.options
    }

    pub(crate) fn install_options(&mut self, options: HandlerOptions) {
        self.options = options;
    }

    /// Route a command (or query) to exactly one endpoint.
    pub async fn send<M: Message>(
        &self,
        message: M,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        self.send_any(AnyMessage::new(message), options).await
    }

    /// Fan an event out to every matching endpoint.
    pub async fn publish<M: Message>(
        &self,
        message: M,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        self.publish_any(AnyMessage::new(message), options).await
    }

    /// Deliver a message according to its kind.
    pub async fn delivery<M: Message>(
        &self,
        message: M,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        self.delivery_any(AnyMessage::new(message), options).await
    }

    /// Kind-dispatched delivery of an erased message.
    pub async fn delivery_any(
        &self,
        message: AnyMessage,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        match message.kind() {
            MessageKind::Command | MessageKind::Query => self.send_any(message, options).await,
            MessageKind::Event => self.publish_any(message, options).await,
        }
    }

    /// Single-endpoint delivery of an erased message.
    pub async fn send_any(
        &self,
        message: AnyMessage,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        if self.cancellation.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }

        let endpoints = self.endpoints.endpoints_for(message.type_key());
        if endpoints.len() != 1 {
            return Err(DeliveryError::EndpointNotConfigured {
                type_key: message.type_key().to_string(),
                matched: endpoints.len(),
            });
        }

        let endpoint = &endpoints[0];
        let outgoing = self.outgoing_package(&message, &options, endpoint.destination())?;
        endpoint.deliver(outgoing).await?;
        Ok(())
    }

    /// Fan-out delivery of an erased message. Zero matches is not an error.
    pub async fn publish_any(
        &self,
        message: AnyMessage,
        options: DeliveryOptions,
    ) -> Result<(), DeliveryError> {
        if self.cancellation.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }

        let endpoints = self.endpoints.endpoints_for(message.type_key());
        if endpoints.is_empty() {
            self.log_context_message(
                LogLevel::Debug,
                "no endpoints configured for published event",
                &[("type_key", message.type_key().to_string())],
            );
            return Ok(());
        }

        for endpoint in endpoints {
            let outgoing = self.outgoing_package(&message, &options, endpoint.destination())?;
            endpoint.deliver(outgoing).await?;
        }
        Ok(())
    }

    /// Log on the channel of the currently active handler options.
    pub fn log_context_message(&self, level: LogLevel, message: &str, extra: &[(&str, String)]) {
        self.logger
            .log(&self.options.logger_channel, level, message, extra);
    }

    /// Build the outgoing envelope: encode the payload and stamp the trace
    /// id and missing headers.
    fn outgoing_package(
        &self,
        message: &AnyMessage,
        options: &DeliveryOptions,
        destination: &str,
    ) -> Result<OutgoingPackage, DeliveryError> {
        let payload = self.encoder.encode(message)?;

        let mut headers = options.headers.clone();
        headers
            .entry(MESSAGE_TYPE_HEADER.to_string())
            .or_insert_with(|| message.type_key().to_string());
        headers
            .entry(ORIGIN_HEADER.to_string())
            .or_insert_with(|| self.origin.clone());

        let trace_id = options
            .trace_id
            .clone()
            .unwrap_or_else(|| self.trace_id.clone());

        Ok(OutgoingPackage {
            destination: destination.to_string(),
            payload,
            headers,
            trace_id,
            delivery_delay: options.delivery_delay,
        })
    }
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("package_id", &self.package_id)
            .field("trace_id", &self.trace_id)
            .field("origin", &self.origin)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::logger::RecordingLogger;
    use crate::message::test_fixtures::{OrderPlaced, PlaceOrder};
    use crate::transport::InMemoryIncomingPackage;

    /// Everything a context test needs, wired to in-memory collaborators.
    pub(crate) struct ContextHarness {
        pub transport: Arc<crate::transport::InMemoryTransport>,
        pub logger: Arc<RecordingLogger>,
        pub package: InMemoryIncomingPackage,
        pub endpoints: Arc<EndpointRouter>,
        pub codec: Arc<JsonCodec>,
    }

    impl ContextHarness {
        pub(crate) fn new(endpoints: impl FnOnce(&Arc<crate::transport::InMemoryTransport>) -> EndpointRouter) -> Self {
            let transport = Arc::new(crate::transport::InMemoryTransport::new());
            let endpoints = Arc::new(endpoints(&transport));
            Self {
                transport: transport.clone(),
                logger: Arc::new(RecordingLogger::new()),
                package: InMemoryIncomingPackage::new(b"{}".to_vec(), HashMap::new())
                    .with_id("p-ctx")
                    .with_trace_id("t-ctx"),
                endpoints,
                codec: Arc::new(
                    JsonCodec::builder()
                        .register::<PlaceOrder>()
                        .register::<OrderPlaced>()
                        .build(),
                ),
            }
        }

        pub(crate) fn context(&self) -> KernelContext {
            self.context_with_encoder(self.codec.clone())
        }

        /// Context wired to a different codec, for messages the default
        /// harness codec does not register.
        pub(crate) fn context_with_encoder(&self, encoder: Arc<JsonCodec>) -> KernelContext {
            KernelContext::new(
                &self.package,
                self.endpoints.clone(),
                encoder,
                self.logger.clone(),
                "test-entry-point",
                CancellationToken::new(),
            )
        }
    }
}
