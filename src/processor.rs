//! Entry point processor: the per-package pipeline.
//!
//! `handle` drives decode, route, executor fan-out, and acknowledgement for
//! one package. All domain and handler failures are absorbed and reported;
//! the only errors that escape are transport ack/nack failures. `run`
//! consumes a transport until cancelled, processing packages concurrently
//! while executors within one package stay strictly sequential.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::DEFAULT_LOGGER_CHANNEL;
use crate::codec::{MessageDecoder, MessageEncoder};
use crate::config::{ConfigurationError, EntryPointConfig};
use crate::context::KernelContext;
use crate::endpoint::EndpointRouter;
use crate::error::{ExecutionError, TransportError};
use crate::executor::DependencyResolver;
use crate::logger::{LogLevel, Logger, TracingLogger};
use crate::router::Router;
use crate::transport::{IncomingPackage, Transport};

/// Drives the decode → route → fan-out → ack pipeline.
///
/// Holds no mutable state beyond injected collaborators; cloning shares
/// them, and `handle` is safe to invoke concurrently for distinct packages.
#[derive(Clone)]
pub struct EntryPointProcessor {
    config: EntryPointConfig,
    decoder: Arc<dyn MessageDecoder>,
    encoder: Arc<dyn MessageEncoder>,
    router: Arc<Router>,
    endpoints: Arc<EndpointRouter>,
    resolver: Arc<DependencyResolver>,
    logger: Arc<dyn Logger>,
    cancellation: CancellationToken,
}

impl EntryPointProcessor {
    pub fn builder(config: EntryPointConfig) -> EntryPointProcessorBuilder {
        EntryPointProcessorBuilder {
            config,
            decoder: None,
            encoder: None,
            router: None,
            endpoints: None,
            resolver: Arc::new(DependencyResolver::empty()),
            logger: Arc::new(TracingLogger),
            cancellation: CancellationToken::new(),
        }
    }

    /// The cancellation token governing this processor.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Process one package end to end.
    ///
    /// Exactly one terminal acknowledgement is issued: ack after the
    /// pipeline settles (including the decode-failure and no-handler
    /// paths), nack-with-requeue when cancellation interrupts processing.
    ///
    /// # Errors
    ///
    /// Only transport ack/nack failures escape.
    pub async fn handle(&self, package: &dyn IncomingPackage) -> Result<(), TransportError> {
        if self.cancellation.is_cancelled() {
            return package.nack(true).await;
        }

        let message = match self.decoder.decode(package) {
            Ok(message) => message,
            Err(err) => {
                // A malformed message must not poison the queue.
                self.logger.log(
                    DEFAULT_LOGGER_CHANNEL,
                    LogLevel::Error,
                    "failed to decode incoming package",
                    &[
                        ("package_id", package.id().to_string()),
                        ("trace_id", package.trace_id().to_string()),
                        (
                            "payload",
                            String::from_utf8_lossy(package.payload()).into_owned(),
                        ),
                        ("reason", err.to_string()),
                    ],
                );
                return package.ack().await;
            }
        };

        let executors = self.router.matches(&message);
        if executors.is_empty() {
            self.logger.log(
                DEFAULT_LOGGER_CHANNEL,
                LogLevel::Debug,
                "no handlers registered for message",
                &[
                    ("type_key", message.type_key().to_string()),
                    ("package_id", package.id().to_string()),
                ],
            );
            return package.ack().await;
        }

        for executor in executors {
            if self.cancellation.is_cancelled() {
                return package.nack(true).await;
            }

            let mut ctx = KernelContext::new(
                package,
                self.endpoints.clone(),
                self.encoder.clone(),
                self.logger.clone(),
                self.config.entry_point_name(),
                self.cancellation.child_token(),
            );

            match executor.execute(message.clone(), &mut ctx, &self.resolver).await {
                Ok(()) => {}
                Err(ExecutionError::Cancelled) => return package.nack(true).await,
                Err(err) => {
                    // One failing executor never aborts the rest.
                    ctx.log_context_message(
                        LogLevel::Error,
                        &format!("handler execution failed: {err}"),
                        &[
                            ("package_id", package.id().to_string()),
                            ("type_key", message.type_key().to_string()),
                        ],
                    );
                }
            }
        }

        package.ack().await
    }

    /// Consume a transport until cancellation or stream end.
    ///
    /// Each package is handled on its own task; acknowledgement failures
    /// inside those tasks are logged, not propagated.
    pub async fn run(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        let mut packages = transport.consume().await?;

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                next = packages.recv() => match next {
                    Some(package) => {
                        let processor = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = processor.handle(package.as_ref()).await {
                                tracing::error!(error = %err, "package acknowledgement failed");
                            }
                        });
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntryPointProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPointProcessor")
            .field("entry_point", &self.config.entry_point_name())
            .field("handlers", &self.router.len())
            .finish()
    }
}

/// Assembles an [`EntryPointProcessor`] from its collaborators.
///
/// The codec, router, and endpoint table are required; the resolver
/// defaults to empty, the logger to [`TracingLogger`], and the cancellation
/// token to a fresh one.
pub struct EntryPointProcessorBuilder {
    config: EntryPointConfig,
    decoder: Option<Arc<dyn MessageDecoder>>,
    encoder: Option<Arc<dyn MessageEncoder>>,
    router: Option<Arc<Router>>,
    endpoints: Option<Arc<EndpointRouter>>,
    resolver: Arc<DependencyResolver>,
    logger: Arc<dyn Logger>,
    cancellation: CancellationToken,
}

impl EntryPointProcessorBuilder {
    /// Use one codec for both decoding and encoding.
    pub fn codec<C>(mut self, codec: Arc<C>) -> Self
    where
        C: MessageDecoder + MessageEncoder + 'static,
    {
        self.decoder = Some(codec.clone());
        self.encoder = Some(codec);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointRouter) -> Self {
        self.endpoints = Some(Arc::new(endpoints));
        self
    }

    pub fn resolver(mut self, resolver: DependencyResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn build(self) -> Result<EntryPointProcessor, ConfigurationError> {
        let missing = |what: &str| {
            ConfigurationError::CheckFailed(format!("entry point processor requires a {what}"))
        };
        Ok(EntryPointProcessor {
            config: self.config,
            decoder: self.decoder.ok_or_else(|| missing("decoder"))?,
            encoder: self.encoder.ok_or_else(|| missing("encoder"))?,
            router: self.router.ok_or_else(|| missing("router"))?,
            endpoints: self.endpoints.ok_or_else(|| missing("endpoint table"))?,
            resolver: self.resolver,
            logger: self.logger,
            cancellation: self.cancellation,
        })
    }
}
