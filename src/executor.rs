//! Message executor: the options-aware invocation of one handler.
//!
//! The executor wraps a [`HandlerDescriptor`] and drives the per-handler
//! protocol: install options on the context, validate input, check declared
//! dependencies against the frozen [`DependencyResolver`], invoke, and
//! translate failures into configured error events.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{FailureDetails, HandlerDescriptor, HandlerOptions};
use crate::context::{DeliveryOptions, KernelContext};
use crate::error::ExecutionError;
use crate::message::AnyMessage;

/// Identity of a resolvable dependency: its `TypeId` plus a printable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl DependencyKey {
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Frozen map of shared dependencies, keyed by type.
///
/// Built once at bootstrap; handlers resolve collaborators (saga provider,
/// repositories, clients) by their declared parameter type.
#[derive(Default)]
pub struct DependencyResolver {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyResolver {
    pub fn builder() -> DependencyResolverBuilder {
        DependencyResolverBuilder {
            entries: HashMap::new(),
        }
    }

    /// A resolver with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the resolver can satisfy `key`.
    pub fn contains(&self, key: &DependencyKey) -> bool {
        self.entries.contains_key(&key.type_id)
    }

    /// Resolve a dependency by type.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ExecutionError> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
            .ok_or(ExecutionError::ArgumentResolutionFailed {
                parameter: std::any::type_name::<T>(),
            })
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Collects dependencies for a [`DependencyResolver`].
pub struct DependencyResolverBuilder {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyResolverBuilder {
    /// Provide an owned dependency.
    pub fn provide<T: Any + Send + Sync>(self, value: T) -> Self {
        self.provide_shared(Arc::new(value))
    }

    /// Provide an already-shared dependency.
    pub fn provide_shared<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn build(self) -> DependencyResolver {
        DependencyResolver {
            entries: self.entries,
        }
    }
}

/// The wrapped, options-aware invocation of one handler.
#[derive(Debug, Clone)]
pub struct MessageExecutor {
    descriptor: Arc<HandlerDescriptor>,
}

impl MessageExecutor {
    pub(crate) fn new(descriptor: Arc<HandlerDescriptor>) -> Self {
        Self { descriptor }
    }

    /// The descriptor this executor wraps.
    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    /// Execution options of the wrapped handler.
    pub fn options(&self) -> &HandlerOptions {
        self.descriptor.options()
    }

    /// Run the full per-handler protocol for one message.
    pub async fn execute(
        &self,
        message: AnyMessage,
        ctx: &mut KernelContext,
        deps: &DependencyResolver,
    ) -> Result<(), ExecutionError> {
        let options = self.descriptor.options().clone();
        ctx.install_options(options.clone());

        if ctx.cancellation().is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if options.validate {
            let violations = self
                .descriptor
                .validate(&message, &options.validation_groups);
            if !violations.is_empty() {
                return match options.validation_failed_event() {
                    Some(factory) => {
                        let event = factory(violations);
                        ctx.publish_any(event, DeliveryOptions::default()).await?;
                        Ok(())
                    }
                    None => Err(ExecutionError::ValidationFailed(violations)),
                };
            }
        }

        for key in self.descriptor.required_dependencies() {
            if !deps.contains(key) {
                return Err(ExecutionError::ArgumentResolutionFailed {
                    parameter: key.type_name(),
                });
            }
        }

        match self.descriptor.invoke(message.clone(), ctx, deps).await {
            Ok(()) => Ok(()),
            Err(source) => match options.throwable_event() {
                Some(factory) => {
                    let event = factory(FailureDetails {
                        message_type: message.type_key(),
                        error: source.to_string(),
                        trace_id: ctx.trace_id().to_string(),
                    });
                    ctx.publish_any(event, DeliveryOptions::default()).await?;
                    Ok(())
                }
                None => Err(ExecutionError::HandlerFailed {
                    description: if options.description.is_empty() {
                        message.type_key().to_string()
                    } else {
                        options.description.clone()
                    },
                    source,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{HandlerCatalog, MessageHandler};
    use crate::context::test_fixtures::ContextHarness;
    use crate::endpoint::{Endpoint, EndpointRouter};
    use crate::error::HandlerError;
    use crate::message::test_fixtures::{OrderPlaced, PlaceOrder};
    use crate::message::{Message, MessageKind, Violation};
    use crate::transport::{InMemoryTransport, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Repository stand-in used to exercise dependency resolution.
    #[derive(Debug, Default)]
    struct OrderRepository {
        seen: AtomicU32,
    }

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct OrderFailed {
        error: String,
        trace_id: String,
    }

    impl Message for OrderFailed {
        const TYPE_KEY: &'static str = "order.failed";
        const KIND: MessageKind = MessageKind::Event;
    }

    /// Handler with switchable behavior and call counting.
    struct TestHandler {
        calls: Arc<AtomicU32>,
        fail_with: Option<String>,
        required: Vec<DependencyKey>,
    }

    impl TestHandler {
        fn succeeding(calls: Arc<AtomicU32>) -> Self {
            Self {
                calls,
                fail_with: None,
                required: Vec::new(),
            }
        }

        fn failing(calls: Arc<AtomicU32>, error: &str) -> Self {
            Self {
                calls,
                fail_with: Some(error.to_string()),
                required: Vec::new(),
            }
        }

        fn requiring(calls: Arc<AtomicU32>, required: Vec<DependencyKey>) -> Self {
            Self {
                calls,
                fail_with: None,
                required,
            }
        }
    }

    #[async_trait]
    impl MessageHandler<PlaceOrder> for TestHandler {
        fn required_dependencies(&self) -> Vec<DependencyKey> {
            self.required.clone()
        }

        async fn handle(
            &self,
            _message: Arc<PlaceOrder>,
            _ctx: &KernelContext,
            deps: &DependencyResolver,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.required.is_empty() {
                // The pre-check guarantees this cannot fail.
                let repo = deps.resolve::<OrderRepository>()?;
                repo.seen.fetch_add(1, Ordering::SeqCst);
            }
            match &self.fail_with {
                Some(error) => Err(error.clone().into()),
                None => Ok(()),
            }
        }
    }

    fn executor_for(catalog: HandlerCatalog) -> MessageExecutor {
        MessageExecutor::new(catalog.descriptors()[0].clone())
    }

    fn valid_order() -> AnyMessage {
        AnyMessage::new(PlaceOrder {
            order_id: "o-1".to_string(),
            amount: 10,
        })
    }

    fn invalid_order() -> AnyMessage {
        AnyMessage::new(PlaceOrder {
            order_id: String::new(),
            amount: 0,
        })
    }

    #[tokio::test]
    async fn successful_handler_resolves() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::succeeding(calls.clone()),
                    HandlerOptions::default(),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_installs_options_on_the_context() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::succeeding(calls),
                    HandlerOptions::new().with_logger_channel("orders"),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap();

        assert_eq!(ctx.current_execution_options().logger_channel, "orders");
    }

    #[tokio::test]
    async fn validation_failure_without_factory_surfaces() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register_validated::<PlaceOrder, _>(
                    TestHandler::succeeding(calls.clone()),
                    HandlerOptions::new().with_validation(vec![]),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        let err = executor
            .execute(invalid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::ValidationFailed(ref v) if v.len() == 2));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not run");
    }

    #[tokio::test]
    async fn validation_failure_with_factory_publishes_the_event() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register_validated::<PlaceOrder, _>(
                    TestHandler::succeeding(calls.clone()),
                    HandlerOptions::new()
                        .with_validation(vec![])
                        .on_validation_failure(|violations: Vec<Violation>| OrderPlaced {
                            order_id: format!("rejected:{}", violations.len()),
                        }),
                )
                .build(),
        );

        let harness = ContextHarness::new(|transport| {
            EndpointRouter::builder()
                .route::<OrderPlaced>(Endpoint::new(
                    "audit",
                    "audit.events",
                    transport.clone() as Arc<dyn Transport>,
                ))
                .build()
        });
        let mut ctx = harness.context();
        executor
            .execute(invalid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.transport.sent_to("audit.events").len(), 1);
    }

    #[tokio::test]
    async fn valid_message_passes_validation() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register_validated::<PlaceOrder, _>(
                    TestHandler::succeeding(calls.clone()),
                    HandlerOptions::new().with_validation(vec![]),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_dependency_fails_before_invocation() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::requiring(
                        calls.clone(),
                        vec![DependencyKey::of::<OrderRepository>()],
                    ),
                    HandlerOptions::default(),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        let err = executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::ArgumentResolutionFailed { parameter } if parameter.contains("OrderRepository")
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not run");
    }

    #[tokio::test]
    async fn declared_dependency_is_resolved() {
        let calls = Arc::new(AtomicU32::new(0));
        let repo = Arc::new(OrderRepository::default());
        let deps = DependencyResolver::builder()
            .provide_shared(repo.clone())
            .build();
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::requiring(calls, vec![DependencyKey::of::<OrderRepository>()]),
                    HandlerOptions::default(),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        executor.execute(valid_order(), &mut ctx, &deps).await.unwrap();

        assert_eq!(repo.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_without_factory_surfaces() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::failing(calls, "inventory unavailable"),
                    HandlerOptions::new().with_description("places an order"),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        let err = executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap_err();

        match err {
            ExecutionError::HandlerFailed {
                description,
                source,
            } => {
                assert_eq!(description, "places an order");
                assert_eq!(source.to_string(), "inventory unavailable");
            }
            other => panic!("expected HandlerFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn handler_failure_with_factory_publishes_the_event() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::failing(calls, "inventory unavailable"),
                    HandlerOptions::new().on_failure(|details: FailureDetails| OrderFailed {
                        error: details.error,
                        trace_id: details.trace_id,
                    }),
                )
                .build(),
        );

        let transport = Arc::new(InMemoryTransport::new());
        let harness = ContextHarness::new(|_| {
            EndpointRouter::builder()
                .route::<OrderFailed>(Endpoint::new(
                    "failures",
                    "failures.events",
                    transport.clone() as Arc<dyn Transport>,
                ))
                .build()
        });
        let codec = Arc::new(crate::codec::JsonCodec::builder().register::<OrderFailed>().build());
        let mut ctx = harness.context_with_encoder(codec);
        executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap();

        let sent = transport.sent_to("failures.events");
        assert_eq!(sent.len(), 1);
        let event: OrderFailed = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(event.error, "inventory unavailable");
        assert_eq!(event.trace_id, "t-ctx");
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_for(
            HandlerCatalog::builder()
                .register::<PlaceOrder, _>(
                    TestHandler::succeeding(calls.clone()),
                    HandlerOptions::default(),
                )
                .build(),
        );

        let harness = ContextHarness::new(|_| EndpointRouter::builder().build());
        let mut ctx = harness.context();
        ctx.cancellation().cancel();

        let err = executor
            .execute(valid_order(), &mut ctx, &DependencyResolver::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resolver_reports_contents() {
        let deps = DependencyResolver::builder()
            .provide(OrderRepository::default())
            .build();
        assert!(deps.contains(&DependencyKey::of::<OrderRepository>()));
        assert!(!deps.contains(&DependencyKey::of::<String>()));
        assert!(deps.resolve::<OrderRepository>().is_ok());
        assert!(matches!(
            deps.resolve::<String>(),
            Err(ExecutionError::ArgumentResolutionFailed { .. })
        ));
    }
}
