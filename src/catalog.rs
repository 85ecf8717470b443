//! Handler catalog: the static, pre-built map from message types to
//! handler descriptors.
//!
//! The catalog is assembled once at bootstrap through
//! [`HandlerCatalogBuilder`] and frozen afterwards. Each registration
//! produces a [`HandlerDescriptor`]: the type-erased invocation plus the
//! [`HandlerOptions`] the executor installs on the context before user code
//! runs. Registration order is preserved and decides tie-breaking in the
//! router.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::KernelContext;
use crate::error::HandlerError;
use crate::executor::{DependencyKey, DependencyResolver};
use crate::message::{AnyMessage, Message, Validate, Violation};

/// Logger channel used when a handler does not configure one.
pub const DEFAULT_LOGGER_CHANNEL: &str = "default";

/// A typed message handler.
///
/// The handler receives the concrete message, the per-message
/// [`KernelContext`], and the frozen [`DependencyResolver`]. Dependencies
/// declared via [`required_dependencies`](MessageHandler::required_dependencies)
/// are checked by the executor before invocation; a miss never reaches
/// `handle`.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Dependency types this handler resolves at invocation time.
    fn required_dependencies(&self) -> Vec<DependencyKey> {
        Vec::new()
    }

    async fn handle(
        &self,
        message: Arc<M>,
        ctx: &KernelContext,
        deps: &DependencyResolver,
    ) -> Result<(), HandlerError>;
}

/// A handler registered under a supertype key, receiving the erased form.
#[async_trait]
pub trait AnyMessageHandler: Send + Sync + 'static {
    /// Dependency types this handler resolves at invocation time.
    fn required_dependencies(&self) -> Vec<DependencyKey> {
        Vec::new()
    }

    async fn handle(
        &self,
        message: AnyMessage,
        ctx: &KernelContext,
        deps: &DependencyResolver,
    ) -> Result<(), HandlerError>;
}

/// Details handed to a throwable-event factory when a handler fails.
#[derive(Debug, Clone)]
pub struct FailureDetails {
    /// Type key of the message whose handler failed.
    pub message_type: &'static str,
    /// Rendered error of the failed handler.
    pub error: String,
    /// Trace id of the causing package.
    pub trace_id: String,
}

pub(crate) type ValidationEventFactory = Arc<dyn Fn(Vec<Violation>) -> AnyMessage + Send + Sync>;
pub(crate) type ThrowableEventFactory = Arc<dyn Fn(FailureDetails) -> AnyMessage + Send + Sync>;

/// Per-handler execution options.
///
/// Installed on the [`KernelContext`] by the executor before user code
/// runs; the context routes [`log_context_message`](KernelContext::log_context_message)
/// to `logger_channel`.
#[derive(Clone)]
pub struct HandlerOptions {
    /// Run input validation before invoking the handler.
    pub validate: bool,
    /// Validation groups to apply; empty means all.
    pub validation_groups: Vec<String>,
    /// Channel for context-routed log messages.
    pub logger_channel: String,
    /// Human-readable description used in failure logs.
    pub description: String,
    validation_failed_event: Option<ValidationEventFactory>,
    throwable_event: Option<ThrowableEventFactory>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            validate: false,
            validation_groups: Vec::new(),
            logger_channel: DEFAULT_LOGGER_CHANNEL.to_string(),
            description: String::new(),
            validation_failed_event: None,
            throwable_event: None,
        }
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable validation with the given groups (empty: all groups).
    pub fn with_validation(mut self, groups: Vec<String>) -> Self {
        self.validate = true;
        self.validation_groups = groups;
        self
    }

    pub fn with_logger_channel(mut self, channel: impl Into<String>) -> Self {
        self.logger_channel = channel.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Publish an event of type `E` instead of failing when validation
    /// rejects the message.
    pub fn on_validation_failure<E, F>(mut self, factory: F) -> Self
    where
        E: Message,
        F: Fn(Vec<Violation>) -> E + Send + Sync + 'static,
    {
        self.validation_failed_event = Some(Arc::new(move |violations| {
            AnyMessage::new(factory(violations))
        }));
        self
    }

    /// Publish an event of type `E` instead of surfacing a handler failure.
    pub fn on_failure<E, F>(mut self, factory: F) -> Self
    where
        E: Message,
        F: Fn(FailureDetails) -> E + Send + Sync + 'static,
    {
        self.throwable_event = Some(Arc::new(move |details| AnyMessage::new(factory(details))));
        self
    }

    pub(crate) fn validation_failed_event(&self) -> Option<&ValidationEventFactory> {
        self.validation_failed_event.as_ref()
    }

    pub(crate) fn throwable_event(&self) -> Option<&ThrowableEventFactory> {
        self.throwable_event.as_ref()
    }
}

impl std::fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("validate", &self.validate)
            .field("validation_groups", &self.validation_groups)
            .field("logger_channel", &self.logger_channel)
            .field("description", &self.description)
            .field("validation_failed_event", &self.validation_failed_event.is_some())
            .field("throwable_event", &self.throwable_event.is_some())
            .finish()
    }
}

pub(crate) type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Type-erased invocation of one registered handler.
///
/// Each typed registration gets an adapter that recovers the concrete
/// message type and delegates to the user handler.
pub(crate) trait ErasedInvoke: Send + Sync {
    fn invoke<'a>(
        &'a self,
        message: AnyMessage,
        ctx: &'a KernelContext,
        deps: &'a DependencyResolver,
    ) -> HandlerFuture<'a>;
}

/// Adapter for handlers of a concrete message type `M`.
struct TypedInvoke<M, H> {
    handler: H,
    _marker: PhantomData<fn() -> M>,
}

impl<M, H> ErasedInvoke for TypedInvoke<M, H>
where
    M: Message,
    H: MessageHandler<M>,
{
    fn invoke<'a>(
        &'a self,
        message: AnyMessage,
        ctx: &'a KernelContext,
        deps: &'a DependencyResolver,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            // A mismatch here means the catalog was built against a key the
            // decoder maps to a different type. Surface it as a handler
            // failure rather than panicking mid-pipeline.
            let Some(concrete) = message.downcast_arc::<M>() else {
                return Err(format!(
                    "message '{}' is not a {}",
                    message.type_key(),
                    std::any::type_name::<M>()
                )
                .into());
            };
            self.handler.handle(concrete, ctx, deps).await
        })
    }
}

/// Adapter for supertype handlers working on the erased form.
struct ErasedHandlerInvoke<H> {
    handler: H,
}

impl<H: AnyMessageHandler> ErasedInvoke for ErasedHandlerInvoke<H> {
    fn invoke<'a>(
        &'a self,
        message: AnyMessage,
        ctx: &'a KernelContext,
        deps: &'a DependencyResolver,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { self.handler.handle(message, ctx, deps).await })
    }
}

type ValidatorFn = Box<dyn Fn(&AnyMessage, &[String]) -> Vec<Violation> + Send + Sync>;

/// One registered handler: message key, options, erased invocation.
pub struct HandlerDescriptor {
    message_key: &'static str,
    options: HandlerOptions,
    invoke: Box<dyn ErasedInvoke>,
    validator: Option<ValidatorFn>,
    required: Vec<DependencyKey>,
    index: usize,
}

impl HandlerDescriptor {
    /// The key this handler is registered under (exact type or supertype).
    pub fn message_key(&self) -> &'static str {
        self.message_key
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Zero-based registration index, stable across the catalog lifetime.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn invoke<'a>(
        &'a self,
        message: AnyMessage,
        ctx: &'a KernelContext,
        deps: &'a DependencyResolver,
    ) -> HandlerFuture<'a> {
        self.invoke.invoke(message, ctx, deps)
    }

    pub(crate) fn validate(&self, message: &AnyMessage, groups: &[String]) -> Vec<Violation> {
        match &self.validator {
            Some(validator) => validator(message, groups),
            None => Vec::new(),
        }
    }

    pub(crate) fn required_dependencies(&self) -> &[DependencyKey] {
        &self.required
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("message_key", &self.message_key)
            .field("index", &self.index)
            .finish()
    }
}

/// The frozen handler catalog.
///
/// Immutable after [`build`](HandlerCatalogBuilder::build); safe to share
/// across tasks.
#[derive(Debug, Default)]
pub struct HandlerCatalog {
    descriptors: Vec<Arc<HandlerDescriptor>>,
}

impl HandlerCatalog {
    pub fn builder() -> HandlerCatalogBuilder {
        HandlerCatalogBuilder {
            descriptors: Vec::new(),
        }
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> &[Arc<HandlerDescriptor>] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Collects handler registrations for a [`HandlerCatalog`].
pub struct HandlerCatalogBuilder {
    descriptors: Vec<Arc<HandlerDescriptor>>,
}

impl HandlerCatalogBuilder {
    /// Register a handler for the concrete message type `M`.
    pub fn register<M, H>(self, handler: H, options: HandlerOptions) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let required = handler.required_dependencies();
        self.push(
            M::TYPE_KEY,
            options,
            Box::new(TypedInvoke {
                handler,
                _marker: PhantomData::<fn() -> M>,
            }),
            None,
            required,
        )
    }

    /// Register a handler for a validatable message type `M`.
    ///
    /// Validation only runs when `options.validate` is set; registering
    /// through this method wires the message's [`Validate`] implementation
    /// into the descriptor.
    pub fn register_validated<M, H>(self, handler: H, options: HandlerOptions) -> Self
    where
        M: Message + Validate,
        H: MessageHandler<M>,
    {
        let required = handler.required_dependencies();
        let validator: ValidatorFn = Box::new(|message: &AnyMessage, groups: &[String]| {
            message
                .downcast_ref::<M>()
                .map(|m| m.validate(groups))
                .unwrap_or_default()
        });
        self.push(
            M::TYPE_KEY,
            options,
            Box::new(TypedInvoke {
                handler,
                _marker: PhantomData::<fn() -> M>,
            }),
            Some(validator),
            required,
        )
    }

    /// Register a handler under a supertype key.
    ///
    /// The handler receives every message whose declared supertype chain
    /// contains `key`, in its erased form.
    pub fn register_under<H>(self, key: &'static str, handler: H, options: HandlerOptions) -> Self
    where
        H: AnyMessageHandler,
    {
        let required = handler.required_dependencies();
        self.push(
            key,
            options,
            Box::new(ErasedHandlerInvoke { handler }),
            None,
            required,
        )
    }

    pub fn build(self) -> HandlerCatalog {
        HandlerCatalog {
            descriptors: self.descriptors,
        }
    }

    fn push(
        mut self,
        message_key: &'static str,
        options: HandlerOptions,
        invoke: Box<dyn ErasedInvoke>,
        validator: Option<ValidatorFn>,
        required: Vec<DependencyKey>,
    ) -> Self {
        let index = self.descriptors.len();
        self.descriptors.push(Arc::new(HandlerDescriptor {
            message_key,
            options,
            invoke,
            validator,
            required,
            index,
        }));
        self
    }
}
