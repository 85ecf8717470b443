//! Message model: commands, events, queries, and their type-erased runtime form.
//!
//! Domain message types are ordinary structs that implement [`Message`],
//! declaring a stable type key, a [`MessageKind`], and an optional chain of
//! supertype keys. At runtime messages travel through the pipeline as
//! [`AnyMessage`] values so the router, context, and saga machinery can
//! handle user-defined types without knowing them at compile time.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The routing class of a message.
///
/// Commands are single-recipient intents, events are broadcast facts, and
/// queries are request/response pairs. The kind decides how
/// [`KernelContext::delivery`](crate::KernelContext::delivery) routes a
/// message: commands and queries go to exactly one endpoint, events fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A single-recipient intent ("do this").
    Command,
    /// A broadcast fact ("this happened").
    Event,
    /// A request expecting a response.
    Query,
}

impl MessageKind {
    /// Stable lowercase label for logs and headers.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Query => "query",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed domain message.
///
/// # Contract
///
/// - `TYPE_KEY` must be unique within a deployment and stable across
///   releases; it is stamped into outgoing package headers and used by the
///   decoder to pick the right deserializer.
/// - [`parent_keys`](Message::parent_keys) declares the supertype chain,
///   most general first. Handlers registered under a parent key also
///   receive this message, before handlers registered under the exact key.
pub trait Message: Any + Send + Sync + 'static {
    /// Stable identifier for this message type (e.g. `"order.placed"`).
    const TYPE_KEY: &'static str;

    /// Whether this is a command, event, or query.
    const KIND: MessageKind;

    /// Declared supertype keys, most general first.
    ///
    /// Defaults to no supertypes.
    fn parent_keys() -> &'static [&'static str] {
        &[]
    }
}

/// A type-erased message instance flowing through the pipeline.
///
/// Carries the compile-time metadata of the concrete [`Message`] type plus
/// the instance itself behind `Arc<dyn Any>`. Cloning is cheap (the payload
/// is shared). Handlers recover the concrete type via
/// [`downcast_ref`](AnyMessage::downcast_ref) or
/// [`downcast_arc`](AnyMessage::downcast_arc).
#[derive(Clone)]
pub struct AnyMessage {
    type_key: &'static str,
    kind: MessageKind,
    parents: &'static [&'static str],
    inner: Arc<dyn Any + Send + Sync>,
}

impl AnyMessage {
    /// Erase a concrete message.
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            type_key: M::TYPE_KEY,
            kind: M::KIND,
            parents: M::parent_keys(),
            inner: Arc::new(message),
        }
    }

    /// The message's stable type key.
    pub fn type_key(&self) -> &'static str {
        self.type_key
    }

    /// The message's routing class.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Declared supertype keys, most general first.
    pub fn parent_keys(&self) -> &'static [&'static str] {
        self.parents
    }

    /// Whether the erased instance is an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.inner.is::<M>()
    }

    /// Borrow the concrete message, if it is an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.inner.downcast_ref::<M>()
    }

    /// Recover a shared handle to the concrete message, if it is an `M`.
    pub fn downcast_arc<M: Message>(&self) -> Option<Arc<M>> {
        self.inner.clone().downcast::<M>().ok()
    }

    /// Whether `key` names this message's type or one of its supertypes.
    pub fn matches(&self, key: &str) -> bool {
        self.type_key == key || self.parents.contains(&key)
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type_key", &self.type_key)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A single input-validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Path of the offending property (e.g. `"customer_id"`).
    pub property: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl Violation {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

/// Input validation for messages that opt into it.
///
/// The executor runs validation before invoking the handler when the
/// handler's options request it, passing the configured validation groups.
/// An empty group list means "all groups".
pub trait Validate {
    /// Validate against the given groups, returning all violations found.
    fn validate(&self, groups: &[String]) -> Vec<Violation>;
}
