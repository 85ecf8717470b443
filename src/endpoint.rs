//! Endpoint routing: mapping outgoing message types to named destinations.
//!
//! An [`Endpoint`] names a transport plus a destination within it. The
//! [`EndpointRouter`] is the frozen table the context consults on every
//! `send`/`publish`: commands and queries must resolve to exactly one
//! endpoint, events fan out to all matches.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{OutgoingPackage, Transport};

/// A named destination: a transport and a destination within it.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    destination: String,
    transport: Arc<dyn Transport>,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Hand an outgoing package to this endpoint's transport.
    pub(crate) async fn deliver(&self, outgoing: OutgoingPackage) -> Result<(), TransportError> {
        self.transport.send(outgoing).await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("destination", &self.destination)
            .finish()
    }
}

/// Frozen table mapping message type keys to endpoints.
#[derive(Debug, Default)]
pub struct EndpointRouter {
    routes: HashMap<String, Vec<Endpoint>>,
}

impl EndpointRouter {
    pub fn builder() -> EndpointRouterBuilder {
        EndpointRouterBuilder {
            routes: HashMap::new(),
        }
    }

    /// Endpoints registered for `type_key`, in registration order.
    pub fn endpoints_for(&self, type_key: &str) -> &[Endpoint] {
        self.routes.get(type_key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct routed type keys.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Collects routes for an [`EndpointRouter`].
pub struct EndpointRouterBuilder {
    routes: HashMap<String, Vec<Endpoint>>,
}

impl EndpointRouterBuilder {
    /// Route message type `M` to `endpoint`.
    pub fn route<M: Message>(self, endpoint: Endpoint) -> Self {
        self.route_key(M::TYPE_KEY, endpoint)
    }

    /// Route an explicit type key to `endpoint`.
    pub fn route_key(mut self, type_key: impl Into<String>, endpoint: Endpoint) -> Self {
        self.routes.entry(type_key.into()).or_default().push(endpoint);
        self
    }

    pub fn build(self) -> EndpointRouter {
        EndpointRouter {
            routes: self.routes,
        }
    }
}
