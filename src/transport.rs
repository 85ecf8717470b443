//! Transport envelopes and the broker contract.
//!
//! The core never talks to a concrete broker. It consumes
//! [`IncomingPackage`]s from a [`Transport`] and hands [`OutgoingPackage`]s
//! back to it. [`InMemoryTransport`] is the loopback implementation used by
//! tests and embedded deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Header naming the message type key of a package payload.
///
/// Stamped by the context on every outgoing package and read back by the
/// decoder on the consuming side.
pub const MESSAGE_TYPE_HEADER: &str = "x-sagabus-message-type";

/// Header naming the entry point that produced an outgoing package.
pub const ORIGIN_HEADER: &str = "x-sagabus-origin";

/// An opaque envelope received from a transport.
///
/// Implementations must make [`ack`](IncomingPackage::ack) idempotent and
/// guarantee at most one *terminal* acknowledgement (ack or nack) takes
/// effect per package.
#[async_trait]
pub trait IncomingPackage: Send + Sync {
    /// Unique package id assigned by the transport.
    fn id(&self) -> &str;

    /// Trace id correlating this package's causal chain.
    fn trace_id(&self) -> &str;

    /// Raw payload bytes.
    fn payload(&self) -> &[u8];

    /// Transport headers.
    fn headers(&self) -> &HashMap<String, String>;

    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<(), TransportError>;

    /// Reject the package, optionally requeueing it for redelivery.
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

#[async_trait]
impl<P: IncomingPackage + ?Sized> IncomingPackage for std::sync::Arc<P> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn trace_id(&self) -> &str {
        (**self).trace_id()
    }

    fn payload(&self) -> &[u8] {
        (**self).payload()
    }

    fn headers(&self) -> &HashMap<String, String> {
        (**self).headers()
    }

    async fn ack(&self) -> Result<(), TransportError> {
        (**self).ack().await
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        (**self).nack(requeue).await
    }
}

/// An envelope on its way out to a transport.
#[derive(Debug, Clone)]
pub struct OutgoingPackage {
    /// Named destination within the transport (queue, topic, routing key).
    pub destination: String,
    /// Serialized message payload.
    pub payload: Vec<u8>,
    /// Headers, including [`MESSAGE_TYPE_HEADER`].
    pub headers: HashMap<String, String>,
    /// Trace id propagated from the causing package.
    pub trace_id: String,
    /// Optional broker-side delivery delay.
    pub delivery_delay: Option<Duration>,
}

/// A broker driver: a stream of incoming packages plus an outgoing send.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin consuming.
    ///
    /// Returns the receiving end of the package stream. Dropping the
    /// receiver stops consumption.
    async fn consume(&self) -> Result<mpsc::Receiver<Box<dyn IncomingPackage>>, TransportError>;

    /// Send one outgoing package.
    async fn send(&self, outgoing: OutgoingPackage) -> Result<(), TransportError>;
}

/// Buffer size of the in-memory consume channel.
const CONSUME_BUFFER: usize = 32;

/// Loopback transport holding everything in memory.
///
/// Outgoing packages are appended to an inspectable log; incoming packages
/// are pushed by the test or embedding code via
/// [`push`](InMemoryTransport::push).
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    sent: Mutex<Vec<OutgoingPackage>>,
    incoming: Mutex<Option<mpsc::Sender<Box<dyn IncomingPackage>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every package sent so far, in send order.
    pub fn sent(&self) -> Vec<OutgoingPackage> {
        self.sent.lock().expect("transport lock poisoned").clone()
    }

    /// Sent packages addressed to `destination`.
    pub fn sent_to(&self, destination: &str) -> Vec<OutgoingPackage> {
        self.sent()
            .into_iter()
            .filter(|p| p.destination == destination)
            .collect()
    }

    /// Push a package into the consume stream.
    ///
    /// Returns `false` if nobody is consuming (no [`consume`](Transport::consume)
    /// call yet, or the receiver was dropped).
    pub async fn push(&self, package: Box<dyn IncomingPackage>) -> bool {
        let sender = self
            .incoming
            .lock()
            .expect("transport lock poisoned")
            .clone();
        match sender {
            Some(tx) => tx.send(package).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn consume(&self) -> Result<mpsc::Receiver<Box<dyn IncomingPackage>>, TransportError> {
        let (tx, rx) = mpsc::channel(CONSUME_BUFFER);
        *self.incoming.lock().expect("transport lock poisoned") = Some(tx);
        Ok(rx)
    }

    async fn send(&self, outgoing: OutgoingPackage) -> Result<(), TransportError> {
        self.sent
            .lock()
            .expect("transport lock poisoned")
            .push(outgoing);
        Ok(())
    }
}

/// In-memory [`IncomingPackage`] with acknowledgement counters.
///
/// Tests keep an `Arc` to the package and assert on
/// [`ack_count`](InMemoryIncomingPackage::ack_count) /
/// [`nack_count`](InMemoryIncomingPackage::nack_count) after the pipeline
/// settles.
#[derive(Debug)]
pub struct InMemoryIncomingPackage {
    id: String,
    trace_id: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    acks: AtomicU32,
    nacks: AtomicU32,
    last_requeue: Mutex<Option<bool>>,
}

impl InMemoryIncomingPackage {
    /// Build a package with generated package and trace ids.
    pub fn new(payload: impl Into<Vec<u8>>, headers: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers,
            acks: AtomicU32::new(0),
            nacks: AtomicU32::new(0),
            last_requeue: Mutex::new(None),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Number of `ack` calls observed.
    pub fn ack_count(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    /// Number of `nack` calls observed.
    pub fn nack_count(&self) -> u32 {
        self.nacks.load(Ordering::SeqCst)
    }

    /// The `requeue` flag of the most recent nack, if any.
    pub fn last_requeue(&self) -> Option<bool> {
        *self.last_requeue.lock().expect("package lock poisoned")
    }
}

#[async_trait]
impl IncomingPackage for InMemoryIncomingPackage {
    fn id(&self) -> &str {
        &self.id
    }

    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        *self.last_requeue.lock().expect("package lock poisoned") = Some(requeue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn package(payload: &str) -> InMemoryIncomingPackage {
        InMemoryIncomingPackage::new(payload.as_bytes().to_vec(), HashMap::new())
    }

    #[test]
    fn package_builder_overrides_ids() {
        let pkg = package("x").with_id("p1").with_trace_id("t1");
        assert_eq!(pkg.id(), "p1");
        assert_eq!(pkg.trace_id(), "t1");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = package("x");
        let b = package("x");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[tokio::test]
    async fn ack_and_nack_are_counted() {
        let pkg = package("x");
        pkg.ack().await.unwrap();
        pkg.nack(true).await.unwrap();

        assert_eq!(pkg.ack_count(), 1);
        assert_eq!(pkg.nack_count(), 1);
        assert_eq!(pkg.last_requeue(), Some(true));
    }

    #[tokio::test]
    async fn send_appends_to_the_log() {
        let transport = InMemoryTransport::new();
        transport
            .send(OutgoingPackage {
                destination: "orders".to_string(),
                payload: b"{}".to_vec(),
                headers: HashMap::new(),
                trace_id: "t1".to_string(),
                delivery_delay: None,
            })
            .await
            .unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent_to("orders").len(), 1);
        assert!(transport.sent_to("billing").is_empty());
    }

    #[tokio::test]
    async fn push_reaches_the_consumer() {
        let transport = InMemoryTransport::new();
        let mut rx = transport.consume().await.unwrap();

        let pkg = Arc::new(package("hello").with_id("p-push"));
        assert!(transport.push(Box::new(pkg.clone())).await);

        let received = rx.recv().await.expect("package should arrive");
        assert_eq!(received.id(), "p-push");
        assert_eq!(received.payload(), b"hello");
    }

    #[tokio::test]
    async fn push_without_consumer_is_rejected() {
        let transport = InMemoryTransport::new();
        let pkg = Arc::new(package("x"));
        assert!(!transport.push(Box::new(pkg)).await);
    }

    #[tokio::test]
    async fn push_after_receiver_dropped_is_rejected() {
        let transport = InMemoryTransport::new();
        let rx = transport.consume().await.unwrap();
        drop(rx);

        let pkg = Arc::new(package("x"));
        assert!(!transport.push(Box::new(pkg)).await);
    }
}
