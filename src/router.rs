//! Router: message instance to ordered executor list.
//!
//! Built once from a frozen [`HandlerCatalog`] and immutable afterwards.
//! Matching is polymorphic over the message's declared supertype chain:
//! supertype handlers run first (chain order, most general first), then
//! handlers of the exact type, ties broken by registration index.

use std::collections::HashMap;

use crate::catalog::HandlerCatalog;
use crate::executor::MessageExecutor;
use crate::message::AnyMessage;

/// Immutable routing table from message type keys to executors.
#[derive(Debug)]
pub struct Router {
    executors: Vec<MessageExecutor>,
    by_key: HashMap<&'static str, Vec<usize>>,
}

impl Router {
    /// Build the routing table from a frozen catalog.
    pub fn new(catalog: HandlerCatalog) -> Self {
        let mut by_key: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (index, descriptor) in catalog.descriptors().iter().enumerate() {
            by_key.entry(descriptor.message_key()).or_default().push(index);
        }
        let executors = catalog
            .descriptors()
            .iter()
            .map(|descriptor| MessageExecutor::new(descriptor.clone()))
            .collect();
        Self { executors, by_key }
    }

    /// Executors matching the message, in deterministic execution order.
    pub fn matches(&self, message: &AnyMessage) -> Vec<MessageExecutor> {
        let keys = message
            .parent_keys()
            .iter()
            .copied()
            .chain(std::iter::once(message.type_key()));

        let mut matched = Vec::new();
        for key in keys {
            if let Some(indices) = self.by_key.get(key) {
                matched.extend(indices.iter().map(|&i| self.executors[i].clone()));
            }
        }
        matched
    }

    /// Total number of registered executors.
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        AnyMessageHandler, HandlerOptions, MessageHandler,
    };
    use crate::context::KernelContext;
    use crate::error::HandlerError;
    use crate::executor::DependencyResolver;
    use crate::message::test_fixtures::{OrderPlaced, PlaceOrder};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct ExactHandler;

    #[async_trait]
    impl MessageHandler<OrderPlaced> for ExactHandler {
        async fn handle(
            &self,
            _message: Arc<OrderPlaced>,
            _ctx: &KernelContext,
            _deps: &DependencyResolver,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct CommandHandler;

    #[async_trait]
    impl MessageHandler<PlaceOrder> for CommandHandler {
        async fn handle(
            &self,
            _message: Arc<PlaceOrder>,
            _ctx: &KernelContext,
            _deps: &DependencyResolver,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct LifecycleHandler;

    #[async_trait]
    impl AnyMessageHandler for LifecycleHandler {
        async fn handle(
            &self,
            _message: AnyMessage,
            _ctx: &KernelContext,
            _deps: &DependencyResolver,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn router() -> Router {
        // Registration order: exact OrderPlaced handler first, then the
        // supertype handler, then an unrelated command handler.
        Router::new(
            HandlerCatalog::builder()
                .register::<OrderPlaced, _>(ExactHandler, HandlerOptions::default())
                .register_under("order.lifecycle", LifecycleHandler, HandlerOptions::default())
                .register::<PlaceOrder, _>(CommandHandler, HandlerOptions::default())
                .build(),
        )
    }

    fn order_placed() -> AnyMessage {
        AnyMessage::new(OrderPlaced {
            order_id: "o-1".to_string(),
        })
    }

    #[test]
    fn supertype_handlers_run_before_exact_handlers() {
        let router = router();
        let matched = router.matches(&order_placed());

        let keys: Vec<&str> = matched
            .iter()
            .map(|e| e.descriptor().message_key())
            .collect();
        assert_eq!(keys, vec!["order.lifecycle", "order.placed"]);
    }

    #[test]
    fn unrelated_handlers_are_excluded() {
        let router = router();
        let matched = router.matches(&AnyMessage::new(PlaceOrder {
            order_id: "o-1".to_string(),
            amount: 1,
        }));

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].descriptor().message_key(), "order.place");
    }

    #[test]
    fn unknown_message_matches_nothing() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Unrelated;
        impl crate::message::Message for Unrelated {
            const TYPE_KEY: &'static str = "unrelated";
            const KIND: crate::message::MessageKind = crate::message::MessageKind::Command;
        }

        let router = router();
        assert!(router.matches(&AnyMessage::new(Unrelated)).is_empty());
    }

    #[test]
    fn match_order_is_deterministic_across_invocations() {
        let router = router();
        let first: Vec<usize> = router
            .matches(&order_placed())
            .iter()
            .map(|e| e.descriptor().index())
            .collect();

        for _ in 0..10 {
            let again: Vec<usize> = router
                .matches(&order_placed())
                .iter()
                .map(|e| e.descriptor().index())
                .collect();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn registration_order_breaks_ties_within_a_key() {
        let router = Router::new(
            HandlerCatalog::builder()
                .register::<OrderPlaced, _>(ExactHandler, HandlerOptions::default())
                .register::<OrderPlaced, _>(ExactHandler, HandlerOptions::default())
                .build(),
        );

        let indices: Vec<usize> = router
            .matches(&order_placed())
            .iter()
            .map(|e| e.descriptor().index())
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn router_reports_size() {
        let router = router();
        assert_eq!(router.len(), 3);
        assert!(!router.is_empty());
        assert!(Router::new(HandlerCatalog::builder().build()).is_empty());
    }
}
