//! Item handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tidepool_core::{FailureKind, QueueItem};

/// Error returned by an item handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    kind: FailureKind,
}

impl HandlerError {
    /// Redeliver after backoff while the item has budget.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retriable,
        }
    }

    /// Dead-letter immediately.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::retriable(format!("{err:#}"))
    }
}

/// Processes items of one `item_type`.
///
/// Handlers may run more than once for the same item (crash after the side
/// effect, before completion is recorded), so they must be idempotent. The
/// token fires on shutdown; long handlers should watch it.
#[async_trait::async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem, cancel: &CancellationToken)
    -> Result<(), HandlerError>;
}

/// Adapter for async closures.
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ItemHandler for FnHandler<F>
where
    F: Fn(QueueItem, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        (self.0)(item.clone(), cancel.clone()).await
    }
}

/// Map from `item_type` to handler. Built at startup, then shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ItemHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `item_type`. A later registration for the same
    /// type replaces the earlier one.
    pub fn register(&mut self, item_type: impl Into<String>, handler: Arc<dyn ItemHandler>) {
        let item_type = item_type.into();
        if self.handlers.insert(item_type.clone(), handler).is_some() {
            warn!(item_type = %item_type, "replacing previously registered handler");
        }
    }

    /// Register an async closure as the handler for `item_type`.
    pub fn register_fn<F, Fut>(&mut self, item_type: impl Into<String>, f: F)
    where
        F: Fn(QueueItem, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(item_type, Arc::new(FnHandler(f)));
    }

    /// Exact-match lookup.
    pub fn get(&self, item_type: &str) -> Option<Arc<dyn ItemHandler>> {
        self.handlers.get(item_type).cloned()
    }

    /// Registered types, sorted.
    pub fn item_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("item_types", &self.item_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tidepool_core::NewItem;

    fn item(item_type: &str) -> QueueItem {
        QueueItem::from_new(NewItem::new(item_type, serde_json::json!({})), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn dispatches_by_exact_type() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("email.send", |_item, _cancel| async { Ok(()) });
        registry.register_fn("email.bounce", |_item, _cancel| async {
            Err(HandlerError::permanent("bounced"))
        });

        assert_eq!(registry.item_types(), vec!["email.bounce", "email.send"]);
        assert!(registry.get("email").is_none());
        assert!(registry.get("email.*").is_none());

        let token = CancellationToken::new();
        let ok = registry.get("email.send").unwrap();
        assert!(ok.handle(&item("email.send"), &token).await.is_ok());

        let err = registry
            .get("email.bounce")
            .unwrap()
            .handle(&item("email.bounce"), &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(err.message(), "bounced");
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("t", |_item, _cancel| async {
            Err(HandlerError::retriable("old"))
        });
        registry.register_fn("t", |_item, _cancel| async { Ok(()) });

        assert_eq!(registry.len(), 1);
        let handler = registry.get("t").unwrap();
        assert!(handler.handle(&item("t"), &CancellationToken::new()).await.is_ok());
    }

    #[test]
    fn anyhow_errors_are_retriable_with_context() {
        let err: HandlerError = anyhow::anyhow!("connection reset")
            .context("calling upstream")
            .into();
        assert_eq!(err.kind(), FailureKind::Retriable);
        assert_eq!(err.to_string(), "calling upstream: connection reset");
    }
}
