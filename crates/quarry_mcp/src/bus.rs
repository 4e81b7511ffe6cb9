//! Event Bus - prefix-matched publish/subscribe
//!
//! Decouples cache writers from observers (resource-update notifications,
//! tests, introspection). Delivery is synchronous: every matching handler has
//! run by the time [`EventBus::publish`] returns.
//!
//! Matching is a plain string prefix test, not path-segment aware: a
//! subscription to `"schema"` also sees `"schemas/x"`.
//!
//! A failing or panicking handler is logged and skipped; it never affects
//! delivery to other handlers and never reaches the publisher.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{trace, warn};

/// Topic published by the schema cache whenever a table's entry changes
pub const SCHEMA_UPDATED_TOPIC: &str = "schema.updated";

/// One published event, handed by reference to each matching handler
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub topic: String,
    pub payload: Value,
}

type Handler = Arc<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    /// prefix -> (registration id -> handler)
    subscriptions: RwLock<HashMap<String, HashMap<u64, Handler>>>,
}

/// Shared publish/subscribe hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every topic starting with `prefix`.
    ///
    /// The returned [`Subscription`] removes exactly this registration.
    pub fn subscribe<F>(&self, prefix: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let prefix = prefix.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(prefix.clone())
            .or_default()
            .insert(id, Arc::new(handler));
        trace!("Subscribed #{} to prefix '{}'", id, prefix);

        Subscription {
            registry: Arc::downgrade(&self.inner),
            prefix,
            id,
        }
    }

    /// Deliver `payload` to every handler whose prefix matches `topic`.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        // Snapshot handlers so they can (un)subscribe or publish re-entrantly
        let handlers: Vec<Handler> = {
            let subs = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.iter()
                .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
                .flat_map(|(_, handlers)| handlers.values().cloned())
                .collect()
        };

        if handlers.is_empty() {
            trace!("No subscribers for '{}'", topic);
            return 0;
        }

        let envelope = EventEnvelope {
            topic: topic.to_string(),
            payload,
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Event handler for '{}' failed: {:#}", topic, e),
                Err(_) => warn!("Event handler for '{}' panicked", topic),
            }
        }
        delivered
    }

    /// Total number of live registrations
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }
}

/// Removal capability for one registration.
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`]
/// to remove it. Unsubscribing twice is a no-op.
pub struct Subscription {
    registry: Weak<Registry>,
    prefix: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut subs = registry
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handlers) = subs.get_mut(&self.prefix) {
            if handlers.remove(&self.id).is_some() {
                trace!("Unsubscribed #{} from prefix '{}'", self.id, self.prefix);
            }
            if handlers.is_empty() {
                subs.remove(&self.prefix);
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("prefix", &self.prefix)
            .field("id", &self.id)
            .finish()
    }
}
