//! Publish/subscribe registry for investigation requests.
//!
//! UI layers register a handler that starts an investigation from a prompt.
//! Alert notifications carry an action that publishes to every handler
//! registered at the moment the action is invoked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<u64, Handler>>,
}

/// Cloneable handle to a shared set of investigation handlers.
#[derive(Clone, Default)]
pub struct InvestigationHandlers {
    inner: Arc<Registry>,
}

/// Capability returned by [`InvestigationHandlers::register`].
#[must_use = "dropping a Subscription keeps the handler registered; call unregister to remove it"]
pub struct Subscription {
    id: u64,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unregister(self) -> bool {
        let mut handlers = self
            .registry
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.remove(&self.id).is_some()
    }
}

impl InvestigationHandlers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that receives investigation prompts.
    pub fn register<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::new(handler));
        debug!(handler_id = id, "Investigation handler registered");

        Subscription {
            id,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `prompt` to every handler registered right now.
    ///
    /// Handlers run against a snapshot, so a handler may register or
    /// unregister others without deadlocking. Returns the number reached.
    pub fn publish(&self, prompt: &str) -> usize {
        let snapshot: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        if snapshot.is_empty() {
            warn!("Investigation requested but no handler is registered");
            return 0;
        }

        for handler in &snapshot {
            handler(prompt);
        }
        snapshot.len()
    }
}

impl std::fmt::Debug for InvestigationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvestigationHandlers")
            .field("registered", &self.len())
            .finish()
    }
}
