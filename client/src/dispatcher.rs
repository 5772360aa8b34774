use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use common::{ServerMessage, ServerTag};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};

/// A message that can be routed by its type tag
pub trait Tagged {
    type Tag: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;
}

impl Tagged for ServerMessage {
    type Tag = ServerTag;

    fn tag(&self) -> ServerTag {
        ServerMessage::tag(self)
    }
}

pub type Handler<M> = Arc<dyn Fn(&M) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry<M: Tagged> {
    next_id: u64,
    handlers: HashMap<M::Tag, Vec<(SubscriptionId, Handler<M>)>>,
    // One-shot response handlers still waiting for their message
    pending: HashSet<SubscriptionId>,
}

impl<M: Tagged> Registry<M> {
    fn allocate_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        self.pending.remove(&id);
        for handlers in self.handlers.values_mut() {
            if let Some(index) = handlers.iter().position(|(handler_id, _)| *handler_id == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }
}

/// Typed fan-out of inbound messages to registered handlers.
///
/// Handlers for one tag run synchronously in registration order. A handler
/// that fails or panics is logged and the remaining handlers still run.
pub struct Dispatcher<M: Tagged> {
    registry: Arc<Mutex<Registry<M>>>,
}

impl<M: Tagged> Clone for Dispatcher<M> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<M: Tagged> Default for Dispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Tagged> Dispatcher<M> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                handlers: HashMap::new(),
                pending: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<M>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, tag: M::Tag, handler: F) -> SubscriptionId
    where
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.allocate_id();
        registry
            .handlers
            .entry(tag)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(id)
    }

    pub fn handler_count(&self, tag: M::Tag) -> usize {
        self.lock().handlers.get(&tag).map_or(0, Vec::len)
    }

    /// Delivers `message` to every handler registered for its tag and
    /// returns how many handlers were invoked
    pub fn publish(&self, message: &M) -> usize {
        let tag = message.tag();
        // Snapshot the list so handlers can subscribe or unsubscribe while running
        let handlers: Vec<(SubscriptionId, Handler<M>)> = match self.lock().handlers.get(&tag) {
            Some(handlers) => handlers.clone(),
            None => Vec::new(),
        };

        if handlers.is_empty() {
            debug!("No handlers for {:?}", tag);
        }

        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Handler {:?} for {:?} failed: {:#}", id, tag, e),
                Err(_) => error!("Handler {:?} for {:?} panicked", id, tag),
            }
        }
        handlers.len()
    }

    /// Drops every outstanding one-shot response handler; their receivers
    /// observe a closed channel
    pub fn fail_pending(&self) {
        let mut registry = self.lock();
        let pending: Vec<SubscriptionId> = registry.pending.drain().collect();
        if !pending.is_empty() {
            debug!("Failing {} pending responses", pending.len());
        }
        for id in pending {
            registry.remove(id);
        }
    }
}

impl<M> Dispatcher<M>
where
    M: Tagged + Clone + Send + 'static,
{
    /// Registers a temporary handler that removes itself after the first
    /// message with `tag`
    pub fn once(&self, tag: M::Tag) -> (SubscriptionId, oneshot::Receiver<M>) {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let registry_ref: Weak<Mutex<Registry<M>>> = Arc::downgrade(&self.registry);

        let mut registry = self.lock();
        let id = registry.allocate_id();
        let handler: Handler<M> = Arc::new(move |message: &M| {
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(message.clone());
            }
            if let Some(registry) = registry_ref.upgrade() {
                registry.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
            }
            Ok(())
        });
        registry.handlers.entry(tag).or_default().push((id, handler));
        registry.pending.insert(id);
        (id, rx)
    }

    /// Registers for the response, runs `send`, and waits up to `wait` for
    /// the first message with `tag`
    pub async fn request<F>(
        &self,
        tag: M::Tag,
        send: F,
        wait: Duration,
        what: &'static str,
    ) -> ClientResult<M>
    where
        F: FnOnce(),
    {
        let (id, rx) = self.once(tag);
        send();
        match timeout(wait, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.unsubscribe(id);
                warn!("Timed out after {:?} waiting for {}", wait, what);
                Err(ClientError::RequestTimeout { what })
            }
        }
    }
}
