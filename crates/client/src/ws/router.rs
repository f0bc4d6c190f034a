//! Inbound frame classification and listener fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use cinebudget_shared::{ExpenseUpdate, ServerFrame, SyncError};
use tokio::sync::broadcast;

use super::events::Notice;

/// Callback receiving every expense update pushed for the project.
pub type Listener = Arc<dyn Fn(&ExpenseUpdate) -> anyhow::Result<()> + Send + Sync>;

/// Registration handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

/// Ordered set of listeners shared between the facade and the connection task.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        inner.listeners.len() != before
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `update` to every listener in registration order.
    ///
    /// The list is snapshotted first so listeners may add or remove
    /// registrations while being called. A listener that fails or panics is
    /// logged and skipped. Returns how many listeners accepted the update.
    pub fn dispatch(&self, update: &ExpenseUpdate) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.clone()
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(update))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::error!(listener = ?id, error = %e, "expense listener failed"),
                Err(_) => tracing::error!(listener = ?id, "expense listener panicked"),
            }
        }
        delivered
    }
}

/// What the connection task should do with an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Routed {
    Pong,
    ServerError(String),
    Update(ExpenseUpdate),
    /// Not a JSON object; nothing was delivered.
    Dropped(SyncError),
}

/// Classifies inbound frames and fans domain messages out.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    listeners: ListenerRegistry,
    notices: broadcast::Sender<Notice>,
}

impl MessageRouter {
    pub fn new(listeners: ListenerRegistry, notices: broadcast::Sender<Notice>) -> Self {
        Self { listeners, notices }
    }

    /// Route one text frame. Expense updates are delivered to listeners and
    /// server errors are raised as notices before being returned.
    pub(crate) fn route_text(&self, text: &str) -> Routed {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Pong) => Routed::Pong,
            Ok(ServerFrame::ServerError(message)) => {
                tracing::warn!(%message, "server reported an error");
                let _ = self.notices.send(Notice::ServerError(message.clone()));
                Routed::ServerError(message)
            }
            Ok(ServerFrame::ExpenseUpdate(update)) => {
                let delivered = self.listeners.dispatch(&update);
                tracing::debug!(
                    project_id = update.project_id.as_deref().unwrap_or("-"),
                    delivered,
                    "expense update routed"
                );
                Routed::Update(update)
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping inbound frame");
                Routed::Dropped(e)
            }
        }
    }
}
