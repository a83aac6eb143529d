// Event fan-out with replay-on-subscribe
//
// All delivery for one bus runs on a single worker task fed by an unbounded
// channel. The known-set is updated synchronously under a lock that is also
// held while the command is enqueued, so queue order always matches the order
// in which the known-set changed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use wiring_common::{log_debug, log_error, log_warn, Logger};

/// Bound for anything an [`EventBus`] can carry
pub trait BusItem: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> BusItem for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent<T> {
    Added(T),
    Removed(T),
    Modified(T),
}

impl<T> NodeEvent<T> {
    pub fn item(&self) -> &T {
        match self {
            NodeEvent::Added(item) | NodeEvent::Removed(item) | NodeEvent::Modified(item) => item,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::Added(_) => "ADDED",
            NodeEvent::Removed(_) => "REMOVED",
            NodeEvent::Modified(_) => "MODIFIED",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("{0} was already added")]
    DuplicateAdd(String),

    #[error("{0} was never added")]
    UnknownRemove(String),

    #[error("{0} was never added and cannot be modified")]
    UnknownModify(String),

    #[error("event bus {0} is closed")]
    Closed(String),
}

#[async_trait]
pub trait EventListener<T>: Send + Sync {
    async fn on_event(&self, event: NodeEvent<T>) -> anyhow::Result<()>;
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Command<T> {
    Subscribe {
        id: SubscriptionId,
        listener: Arc<dyn EventListener<T>>,
        replay: Vec<T>,
    },
    Unsubscribe(SubscriptionId),
    Deliver(NodeEvent<T>),
    Flush(oneshot::Sender<()>),
}

struct BusState<T> {
    known: HashSet<T>,
    tx: Option<mpsc::UnboundedSender<Command<T>>>,
}

/// Serialized, replaying fan-out of add/remove/modify events.
///
/// `publish` validates the event against the known-set and returns
/// immediately; listeners run later, one event at a time, in publish order.
/// A listener that fails or panics is logged and skipped.
pub struct EventBus<T: BusItem> {
    name: String,
    state: Arc<Mutex<BusState<T>>>,
    next_id: AtomicU64,
    logger: Arc<Logger>,
}

impl<T: BusItem> EventBus<T> {
    /// Create a bus and spawn its worker. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, logger: Arc<Logger>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(name.clone(), rx, logger.clone()));
        Self {
            name,
            state: Arc::new(Mutex::new(BusState {
                known: HashSet::new(),
                tx: Some(tx),
            })),
            next_id: AtomicU64::new(1),
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a listener; it first receives `Added` for every known item.
    pub fn subscribe(
        &self,
        listener: Arc<dyn EventListener<T>>,
    ) -> Result<SubscriptionId, EventBusError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = self.state.lock();
        let replay: Vec<T> = state.known.iter().cloned().collect();
        log_debug!(
            self.logger,
            "[{}] subscribe {:?}, replaying {} item(s)",
            self.name,
            id,
            replay.len()
        );
        self.send(
            &state,
            Command::Subscribe {
                id,
                listener,
                replay,
            },
        )?;
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let state = self.state.lock();
        if self.send(&state, Command::Unsubscribe(id)).is_err() {
            log_debug!(self.logger, "[{}] unsubscribe after close", self.name);
        }
    }

    pub fn publish(&self, event: NodeEvent<T>) -> Result<(), EventBusError> {
        let mut state = self.state.lock();
        if state.tx.is_none() {
            return Err(EventBusError::Closed(self.name.clone()));
        }
        match &event {
            NodeEvent::Added(item) => {
                if state.known.contains(item) {
                    return Err(EventBusError::DuplicateAdd(item.to_string()));
                }
                state.known.insert(item.clone());
            }
            NodeEvent::Removed(item) => {
                if !state.known.remove(item) {
                    return Err(EventBusError::UnknownRemove(item.to_string()));
                }
            }
            NodeEvent::Modified(item) => {
                if state.known.replace(item.clone()).is_none() {
                    state.known.remove(item);
                    return Err(EventBusError::UnknownModify(item.to_string()));
                }
            }
        }
        log_debug!(
            self.logger,
            "[{}] publish {} {}",
            self.name,
            event.kind(),
            event.item()
        );
        self.send(&state, Command::Deliver(event))
    }

    pub fn add(&self, item: T) -> Result<(), EventBusError> {
        self.publish(NodeEvent::Added(item))
    }

    pub fn remove(&self, item: T) -> Result<(), EventBusError> {
        self.publish(NodeEvent::Removed(item))
    }

    pub fn modify(&self, item: T) -> Result<(), EventBusError> {
        self.publish(NodeEvent::Modified(item))
    }

    pub fn contains(&self, item: &T) -> bool {
        self.state.lock().known.contains(item)
    }

    /// The stored instance equal to `item`, which may differ in non-identity fields
    pub fn get(&self, item: &T) -> Option<T> {
        self.state.lock().known.get(item).cloned()
    }

    pub fn known(&self) -> Vec<T> {
        self.state.lock().known.iter().cloned().collect()
    }

    /// Wait until every event published so far has been delivered
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let state = self.state.lock();
            if self.send(&state, Command::Flush(done_tx)).is_err() {
                return;
            }
        }
        let _ = done_rx.await;
    }

    /// Stop accepting events. Already queued events are still delivered.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.tx.take().is_some() {
            log_debug!(self.logger, "[{}] closed", self.name);
        }
    }

    fn send(&self, state: &BusState<T>, command: Command<T>) -> Result<(), EventBusError> {
        match &state.tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| EventBusError::Closed(self.name.clone())),
            None => Err(EventBusError::Closed(self.name.clone())),
        }
    }
}

async fn run_worker<T: BusItem>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    logger: Arc<Logger>,
) {
    let mut listeners: Vec<(SubscriptionId, Arc<dyn EventListener<T>>)> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Subscribe {
                id,
                listener,
                replay,
            } => {
                for item in replay {
                    deliver(&name, &logger, id, &listener, NodeEvent::Added(item)).await;
                }
                listeners.push((id, listener));
            }
            Command::Unsubscribe(id) => {
                listeners.retain(|(existing, _)| *existing != id);
            }
            Command::Deliver(event) => {
                for (id, listener) in &listeners {
                    deliver(&name, &logger, *id, listener, event.clone()).await;
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log_debug!(logger, "[{name}] worker finished");
}

async fn deliver<T: BusItem>(
    name: &str,
    logger: &Logger,
    id: SubscriptionId,
    listener: &Arc<dyn EventListener<T>>,
    event: NodeEvent<T>,
) {
    let kind = event.kind();
    let item = event.item().to_string();
    let listener = listener.clone();
    // A spawned task isolates panics from the worker loop.
    match tokio::spawn(async move { listener.on_event(event).await }).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log_warn!(
                logger,
                "[{name}] listener {id:?} failed on {kind} {item}: {e:#}"
            );
        }
        Err(e) => {
            log_error!(
                logger,
                "[{name}] listener {id:?} panicked on {kind} {item}: {e}"
            );
        }
    }
}
