//! Event system for extraction progress
//!
//! The orchestrator publishes typed events; listeners subscribe per event kind.
//! Every handler returns a future. `publish` runs the handlers of one event
//! concurrently and returns once all of them have settled.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::task::{ExtractedHighlight, Task};

/// Types of events published during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskStarted,
    TaskProgress,
    HighlightFound,
    TaskCompleted,
    TaskCancelled,
    TaskFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::TaskStarted,
        EventKind::TaskProgress,
        EventKind::HighlightFound,
        EventKind::TaskCompleted,
        EventKind::TaskCancelled,
        EventKind::TaskFailed,
    ];
}

/// Event contents. Task-carrying variants hold a snapshot taken at publish time.
#[derive(Debug, Clone)]
pub enum EventPayload {
    TaskStarted {
        task: Task,
    },
    TaskProgress {
        task_id: Uuid,
        /// Overall run progress (0 - 100)
        progress: f32,
        message: String,
    },
    HighlightFound {
        task_id: Uuid,
        highlight: ExtractedHighlight,
    },
    TaskCompleted {
        task: Task,
    },
    TaskCancelled {
        task: Task,
    },
    TaskFailed {
        task: Task,
        error: String,
    },
}

/// A timestamped extraction event
#[derive(Debug, Clone)]
pub struct Event {
    /// When it was created
    pub timestamp: DateTime<Local>,
    /// The event
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Local::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::TaskStarted { .. } => EventKind::TaskStarted,
            EventPayload::TaskProgress { .. } => EventKind::TaskProgress,
            EventPayload::HighlightFound { .. } => EventKind::HighlightFound,
            EventPayload::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventPayload::TaskCancelled { .. } => EventKind::TaskCancelled,
            EventPayload::TaskFailed { .. } => EventKind::TaskFailed,
        }
    }
}

/// Event listener
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self)(event).await
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handlers = Vec<(SubscriptionId, Arc<dyn EventHandler>)>;

/// In-process publish/subscribe keyed by event kind
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Handlers>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler; subscribing the same handler twice calls it twice
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(kind).or_default().push((id, handler));
        id
    }

    /// Register one handler for every event kind
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Vec<(EventKind, SubscriptionId)> {
        EventKind::ALL
            .iter()
            .map(|&kind| (kind, self.subscribe(kind, handler.clone())))
            .collect()
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sid, _)| *sid != id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Number of handlers registered for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every handler of its kind and wait for all of them
    ///
    /// Handler errors and panics are logged and never reach the publisher.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let snapshot: Handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();
        if snapshot.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let mut set = JoinSet::new();
        for (id, handler) in snapshot {
            let event = event.clone();
            set.spawn(async move { (id, handler.handle(event).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!("Handler {:?} for {:?} failed: {:#}", id, kind, e),
                Err(e) => warn!("Handler for {:?} panicked: {}", kind, e),
            }
        }
        debug!("Published {:?}", kind);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
