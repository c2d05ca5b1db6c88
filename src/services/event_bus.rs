//! In-process event bus with durable fan-out.
//!
//! Publishers hand an `EventEnvelope` to the bus; the bus persists it to
//! the sink (when configured) before fanning out to subscribers, so replay
//! from the store is authoritative. Each subscriber owns a bounded queue;
//! a subscriber that overflows is disconnected and logged rather than ever
//! blocking publishers. Per `(entity_type, entity_id)` ordering is FIFO
//! because publish is awaited to completion before the next publish for
//! that entity begins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{EntityType, EventEnvelope};

/// Filter over envelope fields. `None` matches everything; `event_type` is
/// a prefix match so `task.` subscribes to the whole namespace.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type_prefix: Option<String>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_entity(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            event_type_prefix: None,
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn for_type_prefix(prefix: impl Into<String>) -> Self {
        Self {
            event_type_prefix: Some(prefix.into()),
            entity_type: None,
            entity_id: None,
        }
    }

    pub fn matches(&self, event: &EventEnvelope) -> bool {
        if let Some(prefix) = &self.event_type_prefix {
            if !event.event_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(entity_type) = self.entity_type {
            if event.entity_type != entity_type {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if &event.entity_id != entity_id {
                return false;
            }
        }
        true
    }
}

/// Persists every published event before subscribers see it.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, event: &EventEnvelope) -> DomainResult<()>;
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sender: mpsc::Sender<EventEnvelope>,
}

/// Receiving half handed to a subscriber.
pub struct EventStream {
    receiver: mpsc::Receiver<EventEnvelope>,
}

impl EventStream {
    /// Next matching event; `None` once disconnected.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.recv().await
    }

    /// Non-blocking variant for draining in tests.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.try_recv().ok()
    }
}

/// Configuration for the bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Bounded per-subscriber queue depth
    pub subscriber_queue_depth: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: 256,
        }
    }
}

/// The in-process publish/subscribe hub.
pub struct EventBus {
    config: EventBusConfig,
    sink: Option<Arc<dyn EventSink>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    published_count: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            sink: None,
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            published_count: AtomicU64::new(0),
        }
    }

    /// Attach the persistence sink. Events are persisted before fan-out.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Register a filtered subscriber with its own bounded queue.
    pub async fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_depth);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.push(Subscriber {
            id,
            filter,
            sender,
        });
        debug!(subscriber_id = id, "event bus subscriber registered");
        EventStream { receiver }
    }

    /// Publish one envelope: persist to the sink, then fan out. Slow
    /// subscribers whose queues are full are disconnected, never waited on.
    pub async fn publish(&self, event: EventEnvelope) -> DomainResult<()> {
        if let Some(sink) = &self.sink {
            sink.persist(&event).await?;
        }
        self.published_count.fetch_add(1, Ordering::Relaxed);

        let mut dropped: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.iter() {
                if !sub.filter.matches(&event) {
                    continue;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber_id = sub.id,
                            event_type = %event.event_type,
                            "subscriber queue overflow, disconnecting"
                        );
                        dropped.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(sub.id);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|s| !dropped.contains(&s.id));
        }

        Ok(())
    }

    /// Number of events published since startup.
    pub fn published_count(&self) -> u64 {
        self.published_count.load(Ordering::Relaxed)
    }

    /// Number of currently connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
