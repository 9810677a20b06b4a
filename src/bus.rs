//! Publish/subscribe event bus
//!
//! Delivery is at-least-once to every subscriber of a topic, with no
//! ordering promise across topics. A failed publish may still have been
//! delivered, and a successful one may be delivered more than once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::helpers::{deliver, DeliveryOutcome};
use crate::{EventEnvelope, EventHandler, Topic, TracingObserver, WorkflowObserver};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(Box<str>),

    #[error("publish timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// Envelope failed schema validation at the bus boundary
    #[error("event rejected: {0}")]
    Rejected(Box<str>),

    #[error("subscribe failed: {0}")]
    Subscribe(Box<str>),
}

impl BusError {
    /// Transient failures are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Narrow publish capability handed to command handlers
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), BusError>;
}

/// Bus with subscription support
pub trait EventBus: EventPublisher {
    /// Register `handler` for every topic it lists
    fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<(), BusError>;
}

/// Delivery that was given up on
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub handler: Box<str>,
    pub event: EventEnvelope,
    pub error: Box<str>,
    pub attempts: u32,
}

/// In-process bus.
///
/// Each delivery runs on its own task, so subscribers proceed concurrently
/// and independently. Fault injection hooks let tests reproduce lost,
/// ambiguous and duplicated publishes.
pub struct InMemoryEventBus {
    subscribers: std::sync::RwLock<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>,
    observer: Arc<dyn WorkflowObserver>,
    in_flight: std::sync::Mutex<JoinSet<()>>,
    dead_letters: Arc<std::sync::Mutex<Vec<DeadLetter>>>,
    published: std::sync::Mutex<Vec<EventEnvelope>>,
    fail_next: AtomicU32,
    ambiguous_next: AtomicU32,
    extra_deliveries: AtomicU32,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_observer(Arc::new(TracingObserver))
    }

    pub fn with_observer(observer: Arc<dyn WorkflowObserver>) -> Self {
        Self {
            subscribers: std::sync::RwLock::new(HashMap::new()),
            observer,
            in_flight: std::sync::Mutex::new(JoinSet::new()),
            dead_letters: Arc::new(std::sync::Mutex::new(Vec::new())),
            published: std::sync::Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            ambiguous_next: AtomicU32::new(0),
            extra_deliveries: AtomicU32::new(0),
        }
    }

    /// Reject the next `n` publishes without delivering them
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` publishes but report them as failed
    pub fn lose_next_acks(&self, n: u32) {
        self.ambiguous_next.store(n, Ordering::SeqCst);
    }

    /// Deliver every event `1 + n` times to each subscriber
    pub fn duplicate_deliveries(&self, n: u32) {
        self.extra_deliveries.store(n, Ordering::SeqCst);
    }

    /// Events accepted by the bus, in publish order
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn published_on(&self, topic: Topic) -> Vec<EventEnvelope> {
        self.published().into_iter().filter(|e| e.topic == topic).collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Wait until every delivery, including those triggered by events
    /// published from handlers, has finished.
    pub async fn settle(&self) {
        loop {
            let mut batch = match self.in_flight.lock() {
                Ok(mut set) => std::mem::take(&mut *set),
                Err(_) => return,
            };
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "delivery task panicked");
                }
            }
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn dispatch(&self, event: &EventEnvelope) {
        let handlers = self
            .subscribers
            .read()
            .map(|s| s.get(&event.topic).cloned().unwrap_or_default())
            .unwrap_or_default();
        let copies = 1 + self.extra_deliveries.load(Ordering::SeqCst);

        let Ok(mut in_flight) = self.in_flight.lock() else {
            tracing::error!(event_id = %event.id, "delivery queue poisoned");
            return;
        };
        for handler in handlers {
            for _ in 0..copies {
                let handler = handler.clone();
                let event = event.clone();
                let observer = self.observer.clone();
                let dead_letters = self.dead_letters.clone();
                in_flight.spawn(async move {
                    if let DeliveryOutcome::DeadLettered { attempts, error } =
                        deliver(&handler, &event, observer.as_ref()).await
                    {
                        if let Ok(mut dl) = dead_letters.lock() {
                            dl.push(DeadLetter {
                                handler: handler.name().into(),
                                event,
                                error: error.to_string().into_boxed_str(),
                                attempts,
                            });
                        }
                    }
                });
            }
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), BusError> {
        event
            .validate()
            .map_err(|e| BusError::Rejected(e.to_string().into_boxed_str()))?;

        if Self::take_one(&self.fail_next) {
            return Err(BusError::Unavailable("injected publish failure".into()));
        }

        if let Ok(mut published) = self.published.lock() {
            published.push(event.clone());
        }
        self.dispatch(event);

        if Self::take_one(&self.ambiguous_next) {
            return Err(BusError::Timeout { millis: 0 });
        }
        Ok(())
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut subscribers = self
            .subscribers
            .write()
            .map_err(|e| BusError::Subscribe(e.to_string().into_boxed_str()))?;
        for topic in handler.topics() {
            subscribers.entry(*topic).or_default().push(handler.clone());
        }
        tracing::debug!(handler = %handler.name(), topics = ?handler.topics(), "subscribed");
        Ok(())
    }
}
