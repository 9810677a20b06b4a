//! Reliable publishing across the state-write / event-publish boundary
//!
//! A state write and the publish that announces it share no transaction.
//! [`ReliablePublisher`] retries the publish with capped exponential backoff,
//! each attempt bounded by a timeout. When the retries run out the event is
//! written to the [`ReconciliationJournal`] and [`Reconciler`] keeps trying
//! in the background, reusing the original event id so consumers still
//! deduplicate it.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    BookingError, BusError, EventEnvelope, EventId, EventPublisher, ReconciliationJournal,
    RetryPolicy, WorkflowObserver,
};

/// How a publish ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { attempts: u32 },
    /// Handed over to the reconciliation journal
    Deferred { event_id: EventId, reason: Box<str> },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    /// Attempts taken, or [`BookingError::ReconciliationRequired`] if the
    /// event is waiting in the journal
    pub fn into_result(self) -> Result<u32, BookingError> {
        match self {
            Self::Published { attempts } => Ok(attempts),
            Self::Deferred { event_id, reason } => Err(BookingError::ReconciliationRequired { event_id, reason }),
        }
    }
}

#[derive(Clone)]
pub struct ReliablePublisher {
    bus: Arc<dyn EventPublisher>,
    journal: Arc<dyn ReconciliationJournal>,
    observer: Arc<dyn WorkflowObserver>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ReliablePublisher {
    pub fn new(
        bus: Arc<dyn EventPublisher>,
        journal: Arc<dyn ReconciliationJournal>,
        observer: Arc<dyn WorkflowObserver>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self { bus, journal, observer, policy, timeout }
    }

    pub fn journal(&self) -> &Arc<dyn ReconciliationJournal> {
        &self.journal
    }

    /// Publish once, bounded by the timeout
    async fn attempt(&self, event: &EventEnvelope) -> Result<(), BusError> {
        match tokio::time::timeout(self.timeout, self.bus.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout { millis: self.timeout.as_millis() as u64 }),
        }
    }

    /// Publish with retries and no journal fallback
    pub async fn try_publish(&self, event: &EventEnvelope) -> Result<u32, BusError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.attempt(event).await {
                Ok(()) => {
                    self.observer.on_published(event, attempt);
                    return Ok(attempt);
                }
                Err(e) => e,
            };
            if !error.is_transient() || !self.policy.allows_retry(attempt) {
                return Err(error);
            }
            self.observer.on_publish_retry(event, attempt, &error.to_string());
            tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
        }
    }

    /// Publish, falling back to the reconciliation journal.
    ///
    /// Only fails if the event could neither be published nor journaled.
    pub async fn publish(&self, event: &EventEnvelope) -> Result<PublishOutcome, BookingError> {
        match self.try_publish(event).await {
            Ok(attempts) => Ok(PublishOutcome::Published { attempts }),
            Err(BusError::Rejected(reason)) => Err(BookingError::Schema {
                topic: event.topic,
                detail: reason,
            }),
            Err(error) => {
                let reason = error.to_string();
                self.journal.append(event.clone(), &reason)?;
                self.observer.on_reconciliation_required(event, &reason);
                Ok(PublishOutcome::Deferred { event_id: event.id, reason: reason.into_boxed_str() })
            }
        }
    }
}

/// Result of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub published: usize,
    pub still_pending: usize,
}

/// Relay draining the reconciliation journal
pub struct Reconciler {
    publisher: ReliablePublisher,
}

impl Reconciler {
    pub fn new(publisher: ReliablePublisher) -> Self {
        Self { publisher }
    }

    /// Try every pending entry once
    pub async fn run_once(&self) -> Result<ReconcileReport, BookingError> {
        let journal = self.publisher.journal();
        let mut report = ReconcileReport::default();

        for entry in journal.pending()? {
            match self.publisher.try_publish(&entry.event).await {
                Ok(_) => {
                    journal.resolve(entry.event.id)?;
                    self.publisher.observer.on_reconciled(entry.event.id);
                    report.published += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %entry.event.id,
                        relay_attempts = entry.relay_attempts + 1,
                        error = %e,
                        "reconciliation attempt failed"
                    );
                    journal.record_attempt(entry.event.id, &e.to_string())?;
                    report.still_pending += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` flips to `true`
    pub fn spawn(
        self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "reconciliation pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("reconciler stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
