//! Workflow observer trait

use crate::{EventEnvelope, EventId, Topic};

/// Observer for operational signals.
///
/// Asynchronous side effects that fail never reach the original caller;
/// this is where they surface instead.
pub trait WorkflowObserver: Send + Sync + 'static {
    fn on_published(&self, event: &EventEnvelope, attempts: u32);
    fn on_publish_retry(&self, event: &EventEnvelope, attempt: u32, error: &str);
    fn on_reconciliation_required(&self, event: &EventEnvelope, reason: &str);
    fn on_reconciled(&self, event_id: EventId);
    fn on_delivery_failed(&self, handler: &str, event: &EventEnvelope, attempt: u32, error: &str);
    fn on_dead_letter(&self, handler: &str, event: &EventEnvelope, error: &str);
    fn on_duplicate(&self, handler: &str, event: &EventEnvelope);
    fn on_alert(&self, handler: &str, topic: Topic, message: &str);
}

/// No-op observer
pub struct NoOpObserver;

impl WorkflowObserver for NoOpObserver {
    fn on_published(&self, _event: &EventEnvelope, _attempts: u32) {}
    fn on_publish_retry(&self, _event: &EventEnvelope, _attempt: u32, _error: &str) {}
    fn on_reconciliation_required(&self, _event: &EventEnvelope, _reason: &str) {}
    fn on_reconciled(&self, _event_id: EventId) {}
    fn on_delivery_failed(&self, _handler: &str, _event: &EventEnvelope, _attempt: u32, _error: &str) {}
    fn on_dead_letter(&self, _handler: &str, _event: &EventEnvelope, _error: &str) {}
    fn on_duplicate(&self, _handler: &str, _event: &EventEnvelope) {}
    fn on_alert(&self, _handler: &str, _topic: Topic, _message: &str) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn on_published(&self, event: &EventEnvelope, attempts: u32) {
        tracing::debug!(event_id = %event.id, topic = %event.topic, attempts, "Event published");
    }

    fn on_publish_retry(&self, event: &EventEnvelope, attempt: u32, error: &str) {
        tracing::warn!(event_id = %event.id, topic = %event.topic, attempt, error = %error, "Publish failed, retrying");
    }

    fn on_reconciliation_required(&self, event: &EventEnvelope, reason: &str) {
        tracing::error!(
            event_id = %event.id,
            topic = %event.topic,
            booking_id = %event.payload.booking_id(),
            reason = %reason,
            "Publish exhausted, reconciliation required"
        );
    }

    fn on_reconciled(&self, event_id: EventId) {
        tracing::info!(event_id = %event_id, "Reconciled event published");
    }

    fn on_delivery_failed(&self, handler: &str, event: &EventEnvelope, attempt: u32, error: &str) {
        tracing::warn!(handler = %handler, event_id = %event.id, topic = %event.topic, attempt, error = %error, "Delivery failed");
    }

    fn on_dead_letter(&self, handler: &str, event: &EventEnvelope, error: &str) {
        tracing::error!(handler = %handler, event_id = %event.id, topic = %event.topic, error = %error, "Event dead-lettered");
    }

    fn on_duplicate(&self, handler: &str, event: &EventEnvelope) {
        tracing::debug!(handler = %handler, event_id = %event.id, "Duplicate delivery ignored");
    }

    fn on_alert(&self, handler: &str, topic: Topic, message: &str) {
        tracing::error!(handler = %handler, topic = %topic, alert = %message, "Operational alert");
    }
}
