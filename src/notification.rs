//! Guest notifications
//!
//! Sends one message per `booking-created` and `payment-completed` event.
//! A `notification-sent-{eventId}` receipt is claimed before sending and
//! marked sent afterwards, so concurrent or repeated deliveries of one event
//! produce a single guest-facing message. The claim is a lease: an unsent
//! receipt whose holder went away can be claimed again once it lapses.
//!
//! Sending runs within a budget below the delivery timeout. Send failures
//! are retried with backoff; once retries run out the claim is released and
//! an operational alert is raised. The failure never travels back into the
//! booking workflow. Running out of budget releases the claim and asks for
//! redelivery instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::state_ext::{StateStoreExt, Update};
use crate::traits::DEFAULT_HANDLER_TIMEOUT;
use crate::{
    BookingError, BookingRecord, EventEnvelope, EventHandler, EventId, EventPayload, HandlerStats,
    RecentEvents, RetryPolicy, StateKey, StateStore, Topic, WorkflowObserver,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("notification transport unavailable: {0}")]
    Unavailable(Box<str>),

    #[error("send timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The transport refused the message; resending will not help
    #[error("message rejected: {0}")]
    Rejected(Box<str>),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Outbound channel to guests (email, SMS, ...)
#[async_trait]
pub trait NotificationTransport: Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> Result<(), TransportError>;
}

/// Transport that only writes the message to the log
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, notification: &Notification) -> Result<(), TransportError> {
        tracing::info!(to = %notification.to, subject = %notification.subject, "Notification sent");
        Ok(())
    }
}

/// Durable marker that an event's notification was claimed or sent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceipt {
    pub event_id: EventId,
    pub recipient: String,
    pub claimed_at: DateTime<Utc>,
    /// An unsent claim past this instant belongs to nobody
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    /// The transport accepted the message
    #[serde(default)]
    pub sent: bool,
}

impl NotificationReceipt {
    fn is_held(&self, now: DateTime<Utc>) -> bool {
        !self.sent && self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Optimistic attempts on a receipt
const RECEIPT_WRITE_ATTEMPTS: u32 = 4;

enum Claim {
    Acquired,
    AlreadySent,
}

pub struct NotificationSubscriber {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn NotificationTransport>,
    observer: Arc<dyn WorkflowObserver>,
    recent: RecentEvents,
    send_policy: RetryPolicy,
    send_timeout: Duration,
    retry_policy: RetryPolicy,
    timeout: Duration,
    stats: HandlerStats,
}

impl NotificationSubscriber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn NotificationTransport>,
        observer: Arc<dyn WorkflowObserver>,
        dedupe_capacity: usize,
        send_policy: RetryPolicy,
        send_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            observer,
            recent: RecentEvents::new(dedupe_capacity),
            send_policy,
            send_timeout,
            retry_policy,
            stats: HandlerStats::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Bound each delivery attempt by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn compose(&self, event: &EventEnvelope) -> Result<Notification, BookingError> {
        match &event.payload {
            EventPayload::BookingCreated(created) => Ok(Notification {
                to: created.guest_email.clone(),
                subject: "Booking received".to_string(),
                body: format!(
                    "Your booking {} for {} has been received and is awaiting payment.",
                    created.booking_id, created.amount
                ),
            }),
            EventPayload::PaymentCompleted(paid) => {
                let booking = self
                    .store
                    .get_json::<BookingRecord>(&StateKey::booking(paid.booking_id))
                    .await?
                    .ok_or_else(|| BookingError::not_found("booking", paid.booking_id))?
                    .value;
                Ok(Notification {
                    to: booking.guest_email,
                    subject: "Payment received".to_string(),
                    body: format!(
                        "We received your payment of {} for booking {} ({} to {}).",
                        paid.amount, paid.booking_id, booking.check_in, booking.check_out
                    ),
                })
            }
            other => Err(BookingError::Schema {
                topic: other.topic(),
                detail: "no notification template for this topic".into(),
            }),
        }
    }

    /// Send with retries; returns the last error once attempts run out
    async fn send_with_retry(&self, notification: &Notification) -> Result<u32, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.send_timeout, self.transport.send(notification)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout { millis: self.send_timeout.as_millis() as u64 }),
            };
            let error = match result {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };
            if !error.is_transient() || !self.send_policy.allows_retry(attempt) {
                return Err(error);
            }
            tracing::warn!(to = %notification.to, attempt, error = %error, "notification send failed, retrying");
            HandlerStats::bump(&self.stats.retries);
            tokio::time::sleep(self.send_policy.delay_for_attempt(attempt)).await;
        }
    }

    /// Time allowed for the whole send phase, leaving room inside the
    /// delivery timeout for the receipt writes around it
    fn send_budget(&self) -> Duration {
        self.timeout * 3 / 4
    }

    /// Claim the receipt unless it was sent or another holder's lease is live
    async fn claim(&self, key: &StateKey, event_id: EventId, recipient: &str) -> Result<Claim, BookingError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.send_budget()).unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.store
            .update_json::<NotificationReceipt, Claim, _>(key, RECEIPT_WRITE_ATTEMPTS, |current| match current {
                Some(receipt) if receipt.sent => Ok(Update::Skip(Claim::AlreadySent)),
                Some(receipt) if receipt.is_held(now) => Err(BookingError::InProgress { key: key.as_str().into() }),
                _ => Ok(Update::Write(
                    NotificationReceipt {
                        event_id,
                        recipient: recipient.to_string(),
                        claimed_at: now,
                        claimed_until: Some(now + lease),
                        sent: false,
                    },
                    Claim::Acquired,
                )),
            })
            .await
    }

    async fn mark_sent(&self, key: &StateKey) -> Result<(), BookingError> {
        self.store
            .update_json::<NotificationReceipt, (), _>(key, RECEIPT_WRITE_ATTEMPTS, |current| match current {
                Some(mut receipt) if !receipt.sent => {
                    receipt.sent = true;
                    receipt.claimed_until = None;
                    Ok(Update::Write(receipt, ()))
                }
                _ => Ok(Update::Skip(())),
            })
            .await
    }

    async fn release(&self, key: &StateKey, event_id: EventId) {
        if let Err(e) = self.store.delete(key).await {
            // The lease lapses on its own
            tracing::error!(key = %key, error = %e, "could not release notification claim");
        }
        self.recent.forget(event_id);
    }

    fn duplicate(&self, event: &EventEnvelope) {
        HandlerStats::bump(&self.stats.duplicate_events);
        self.observer.on_duplicate(self.name(), event);
    }
}

#[async_trait]
impl EventHandler for NotificationSubscriber {
    fn name(&self) -> &str {
        "notification"
    }

    fn topics(&self) -> &[Topic] {
        &[Topic::BookingCreated, Topic::PaymentCompleted]
    }

    fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), BookingError> {
        if self.recent.contains(event.id) {
            self.duplicate(event);
            return Ok(());
        }

        let notification = self.compose(event).await?;
        let claim_key = StateKey::notification_sent(event.id);
        if let Claim::AlreadySent = self.claim(&claim_key, event.id, &notification.to).await? {
            self.recent.check_and_mark(event.id);
            self.duplicate(event);
            return Ok(());
        }

        let budget = self.send_budget();
        match tokio::time::timeout(budget, self.send_with_retry(&notification)).await {
            Ok(Ok(attempts)) => {
                self.recent.check_and_mark(event.id);
                if let Err(e) = self.mark_sent(&claim_key).await {
                    // Left unsent, the receipt may be claimed again after its lease
                    tracing::warn!(key = %claim_key, error = %e, "could not record notification as sent");
                }
                tracing::info!(event_id = %event.id, to = %notification.to, attempts, "Guest notified");
            }
            Err(_) => {
                self.release(&claim_key, event.id).await;
                return Err(BookingError::Timeout {
                    operation: "notification send",
                    millis: budget.as_millis() as u64,
                });
            }
            Ok(Err(error)) => {
                // Released so a later redelivery may try again
                self.release(&claim_key, event.id).await;
                HandlerStats::bump(&self.stats.alerts);
                self.observer.on_alert(
                    self.name(),
                    event.topic,
                    &format!("notification to {} not delivered: {}", notification.to, error),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, seed_booking, RecordingTransport};
    use crate::{BookingCreated, BookingId, HotelId, NoOpObserver, PaymentCompleted};
    use rust_decimal::Decimal;

    fn subscriber(store: Arc<dyn StateStore>, transport: Arc<RecordingTransport>) -> NotificationSubscriber {
        NotificationSubscriber::new(
            store,
            transport,
            Arc::new(NoOpObserver),
            64,
            RetryPolicy::fixed(3, 1),
            Duration::from_millis(100),
            RetryPolicy::fixed(2, 1),
        )
    }

    fn created(email: &str) -> EventEnvelope {
        EventEnvelope::new(EventPayload::BookingCreated(BookingCreated {
            booking_id: BookingId::new(),
            hotel_id: HotelId::new(),
            guest_email: email.into(),
            amount: Decimal::from(500),
            created_at: Utc::now(),
        }))
    }

    #[tokio::test]
    async fn test_one_message_per_event() {
        let f = fixture();
        let transport = Arc::new(RecordingTransport::new());
        let notifier = subscriber(f.store.clone(), transport.clone());
        let event = created("a@x.com");

        notifier.handle(&event).await.unwrap();
        notifier.handle(&event).await.unwrap();

        // A second instance only has the durable claim to go on
        let other = subscriber(f.store.clone(), transport.clone());
        other.handle(&event).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(notifier.stats().snapshot().duplicate_events, 1);
        assert_eq!(other.stats().snapshot().duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_payment_message_goes_to_booking_guest() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let transport = Arc::new(RecordingTransport::new());
        let notifier = subscriber(f.store.clone(), transport.clone());

        let paid = EventEnvelope::new(EventPayload::PaymentCompleted(PaymentCompleted {
            payment_id: crate::PaymentId::new(),
            booking_id: booking.id,
            amount: booking.total_amount,
        }));
        notifier.handle(&paid).await.unwrap();
        assert_eq!(transport.sent()[0].to, booking.guest_email);
        assert_eq!(transport.sent()[0].subject, "Payment received");
    }

    #[tokio::test]
    async fn test_transient_send_failures_are_retried() {
        let f = fixture();
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(2);
        let notifier = subscriber(f.store.clone(), transport.clone());

        notifier.handle(&created("a@x.com")).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(notifier.stats().snapshot().retries, 2);
        assert_eq!(notifier.stats().snapshot().alerts, 0);
    }

    #[tokio::test]
    async fn test_send_outliving_delivery_budget_is_redelivered() {
        let f = fixture();
        let transport = Arc::new(RecordingTransport::new());
        transport.stall_next(Duration::from_millis(300));
        let notifier = NotificationSubscriber::new(
            f.store.clone(),
            transport.clone(),
            Arc::new(NoOpObserver),
            64,
            RetryPolicy::fixed(3, 1),
            Duration::from_secs(5),
            RetryPolicy::fixed(2, 1),
        )
        .with_timeout(Duration::from_millis(200));
        let handler: Arc<dyn EventHandler> = Arc::new(notifier);

        let outcome = crate::deliver(&handler, &created("a@x.com"), &NoOpObserver).await;
        assert!(matches!(outcome, crate::DeliveryOutcome::Handled { attempts: 2 }));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.attempts(), 2);

        let stats = handler.stats().snapshot();
        assert_eq!(stats.duplicate_events, 0);
        assert_eq!(stats.alerts, 0);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_taken_over_after_its_lease() {
        let f = fixture();
        let transport = Arc::new(RecordingTransport::new());
        let notifier = subscriber(f.store.clone(), transport.clone());
        let event = created("a@x.com");
        let key = StateKey::notification_sent(event.id);

        // Claimed by an instance that went away mid-send
        let mut receipt = NotificationReceipt {
            event_id: event.id,
            recipient: "a@x.com".into(),
            claimed_at: Utc::now(),
            claimed_until: Some(Utc::now() + chrono::Duration::seconds(60)),
            sent: false,
        };
        f.store.save_json(&key, &receipt, crate::Concurrency::FirstWrite).await.unwrap();

        let err = notifier.handle(&event).await.unwrap_err();
        assert!(matches!(err, BookingError::InProgress { .. }));
        assert!(err.is_retriable());
        assert!(transport.sent().is_empty());

        receipt.claimed_until = Some(Utc::now() - chrono::Duration::seconds(1));
        f.store.save_json(&key, &receipt, crate::Concurrency::LastWriteWins).await.unwrap();

        notifier.handle(&event).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
        let stored = f.store.get_json::<NotificationReceipt>(&key).await.unwrap().unwrap().value;
        assert!(stored.sent);
        assert!(stored.claimed_until.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_send_alerts_and_releases_claim() {
        let f = fixture();
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(3);
        let notifier = subscriber(f.store.clone(), transport.clone());
        let event = created("a@x.com");

        // Not propagated to the caller
        notifier.handle(&event).await.unwrap();
        assert!(transport.sent().is_empty());
        assert_eq!(notifier.stats().snapshot().alerts, 1);
        assert!(f.store.keys_with_prefix("notification-sent-").is_empty());

        // Redelivery gets another chance
        notifier.handle(&event).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
    }
}
