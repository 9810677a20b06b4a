//! Payments: idempotent charging and the payment subscriber
//!
//! A payment is addressed by its [`IdempotencyKey`]; the key derives the
//! payment id and therefore the `payment-{id}` state key. Whoever creates that
//! key first owns the charge, and every later call with the same key returns
//! (or resumes) the same record.
//!
//! ```text
//! reserve (Pending) --charge ok--> Completed --refund--> Refunded
//!                   --declined---> Failed --retry same key--> ...
//! ```

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::state_ext::{Created, StateStoreExt, Update};
use crate::traits::DEFAULT_HANDLER_TIMEOUT;
use crate::{
    BookingError, BookingId, BookingRecord, EventEnvelope, EventHandler, EventPayload,
    HandlerStats, IdempotencyKey, PaymentCompleted, PaymentFailed, PaymentId, PaymentRecord,
    PaymentStatus, ReliablePublisher, RetryPolicy, StateKey, StateStore, Topic, ValidationError,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The charge was refused; retrying the same charge will not help
    #[error("charge declined: {0}")]
    Declined(Box<str>),

    #[error("payment gateway unavailable: {0}")]
    Unavailable(Box<str>),

    /// No answer in time; the charge may or may not have gone through
    #[error("charge timed out after {millis}ms")]
    Timeout { millis: u64 },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Default bound on a single gateway charge
pub const DEFAULT_CHARGE_TIMEOUT: Duration = Duration::from_secs(10);

enum Claim {
    Acquired(PaymentRecord),
    /// Settled by someone else in the meantime
    Settled(PaymentRecord),
}

/// External charging capability.
///
/// `payment_id` is stable across retries of one logical payment, so a
/// gateway can use it as its own idempotency key.
#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn charge(&self, payment_id: PaymentId, amount: Decimal, method: &str) -> Result<(), GatewayError>;
}

/// Gateway that approves every charge
pub struct ApprovingGateway;

#[async_trait]
impl PaymentGateway for ApprovingGateway {
    async fn charge(&self, payment_id: PaymentId, amount: Decimal, method: &str) -> Result<(), GatewayError> {
        tracing::debug!(payment_id = %payment_id, amount = %amount, method, "charge approved");
        Ok(())
    }
}

/// Command to pay for a booking
#[derive(Clone, Debug)]
pub struct ProcessPayment {
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub method: String,
    /// Defaults to one payment per booking
    pub idempotency_key: Option<IdempotencyKey>,
}

impl ProcessPayment {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(ValidationError::NegativeAmount);
        }
        if self.method.trim().is_empty() {
            return Err(ValidationError::Empty("payment method"));
        }
        Ok(())
    }

    pub fn key(&self) -> IdempotencyKey {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| IdempotencyKey::for_booking_payment(self.booking_id))
    }
}

pub struct PaymentService {
    store: Arc<dyn StateStore>,
    publisher: ReliablePublisher,
    gateway: Arc<dyn PaymentGateway>,
    max_write_conflicts: u32,
    charge_timeout: Duration,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn StateStore>,
        publisher: ReliablePublisher,
        gateway: Arc<dyn PaymentGateway>,
        max_write_conflicts: u32,
    ) -> Self {
        Self {
            store,
            publisher,
            gateway,
            max_write_conflicts,
            charge_timeout: DEFAULT_CHARGE_TIMEOUT,
        }
    }

    /// Bound each gateway charge by `timeout`.
    ///
    /// Keep this below the subscriber's delivery timeout, otherwise a slow
    /// charge is abandoned with its lease still held.
    pub fn with_charge_timeout(mut self, timeout: Duration) -> Self {
        self.charge_timeout = timeout;
        self
    }

    /// How long one caller may hold an unsettled payment before others may
    /// charge it again. A charge ends within `charge_timeout`, so twice that
    /// only lapses for a holder that went away.
    fn charge_lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.charge_timeout * 2).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Charge for a booking, at most once per idempotency key.
    ///
    /// An existing `Completed` or `Refunded` record is returned unchanged
    /// (its outcome is republished if the first publish never went out).
    /// A `Failed` record is charged again under the same id, as is a
    /// `Pending` one whose charge lease has lapsed. While another caller
    /// holds the lease this returns [`BookingError::InProgress`].
    pub async fn process_payment(&self, command: ProcessPayment) -> Result<PaymentRecord, BookingError> {
        command.validate()?;
        let booking_key = StateKey::booking(command.booking_id);
        if self.store.get_json::<BookingRecord>(&booking_key).await?.is_none() {
            return Err(BookingError::not_found("booking", command.booking_id));
        }

        let key = command.key();
        let payment_id = key.payment_id();
        let state_key = StateKey::payment(payment_id);

        let reserved = PaymentRecord {
            id: payment_id,
            booking_id: command.booking_id,
            amount: command.amount,
            method: command.method.trim().to_string(),
            status: PaymentStatus::Pending,
            attempts: 0,
            failure_reason: None,
            claimed_until: Some(Utc::now() + self.charge_lease()),
            outcome_published: false,
            processed_at: Utc::now(),
        };

        let record = match self.store.create_if_absent(&state_key, reserved).await? {
            Created::New(tagged) => tagged.value,
            Created::Existing(tagged) => match tagged.value.status {
                PaymentStatus::Completed | PaymentStatus::Refunded => {
                    tracing::debug!(payment_id = %payment_id, key = %key, "payment already processed");
                    return self.announce(&key, tagged.value).await;
                }
                PaymentStatus::Pending | PaymentStatus::Failed => match self.claim(&state_key, payment_id).await? {
                    Claim::Acquired(record) => {
                        tracing::info!(payment_id = %payment_id, attempts = record.attempts, status = ?record.status, "charging again");
                        record
                    }
                    Claim::Settled(record) => return self.announce(&key, record).await,
                },
            },
        };

        let charge = self.gateway.charge(payment_id, record.amount, &record.method);
        let outcome = match tokio::time::timeout(self.charge_timeout, charge).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout { millis: self.charge_timeout.as_millis() as u64 }),
        };
        let (status, reason) = match outcome {
            Ok(()) => (PaymentStatus::Completed, None),
            Err(GatewayError::Declined(reason)) => (PaymentStatus::Failed, Some(reason.to_string())),
            Err(e) => {
                // Unsettled; let the next caller with this key try. The
                // gateway sees the same payment id again.
                tracing::warn!(payment_id = %payment_id, error = %e, "charge did not settle");
                self.release(&state_key).await;
                return Err(e.into());
            }
        };

        let record = self
            .store
            .update_json::<PaymentRecord, PaymentRecord, _>(&state_key, self.max_write_conflicts, |current| {
                let mut current = current.ok_or_else(|| BookingError::not_found("payment", payment_id))?;
                if matches!(current.status, PaymentStatus::Completed | PaymentStatus::Refunded) {
                    return Ok(Update::Skip(current));
                }
                current.status = status;
                current.failure_reason = reason.clone();
                current.attempts += 1;
                current.claimed_until = None;
                current.outcome_published = false;
                current.processed_at = Utc::now();
                Ok(Update::Write(current.clone(), current))
            })
            .await?;

        match record.status {
            PaymentStatus::Completed => {
                tracing::info!(payment_id = %payment_id, booking_id = %record.booking_id, amount = %record.amount, "Payment completed");
            }
            PaymentStatus::Failed => {
                tracing::warn!(payment_id = %payment_id, booking_id = %record.booking_id, attempts = record.attempts, "Payment failed");
            }
            _ => {}
        }
        self.announce(&key, record).await
    }

    /// Take the charge lease on an unsettled record
    async fn claim(&self, state_key: &StateKey, payment_id: PaymentId) -> Result<Claim, BookingError> {
        let now = Utc::now();
        let lease = self.charge_lease();
        self.store
            .update_json::<PaymentRecord, Claim, _>(state_key, self.max_write_conflicts, |current| {
                let mut current = current.ok_or_else(|| BookingError::not_found("payment", payment_id))?;
                if matches!(current.status, PaymentStatus::Completed | PaymentStatus::Refunded) {
                    return Ok(Update::Skip(Claim::Settled(current)));
                }
                if current.claimed_until.is_some_and(|until| until > now) {
                    return Err(BookingError::InProgress { key: state_key.as_str().into() });
                }
                current.claimed_until = Some(now + lease);
                Ok(Update::Write(current.clone(), Claim::Acquired(current)))
            })
            .await
    }

    async fn release(&self, state_key: &StateKey) {
        let released = self
            .store
            .update_json::<PaymentRecord, (), _>(state_key, self.max_write_conflicts, |current| match current {
                Some(mut record) if record.claimed_until.is_some() => {
                    record.claimed_until = None;
                    Ok(Update::Write(record, ()))
                }
                _ => Ok(Update::Skip(())),
            })
            .await;
        if let Err(e) = released {
            // The lease lapses on its own
            tracing::warn!(key = %state_key, error = %e, "could not release payment lease");
        }
    }

    /// Publish the record's outcome unless that already happened
    async fn announce(&self, key: &IdempotencyKey, record: PaymentRecord) -> Result<PaymentRecord, BookingError> {
        if record.outcome_published {
            return Ok(record);
        }
        let event = match record.status {
            PaymentStatus::Completed => EventEnvelope::with_id(
                key.event_id("payment-completed"),
                EventPayload::PaymentCompleted(PaymentCompleted {
                    payment_id: record.id,
                    booking_id: record.booking_id,
                    amount: record.amount,
                }),
            ),
            PaymentStatus::Failed => EventEnvelope::with_id(
                key.event_id(&format!("payment-failed-{}", record.attempts)),
                EventPayload::PaymentFailed(PaymentFailed {
                    payment_id: record.id,
                    booking_id: record.booking_id,
                    amount: record.amount,
                    reason: record.failure_reason.clone().unwrap_or_default(),
                }),
            ),
            PaymentStatus::Pending | PaymentStatus::Refunded => return Ok(record),
        };

        // Published or journaled, the event is no longer ours to lose
        self.publisher.publish(&event).await?;

        let attempts = record.attempts;
        self.store
            .update_json::<PaymentRecord, PaymentRecord, _>(
                &StateKey::payment(record.id),
                self.max_write_conflicts,
                |current| {
                    let mut current = current.ok_or_else(|| BookingError::not_found("payment", record.id))?;
                    if current.outcome_published || current.attempts != attempts {
                        return Ok(Update::Skip(current));
                    }
                    current.outcome_published = true;
                    Ok(Update::Write(current.clone(), current))
                },
            )
            .await
    }

    pub async fn get_payment(&self, id: PaymentId) -> Result<PaymentRecord, BookingError> {
        self.store
            .get_json::<PaymentRecord>(&StateKey::payment(id))
            .await?
            .map(|t| t.value)
            .ok_or_else(|| BookingError::not_found("payment", id))
    }

    pub async fn find_payment(&self, key: &IdempotencyKey) -> Result<Option<PaymentRecord>, BookingError> {
        Ok(self
            .store
            .get_json::<PaymentRecord>(&StateKey::payment(key.payment_id()))
            .await?
            .map(|t| t.value))
    }

    /// Mark the booking's default payment refunded. Returns whether it changed.
    pub async fn mark_refunded(&self, booking_id: BookingId) -> Result<bool, BookingError> {
        let payment_id = IdempotencyKey::for_booking_payment(booking_id).payment_id();
        self.store
            .update_json::<PaymentRecord, bool, _>(
                &StateKey::payment(payment_id),
                self.max_write_conflicts,
                |current| match current {
                    Some(mut record) if record.status == PaymentStatus::Completed => {
                        record.status = PaymentStatus::Refunded;
                        record.processed_at = Utc::now();
                        Ok(Update::Write(record, true))
                    }
                    _ => Ok(Update::Skip(false)),
                },
            )
            .await
    }
}

/// Reacts to bookings (auto-capture) and refunds
pub struct PaymentSubscriber {
    service: Arc<PaymentService>,
    topics: Vec<Topic>,
    default_method: String,
    retry_policy: RetryPolicy,
    timeout: Duration,
    stats: HandlerStats,
}

impl PaymentSubscriber {
    pub fn new(
        service: Arc<PaymentService>,
        auto_capture: bool,
        default_method: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let mut topics = vec![Topic::RefundProcessed];
        if auto_capture {
            topics.insert(0, Topic::BookingCreated);
        }
        Self {
            service,
            topics,
            default_method: default_method.into(),
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
}

#[async_trait]
impl EventHandler for PaymentSubscriber {
    fn name(&self) -> &str {
        "payment"
    }

    fn topics(&self) -> &[Topic] {
        &self.topics
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
        match &event.payload {
            EventPayload::BookingCreated(created) => {
                let command = ProcessPayment {
                    booking_id: created.booking_id,
                    amount: created.amount,
                    method: self.default_method.clone(),
                    idempotency_key: None,
                };
                // A declined auto-capture is not retried by redelivery
                if let Some(existing) = self.service.find_payment(&command.key()).await? {
                    if existing.status == PaymentStatus::Failed {
                        HandlerStats::bump(&self.stats.duplicate_events);
                        return Ok(());
                    }
                }
                // A concurrent holder surfaces as `InProgress`, which is
                // retried until the charge settles or its lease lapses
                self.service.process_payment(command).await?;
                Ok(())
            }
            EventPayload::RefundProcessed(refund) => {
                if !self.service.mark_refunded(refund.booking_id).await? {
                    tracing::debug!(booking_id = %refund.booking_id, "no captured payment to mark refunded");
                }
                Ok(())
            }
            other => Err(BookingError::Schema {
                topic: other.topic(),
                detail: "payment does not react to this topic".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, seed_booking, ScriptedGateway};

    fn service(f: &crate::test_support::Fixture, gateway: Arc<dyn PaymentGateway>) -> PaymentService {
        PaymentService::new(f.store.clone(), f.publisher.clone(), gateway, 8)
    }

    fn command(booking_id: BookingId, key: &str) -> ProcessPayment {
        ProcessPayment {
            booking_id,
            amount: Decimal::from(500),
            method: "card".into(),
            idempotency_key: Some(IdempotencyKey::new(key)),
        }
    }

    #[tokio::test]
    async fn test_same_key_charges_once() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let gateway = Arc::new(ScriptedGateway::approving());
        let svc = service(&f, gateway.clone());

        let first = svc.process_payment(command(booking.id, "pi_1")).await.unwrap();
        let second = svc.process_payment(command(booking.id, "pi_1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, PaymentStatus::Completed);
        assert_eq!(f.store.keys_with_prefix("payment-").len(), 1);
        assert_eq!(f.bus.published_on(Topic::PaymentCompleted).len(), 1);
        assert_eq!(gateway.charges(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_with_same_key_charge_once() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let gateway = Arc::new(ScriptedGateway::approving());
        let svc = service(&f, gateway.clone());

        let (a, b) = tokio::join!(
            svc.process_payment(command(booking.id, "pi_c")),
            svc.process_payment(command(booking.id, "pi_c"))
        );
        let outcomes = [a, b];
        assert!(outcomes.iter().any(|r| r.is_ok()));
        for r in &outcomes {
            if let Err(e) = r {
                assert!(matches!(e, BookingError::InProgress { .. }));
            }
        }
        assert_eq!(gateway.charges(), 1);
        assert_eq!(f.bus.published_on(Topic::PaymentCompleted).len(), 1);
    }

    #[tokio::test]
    async fn test_default_key_is_per_booking() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let svc = service(&f, Arc::new(ApprovingGateway));

        let mut cmd = command(booking.id, "unused");
        cmd.idempotency_key = None;
        let record = svc.process_payment(cmd.clone()).await.unwrap();
        assert_eq!(record.id, IdempotencyKey::for_booking_payment(booking.id).payment_id());
        svc.process_payment(cmd).await.unwrap();
        assert_eq!(f.bus.published_on(Topic::PaymentCompleted).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_booking_and_bad_amount() {
        let f = fixture();
        let svc = service(&f, Arc::new(ApprovingGateway));
        assert!(matches!(
            svc.process_payment(command(BookingId::new(), "pi")).await,
            Err(BookingError::NotFound { entity: "booking", .. })
        ));

        let booking = seed_booking(&f, Decimal::from(500)).await;
        let mut cmd = command(booking.id, "pi");
        cmd.amount = Decimal::from(-5);
        assert!(matches!(
            svc.process_payment(cmd).await,
            Err(BookingError::Validation(ValidationError::NegativeAmount))
        ));
        assert!(f.store.keys_with_prefix("payment-").is_empty());
    }

    #[tokio::test]
    async fn test_declined_then_retried_with_same_key() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let gateway = Arc::new(ScriptedGateway::approving());
        gateway.decline_next(1, "insufficient funds");
        let svc = service(&f, gateway.clone());

        let failed = svc.process_payment(command(booking.id, "pi_2")).await.unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("insufficient funds"));
        assert_eq!(f.bus.published_on(Topic::PaymentFailed).len(), 1);

        let retried = svc.process_payment(command(booking.id, "pi_2")).await.unwrap();
        assert_eq!(retried.id, failed.id);
        assert_eq!(retried.status, PaymentStatus::Completed);
        assert_eq!(retried.attempts, 2);
        assert_eq!(f.bus.published_on(Topic::PaymentCompleted).len(), 1);
        assert_eq!(gateway.charges(), 2);
    }

    #[tokio::test]
    async fn test_gateway_outage_is_retriable_and_resumable() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let gateway = Arc::new(ScriptedGateway::approving());
        gateway.fail_next(1);
        let svc = service(&f, gateway.clone());

        let err = svc.process_payment(command(booking.id, "pi_3")).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(f.bus.published().is_empty());

        let record = svc.process_payment(command(booking.id, "pi_3")).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Completed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_slow_charge_times_out_and_releases_lease() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let gateway = Arc::new(ScriptedGateway::approving());
        gateway.stall_next(1, Duration::from_millis(300));
        let svc = service(&f, gateway.clone()).with_charge_timeout(Duration::from_millis(50));

        let err = svc.process_payment(command(booking.id, "pi_slow")).await.unwrap_err();
        assert!(matches!(err, BookingError::Gateway(GatewayError::Timeout { millis: 50 })));
        assert!(err.is_retriable());

        let held = svc.find_payment(&IdempotencyKey::new("pi_slow")).await.unwrap().unwrap();
        assert_eq!(held.status, PaymentStatus::Pending);
        assert!(held.claimed_until.is_none());

        let record = svc.process_payment(command(booking.id, "pi_slow")).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Completed);
        assert_eq!(record.id, held.id);
        assert_eq!(gateway.charges(), 2);
    }

    #[tokio::test]
    async fn test_subscriber_retries_while_charge_is_held() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let svc = Arc::new(service(&f, Arc::new(ApprovingGateway)));
        let subscriber = PaymentSubscriber::new(svc.clone(), true, "card", RetryPolicy::fixed(2, 1));

        // Another instance took the lease and has not settled yet
        let payment_id = IdempotencyKey::for_booking_payment(booking.id).payment_id();
        let held = PaymentRecord {
            id: payment_id,
            booking_id: booking.id,
            amount: booking.total_amount,
            method: "card".into(),
            status: PaymentStatus::Pending,
            attempts: 0,
            failure_reason: None,
            claimed_until: Some(Utc::now() + chrono::Duration::seconds(60)),
            outcome_published: false,
            processed_at: Utc::now(),
        };
        f.store
            .save_json(&StateKey::payment(payment_id), &held, crate::Concurrency::FirstWrite)
            .await
            .unwrap();

        let created = EventEnvelope::new(EventPayload::BookingCreated(crate::BookingCreated {
            booking_id: booking.id,
            hotel_id: booking.hotel_id,
            guest_email: booking.guest_email.clone(),
            amount: booking.total_amount,
            created_at: booking.created_at,
        }));
        let err = subscriber.handle(&created).await.unwrap_err();
        assert!(matches!(err, BookingError::InProgress { .. }));
        assert!(err.is_retriable());
        assert_eq!(subscriber.stats().snapshot().duplicate_events, 0);

        // Once the lease lapses the redelivery charges
        let mut lapsed = held;
        lapsed.claimed_until = Some(Utc::now() - chrono::Duration::seconds(1));
        f.store
            .save_json(&StateKey::payment(payment_id), &lapsed, crate::Concurrency::LastWriteWins)
            .await
            .unwrap();
        subscriber.handle(&created).await.unwrap();
        assert_eq!(svc.get_payment(payment_id).await.unwrap().status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_outcome_is_republished_with_same_event_id() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let svc = service(&f, Arc::new(ApprovingGateway));

        let first = svc.process_payment(command(booking.id, "pi_4")).await.unwrap();
        assert!(first.outcome_published);

        // Simulate a crash between publishing and recording it
        let mut record = first.clone();
        record.outcome_published = false;
        f.store
            .save_json(&StateKey::payment(record.id), &record, crate::Concurrency::LastWriteWins)
            .await
            .unwrap();

        svc.process_payment(command(booking.id, "pi_4")).await.unwrap();
        let published = f.bus.published_on(Topic::PaymentCompleted);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].id, published[1].id);
    }

    #[tokio::test]
    async fn test_subscriber_marks_refunded() {
        let f = fixture();
        let booking = seed_booking(&f, Decimal::from(500)).await;
        let svc = Arc::new(service(&f, Arc::new(ApprovingGateway)));
        let subscriber = PaymentSubscriber::new(svc.clone(), true, "card", RetryPolicy::fixed(2, 1));
        assert_eq!(subscriber.topics(), &[Topic::BookingCreated, Topic::RefundProcessed]);

        let created = EventEnvelope::new(EventPayload::BookingCreated(crate::BookingCreated {
            booking_id: booking.id,
            hotel_id: booking.hotel_id,
            guest_email: booking.guest_email.clone(),
            amount: booking.total_amount,
            created_at: booking.created_at,
        }));
        subscriber.handle(&created).await.unwrap();
        subscriber.handle(&created).await.unwrap();
        assert_eq!(f.bus.published_on(Topic::PaymentCompleted).len(), 1);

        let refunded = EventEnvelope::new(EventPayload::RefundProcessed(crate::RefundProcessed {
            refund_id: crate::RefundId::new(),
            booking_id: booking.id,
            amount: Decimal::from(200),
        }));
        subscriber.handle(&refunded).await.unwrap();
        subscriber.handle(&refunded).await.unwrap();

        let payment_id = IdempotencyKey::for_booking_payment(booking.id).payment_id();
        assert_eq!(svc.get_payment(payment_id).await.unwrap().status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_manual_capture_only_follows_refunds() {
        let f = fixture();
        let svc = Arc::new(service(&f, Arc::new(ApprovingGateway)));
        let subscriber = PaymentSubscriber::new(svc, false, "card", RetryPolicy::default());
        assert_eq!(subscriber.topics(), &[Topic::RefundProcessed]);
    }
}
