//! Booking lifecycle: creation, lookup and status transitions
//!
//! [`BookingService`] owns `booking-{id}` records. Creation writes the record
//! and then publishes `booking-created` through the [`ReliablePublisher`], so
//! a publish that keeps failing ends up in the reconciliation journal instead
//! of being dropped. Status changes are driven by [`BookingStatusSubscriber`]
//! reacting to payment and refund events.
//!
//! A status change and its announcement are two writes as well. The record
//! carries `status_announced`, and any later trigger for the same status
//! publishes the missing `booking-confirmed` / `booking-cancelled` under an
//! id derived from the booking, so every copy deduplicates.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::state_ext::{StateStoreExt, Update};
use crate::traits::DEFAULT_HANDLER_TIMEOUT;
use crate::{
    BookingCancelled, BookingConfirmed, BookingCreated, BookingError, BookingId, BookingRecord,
    BookingStatus, Concurrency, EventEnvelope, EventHandler, EventPayload, HandlerStats, HotelId,
    IdempotencyKey, ReliablePublisher, RetryPolicy, StateKey, StateStore, StatusTrigger, Topic,
    Transition, ValidationError,
};

/// Command to create a booking
#[derive(Clone, Debug)]
pub struct CreateBooking {
    pub hotel_id: HotelId,
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub total_amount: Decimal,
}

impl CreateBooking {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.check_in >= self.check_out {
            return Err(ValidationError::StayTooShort);
        }
        if self.guests < 1 {
            return Err(ValidationError::NoGuests);
        }
        if self.total_amount.is_sign_negative() && !self.total_amount.is_zero() {
            return Err(ValidationError::NegativeAmount);
        }
        if self.guest_name.trim().is_empty() {
            return Err(ValidationError::Empty("guest name"));
        }
        let email = self.guest_email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(ValidationError::InvalidEmail),
        }
    }
}

pub struct BookingService {
    store: Arc<dyn StateStore>,
    publisher: ReliablePublisher,
    max_write_conflicts: u32,
}

impl BookingService {
    pub fn new(store: Arc<dyn StateStore>, publisher: ReliablePublisher, max_write_conflicts: u32) -> Self {
        Self { store, publisher, max_write_conflicts }
    }

    /// Validate, persist as `Pending`, then announce `booking-created`.
    ///
    /// The record is durable before the event goes out; if publishing keeps
    /// failing the event is journaled for reconciliation and the booking is
    /// still returned.
    pub async fn create_booking(&self, command: CreateBooking) -> Result<BookingRecord, BookingError> {
        command.validate()?;

        let now = Utc::now();
        let record = BookingRecord {
            id: BookingId::new(),
            hotel_id: command.hotel_id,
            guest_name: command.guest_name.trim().to_string(),
            guest_email: command.guest_email.trim().to_string(),
            check_in: command.check_in,
            check_out: command.check_out,
            guests: command.guests,
            total_amount: command.total_amount,
            status: BookingStatus::Pending,
            status_announced: false,
            created_at: now,
            updated_at: now,
        };

        self.store
            .save_json(&StateKey::booking(record.id), &record, Concurrency::FirstWrite)
            .await?;

        let event = EventEnvelope::new(EventPayload::BookingCreated(BookingCreated {
            booking_id: record.id,
            hotel_id: record.hotel_id,
            guest_email: record.guest_email.clone(),
            amount: record.total_amount,
            created_at: record.created_at,
        }));

        match self.publisher.publish(&event).await?.into_result() {
            Ok(attempts) => {
                tracing::info!(booking_id = %record.id, event_id = %event.id, attempts, "Booking created");
            }
            Err(e) => {
                tracing::warn!(booking_id = %record.id, error = %e, "Booking created, announcement deferred");
            }
        }
        Ok(record)
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<BookingRecord, BookingError> {
        self.store
            .get_json::<BookingRecord>(&StateKey::booking(id))
            .await?
            .map(|t| t.value)
            .ok_or_else(|| BookingError::not_found("booking", id))
    }

    /// Move a booking to `Completed` once its check-out date has passed
    pub async fn complete_if_elapsed(
        &self,
        id: BookingId,
        as_of: NaiveDate,
    ) -> Result<BookingRecord, BookingError> {
        self.store
            .update_json::<BookingRecord, BookingRecord, _>(
                &StateKey::booking(id),
                self.max_write_conflicts,
                |current| {
                    let mut record = current.ok_or_else(|| BookingError::not_found("booking", id))?;
                    if as_of < record.check_out {
                        return Ok(Update::Skip(record));
                    }
                    match record.status.apply(StatusTrigger::CheckOutElapsed)? {
                        Transition::Unchanged => Ok(Update::Skip(record)),
                        Transition::Moved(next) => {
                            record.status = next;
                            record.status_announced = false;
                            record.updated_at = Utc::now();
                            Ok(Update::Write(record.clone(), record))
                        }
                    }
                },
            )
            .await
    }
}

/// Booking after a trigger was applied
struct Applied {
    record: BookingRecord,
    moved: bool,
}

/// Drives booking status from payment and refund events
pub struct BookingStatusSubscriber {
    store: Arc<dyn StateStore>,
    publisher: ReliablePublisher,
    max_write_conflicts: u32,
    retry_policy: RetryPolicy,
    timeout: Duration,
    stats: HandlerStats,
}

impl BookingStatusSubscriber {
    pub fn new(
        store: Arc<dyn StateStore>,
        publisher: ReliablePublisher,
        max_write_conflicts: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            max_write_conflicts,
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

    /// Status a trigger leads to when it moves a booking
    fn target(trigger: StatusTrigger) -> Option<BookingStatus> {
        match trigger {
            StatusTrigger::PaymentCompleted => Some(BookingStatus::Confirmed),
            StatusTrigger::RefundProcessed => Some(BookingStatus::Cancelled),
            StatusTrigger::CheckOutElapsed => None,
        }
    }

    /// Apply `trigger` and return the record as it now stands
    async fn transition(&self, booking_id: BookingId, trigger: StatusTrigger) -> Result<Applied, BookingError> {
        self.store
            .update_json::<BookingRecord, Applied, _>(
                &StateKey::booking(booking_id),
                self.max_write_conflicts,
                |current| {
                    // Not visible yet; redelivery will find it
                    let mut record =
                        current.ok_or_else(|| BookingError::not_found("booking", booking_id))?;
                    match record.status.apply(trigger)? {
                        Transition::Unchanged => Ok(Update::Skip(Applied { record, moved: false })),
                        Transition::Moved(next) => {
                            record.status = next;
                            record.status_announced = false;
                            record.updated_at = Utc::now();
                            Ok(Update::Write(record.clone(), Applied { record, moved: true }))
                        }
                    }
                },
            )
            .await
    }

    /// Publish the event for the record's current status, then note it
    async fn announce(&self, record: BookingRecord, refund_amount: Option<Decimal>) -> Result<(), BookingError> {
        let key = IdempotencyKey::for_booking_status(record.id);
        let status = record.status;
        let event = match status {
            BookingStatus::Confirmed => EventEnvelope::with_id(
                key.event_id("booking-confirmed"),
                EventPayload::BookingConfirmed(BookingConfirmed {
                    booking_id: record.id,
                    guest_email: record.guest_email,
                }),
            ),
            BookingStatus::Cancelled => EventEnvelope::with_id(
                key.event_id("booking-cancelled"),
                EventPayload::BookingCancelled(BookingCancelled {
                    booking_id: record.id,
                    guest_email: record.guest_email,
                    refund_amount: refund_amount.unwrap_or(Decimal::ZERO),
                }),
            ),
            _ => return Ok(()),
        };
        self.publisher.publish(&event).await?;

        let booking_id = record.id;
        self.store
            .update_json::<BookingRecord, (), _>(
                &StateKey::booking(booking_id),
                self.max_write_conflicts,
                |current| match current {
                    Some(mut current) if current.status == status && !current.status_announced => {
                        current.status_announced = true;
                        Ok(Update::Write(current, ()))
                    }
                    _ => Ok(Update::Skip(())),
                },
            )
            .await
    }
}

#[async_trait]
impl EventHandler for BookingStatusSubscriber {
    fn name(&self) -> &str {
        "booking-status"
    }

    fn topics(&self) -> &[Topic] {
        &[Topic::PaymentCompleted, Topic::RefundProcessed]
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
        let (booking_id, trigger, refund_amount) = match &event.payload {
            EventPayload::PaymentCompleted(e) => (e.booking_id, StatusTrigger::PaymentCompleted, None),
            EventPayload::RefundProcessed(e) => (e.booking_id, StatusTrigger::RefundProcessed, Some(e.amount)),
            other => {
                return Err(BookingError::Schema {
                    topic: other.topic(),
                    detail: "booking status does not react to this topic".into(),
                })
            }
        };

        let Applied { record, moved } = self.transition(booking_id, trigger).await?;
        if moved {
            tracing::info!(booking_id = %booking_id, status = ?record.status, "Booking status changed");
        }

        let owed = !record.status_announced && Self::target(trigger) == Some(record.status);
        if !owed {
            HandlerStats::bump(&self.stats.duplicate_events);
            tracing::debug!(booking_id = %booking_id, event_id = %event.id, "status already up to date");
            return Ok(());
        }
        if !moved {
            tracing::warn!(booking_id = %booking_id, status = ?record.status, "announcing status left unannounced");
        }
        self.announce(record, refund_amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, stay, Fixture};
    use crate::{PaymentCompleted, ReconciliationJournal, RefundProcessed, StoreError};

    fn command() -> CreateBooking {
        let (check_in, check_out) = stay(2);
        CreateBooking {
            hotel_id: HotelId::new(),
            guest_name: "John Doe".into(),
            guest_email: "john@example.com".into(),
            check_in,
            check_out,
            guests: 2,
            total_amount: Decimal::from(500),
        }
    }

    fn service(f: &Fixture) -> BookingService {
        BookingService::new(f.store.clone(), f.publisher.clone(), 8)
    }

    #[tokio::test]
    async fn test_create_booking_is_pending_and_readable() {
        let f = fixture();
        let booking = service(&f).create_booking(command()).await.unwrap();

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(service(&f).get_booking(booking.id).await.unwrap(), booking);

        let published = f.bus.published_on(Topic::BookingCreated);
        assert_eq!(published.len(), 1);
        match &published[0].payload {
            EventPayload::BookingCreated(e) => {
                assert_eq!(e.booking_id, booking.id);
                assert_eq!(e.amount, Decimal::from(500));
                assert_eq!(e.guest_email, "john@example.com");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_before_any_write() {
        let f = fixture();
        let svc = service(&f);

        let mut bad = command();
        bad.check_out = bad.check_in;
        assert!(matches!(
            svc.create_booking(bad).await,
            Err(BookingError::Validation(ValidationError::StayTooShort))
        ));

        let mut bad = command();
        bad.guests = 0;
        assert!(matches!(
            svc.create_booking(bad).await,
            Err(BookingError::Validation(ValidationError::NoGuests))
        ));

        let mut bad = command();
        bad.total_amount = Decimal::from(-1);
        assert!(matches!(
            svc.create_booking(bad).await,
            Err(BookingError::Validation(ValidationError::NegativeAmount))
        ));

        let mut bad = command();
        bad.guest_email = "nobody".into();
        assert!(svc.create_booking(bad).await.is_err());

        assert!(f.store.is_empty());
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_zero_amount_is_valid() {
        let f = fixture();
        let mut cmd = command();
        cmd.total_amount = Decimal::ZERO;
        assert!(service(&f).create_booking(cmd).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_missing_booking() {
        let f = fixture();
        let err = service(&f).get_booking(BookingId::new()).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "booking", .. }));
    }

    #[tokio::test]
    async fn test_failed_publish_is_journaled_not_dropped() {
        let f = fixture();
        f.bus.fail_next_publishes(10);

        let booking = service(&f).create_booking(command()).await.unwrap();
        assert!(service(&f).get_booking(booking.id).await.is_ok());

        let pending = f.journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.payload.booking_id(), booking.id);
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let f = fixture();
        f.store.fail_next_writes(1);
        let err = service(&f).create_booking(command()).await.unwrap_err();
        assert!(matches!(err, BookingError::Store(StoreError::Unavailable(_))));
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_complete_if_elapsed() {
        let f = fixture();
        let svc = service(&f);
        let booking = svc.create_booking(command()).await.unwrap();

        let before = svc.complete_if_elapsed(booking.id, booking.check_in).await.unwrap();
        assert_eq!(before.status, BookingStatus::Pending);

        let after = svc.complete_if_elapsed(booking.id, booking.check_out).await.unwrap();
        assert_eq!(after.status, BookingStatus::Completed);
        assert_eq!(svc.get_booking(booking.id).await.unwrap().status, BookingStatus::Completed);
    }

    #[tokio::test]
    async fn test_status_follows_payment_then_refund() {
        let f = fixture();
        let svc = service(&f);
        let subscriber = BookingStatusSubscriber::new(f.store.clone(), f.publisher.clone(), 8, RetryPolicy::fixed(2, 1));
        let booking = svc.create_booking(command()).await.unwrap();

        let paid = EventEnvelope::new(EventPayload::PaymentCompleted(PaymentCompleted {
            payment_id: crate::PaymentId::new(),
            booking_id: booking.id,
            amount: booking.total_amount,
        }));
        subscriber.handle(&paid).await.unwrap();
        subscriber.handle(&paid).await.unwrap();
        assert_eq!(svc.get_booking(booking.id).await.unwrap().status, BookingStatus::Confirmed);
        assert_eq!(f.bus.published_on(Topic::BookingConfirmed).len(), 1);

        let refunded = EventEnvelope::new(EventPayload::RefundProcessed(RefundProcessed {
            refund_id: crate::RefundId::new(),
            booking_id: booking.id,
            amount: Decimal::from(200),
        }));
        subscriber.handle(&refunded).await.unwrap();
        assert_eq!(svc.get_booking(booking.id).await.unwrap().status, BookingStatus::Cancelled);

        let cancelled = f.bus.published_on(Topic::BookingCancelled);
        assert_eq!(cancelled.len(), 1);
        match &cancelled[0].payload {
            EventPayload::BookingCancelled(e) => assert_eq!(e.refund_amount, Decimal::from(200)),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(subscriber.stats().snapshot().duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_status_change_without_announcement_is_announced_on_redelivery() {
        let f = fixture();
        let svc = service(&f);
        let subscriber = BookingStatusSubscriber::new(f.store.clone(), f.publisher.clone(), 8, RetryPolicy::fixed(2, 1));
        let booking = svc.create_booking(command()).await.unwrap();

        // The status write lands, then the handler goes away before publishing
        let applied = subscriber.transition(booking.id, StatusTrigger::PaymentCompleted).await.unwrap();
        assert!(applied.moved);
        assert!(!applied.record.status_announced);
        assert!(f.bus.published_on(Topic::BookingConfirmed).is_empty());

        let paid = EventEnvelope::new(EventPayload::PaymentCompleted(PaymentCompleted {
            payment_id: crate::PaymentId::new(),
            booking_id: booking.id,
            amount: booking.total_amount,
        }));
        subscriber.handle(&paid).await.unwrap();
        subscriber.handle(&paid).await.unwrap();

        let confirmed = f.bus.published_on(Topic::BookingConfirmed);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(
            confirmed[0].id,
            IdempotencyKey::for_booking_status(booking.id).event_id("booking-confirmed")
        );
        let stored = svc.get_booking(booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Confirmed);
        assert!(stored.status_announced);
        assert_eq!(subscriber.stats().snapshot().duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_status_event_for_unknown_booking_is_retriable() {
        let f = fixture();
        let subscriber = BookingStatusSubscriber::new(f.store.clone(), f.publisher.clone(), 8, RetryPolicy::fixed(2, 1));
        let paid = EventEnvelope::new(EventPayload::PaymentCompleted(PaymentCompleted {
            payment_id: crate::PaymentId::new(),
            booking_id: BookingId::new(),
            amount: Decimal::ONE,
        }));
        let err = subscriber.handle(&paid).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
