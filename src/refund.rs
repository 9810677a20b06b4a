//! Refunds, idempotent per caller-supplied request id
//!
//! Every refund is first reserved in the booking's `refunds-{bookingId}`
//! ledger with an ETag-conditional write, so concurrent requests together
//! never refund more than the booking total. The `refund-{id}` record and
//! the `refund-processed` announcement follow.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::state_ext::{Created, StateStoreExt, Update};
use crate::{
    BookingError, BookingId, BookingRecord, BookingStatus, EventEnvelope, EventPayload,
    IdempotencyKey, RefundId, RefundLedger, RefundProcessed, RefundRecord, ReliablePublisher,
    StateKey, StateStore, ValidationError,
};

#[derive(Clone, Debug)]
pub struct ProcessRefund {
    /// Caller's id for this refund request; repeating it refunds once
    pub request_id: String,
    pub booking_id: BookingId,
    pub amount: Decimal,
}

impl ProcessRefund {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.request_id.trim().is_empty() {
            return Err(ValidationError::Empty("refund request id"));
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(ValidationError::NegativeAmount);
        }
        Ok(())
    }
}

pub struct RefundService {
    store: Arc<dyn StateStore>,
    publisher: ReliablePublisher,
    max_write_conflicts: u32,
}

impl RefundService {
    pub fn new(store: Arc<dyn StateStore>, publisher: ReliablePublisher, max_write_conflicts: u32) -> Self {
        Self { store, publisher, max_write_conflicts }
    }

    /// Record a refund and announce `refund-processed`.
    ///
    /// A repeated request id returns the first record, whatever the booking
    /// has moved on to since; its event is only published again if the first
    /// publish never got out.
    pub async fn process_refund(&self, command: ProcessRefund) -> Result<RefundRecord, BookingError> {
        command.validate()?;

        let key = IdempotencyKey::for_refund_request(command.request_id.trim());
        let refund_id = key.refund_id();
        if let Some(existing) = self.store.get_json::<RefundRecord>(&StateKey::refund(refund_id)).await? {
            return self.announce(&key, self.check_reuse(&command, existing.value)).await;
        }

        let booking = self
            .store
            .get_json::<BookingRecord>(&StateKey::booking(command.booking_id))
            .await?
            .ok_or_else(|| BookingError::not_found("booking", command.booking_id))?
            .value;
        if booking.status == BookingStatus::Completed {
            return Err(BookingError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled,
            });
        }

        let (amount, total) = (command.amount, booking.total_amount);
        self.store
            .update_json::<RefundLedger, (), _>(
                &StateKey::refund_ledger(command.booking_id),
                self.max_write_conflicts,
                |current| {
                    let mut ledger = current.unwrap_or_else(|| RefundLedger::new(command.booking_id));
                    if ledger.reserve(refund_id, amount, total)? {
                        Ok(Update::Write(ledger, ()))
                    } else {
                        // Reserved by an earlier attempt that stopped short of the record
                        Ok(Update::Skip(()))
                    }
                },
            )
            .await?;

        let record = RefundRecord {
            id: refund_id,
            request_id: command.request_id.trim().to_string(),
            booking_id: command.booking_id,
            amount: command.amount,
            outcome_published: false,
            processed_at: Utc::now(),
        };

        let record = match self.store.create_if_absent(&StateKey::refund(refund_id), record).await? {
            Created::New(tagged) => {
                tracing::info!(refund_id = %refund_id, booking_id = %command.booking_id, amount = %command.amount, "Refund recorded");
                tagged.value
            }
            Created::Existing(tagged) => self.check_reuse(&command, tagged.value),
        };
        self.announce(&key, record).await
    }

    fn check_reuse(&self, command: &ProcessRefund, existing: RefundRecord) -> RefundRecord {
        if existing.booking_id != command.booking_id || existing.amount != command.amount {
            tracing::warn!(
                request_id = %existing.request_id,
                "refund request id reused with different details; keeping the first"
            );
        }
        existing
    }

    /// Publish `refund-processed` unless that already happened
    async fn announce(&self, key: &IdempotencyKey, record: RefundRecord) -> Result<RefundRecord, BookingError> {
        if record.outcome_published {
            return Ok(record);
        }

        let event = EventEnvelope::with_id(
            key.event_id("refund-processed"),
            EventPayload::RefundProcessed(RefundProcessed {
                refund_id: record.id,
                booking_id: record.booking_id,
                amount: record.amount,
            }),
        );
        self.publisher.publish(&event).await?;

        let refund_id = record.id;
        self.store
            .update_json::<RefundRecord, RefundRecord, _>(
                &StateKey::refund(refund_id),
                self.max_write_conflicts,
                |current| {
                    let mut current = current.ok_or_else(|| BookingError::not_found("refund", refund_id))?;
                    if current.outcome_published {
                        return Ok(Update::Skip(current));
                    }
                    current.outcome_published = true;
                    Ok(Update::Write(current.clone(), current))
                },
            )
            .await
    }

    pub async fn get_refund(&self, id: RefundId) -> Result<RefundRecord, BookingError> {
        self.store
            .get_json::<RefundRecord>(&StateKey::refund(id))
            .await?
            .map(|t| t.value)
            .ok_or_else(|| BookingError::not_found("refund", id))
    }
}
