//! Persisted records and the booking status machine

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::{BookingError, BookingId, EventId, HotelId, PaymentId, RefundId};

/// Booking lifecycle.
///
/// ```text
/// Pending --PaymentCompleted--> Confirmed --RefundProcessed--> Cancelled
/// Pending --RefundProcessed--> Cancelled
/// Pending|Confirmed --check-out elapsed--> Completed
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

/// What moved a booking's status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusTrigger {
    PaymentCompleted,
    RefundProcessed,
    CheckOutElapsed,
}

/// Outcome of applying a trigger
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Status changes
    Moved(BookingStatus),
    /// Already applied or overtaken by a later state; nothing to write
    Unchanged,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    /// Apply a trigger. Re-applying a trigger, or applying one that a later
    /// state has already overtaken, is `Unchanged` so redelivery converges.
    pub fn apply(self, trigger: StatusTrigger) -> Result<Transition, BookingError> {
        use BookingStatus::*;
        use StatusTrigger::*;

        let next = match (self, trigger) {
            (Pending, PaymentCompleted) => Confirmed,
            (Pending | Confirmed, RefundProcessed) => Cancelled,
            (Pending | Confirmed, CheckOutElapsed) => Completed,
            (Confirmed, PaymentCompleted) => return Ok(Transition::Unchanged),
            (Cancelled, _) => return Ok(Transition::Unchanged),
            (Completed, CheckOutElapsed | PaymentCompleted) => return Ok(Transition::Unchanged),
            (Completed, RefundProcessed) => {
                return Err(BookingError::InvalidTransition { from: Completed, to: Cancelled })
            }
        };
        Ok(Transition::Moved(next))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub id: BookingId,
    pub hotel_id: HotelId,
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub total_amount: Decimal,
    pub status: BookingStatus,
    /// Whether the event for the current status has been handed to the bus
    #[serde(default)]
    pub status_announced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub method: String,
    pub status: PaymentStatus,
    /// Charge attempts made under this record's idempotency key
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// Set while one caller is charging; others back off until it lapses
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    /// Whether the outcome event has been handed to the bus
    pub outcome_published: bool,
    pub processed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    pub id: RefundId,
    pub request_id: String,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub outcome_published: bool,
    pub processed_at: DateTime<Utc>,
}

/// Refunds granted against one booking, so their sum stays within its total
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundLedger {
    pub booking_id: BookingId,
    pub refunded: Decimal,
    pub refunds: Vec<RefundId>,
}

impl RefundLedger {
    pub fn new(booking_id: BookingId) -> Self {
        Self { booking_id, refunded: Decimal::ZERO, refunds: Vec::new() }
    }

    /// Reserve `amount` for `refund_id` within `total`. Returns false if
    /// this refund was already reserved.
    pub fn reserve(&mut self, refund_id: RefundId, amount: Decimal, total: Decimal) -> Result<bool, BookingError> {
        if self.refunds.contains(&refund_id) {
            return Ok(false);
        }
        let requested = self.refunded + amount;
        if requested > total {
            return Err(crate::ValidationError::RefundExceedsTotal { requested, total }.into());
        }
        self.refunded = requested;
        self.refunds.push(refund_id);
        Ok(true)
    }
}

/// Advisory fraud verdict, a pure function of booking id and amount
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudVerdict {
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub flagged: bool,
    pub checked_at: DateTime<Utc>,
}

/// Per-guest points counter with a ledger of the events already applied
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyAccount {
    pub guest_email: String,
    pub points: u64,
    /// Most recent applied event ids, oldest first
    pub applied_events: VecDeque<EventId>,
}

impl LoyaltyAccount {
    pub fn new(guest_email: &str) -> Self {
        Self {
            guest_email: guest_email.trim().to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn has_applied(&self, event_id: EventId) -> bool {
        self.applied_events.contains(&event_id)
    }

    /// Add `delta` for `event_id` unless already applied. Returns whether
    /// the balance changed.
    pub fn accrue(&mut self, event_id: EventId, delta: u64, retention: usize) -> bool {
        if self.has_applied(event_id) {
            return false;
        }
        self.points = self.points.saturating_add(delta);
        self.applied_events.push_back(event_id);
        while self.applied_events.len() > retention.max(1) {
            self.applied_events.pop_front();
        }
        true
    }
}
