//! Booking workflow events
//!
//! Every topic has exactly one payload schema. The envelope derives its topic
//! from the payload, and envelopes decoded from the wire are checked for a
//! matching topic before they reach any handler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BookingError, BookingId, EventId, HotelId, PaymentId, RefundId};

/// Pub/sub topics of the booking workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    BookingCreated,
    BookingConfirmed,
    BookingCancelled,
    PaymentCompleted,
    PaymentFailed,
    RefundProcessed,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::BookingCreated,
        Topic::BookingConfirmed,
        Topic::BookingCancelled,
        Topic::PaymentCompleted,
        Topic::PaymentFailed,
        Topic::RefundProcessed,
    ];

    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookingCreated => "booking-created",
            Self::BookingConfirmed => "booking-confirmed",
            Self::BookingCancelled => "booking-cancelled",
            Self::PaymentCompleted => "payment-completed",
            Self::PaymentFailed => "payment-failed",
            Self::RefundProcessed => "refund-processed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCreated {
    pub booking_id: BookingId,
    pub hotel_id: HotelId,
    pub guest_email: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmed {
    pub booking_id: BookingId,
    pub guest_email: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCancelled {
    pub booking_id: BookingId,
    pub guest_email: String,
    pub refund_amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub payment_id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub payment_id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundProcessed {
    pub refund_id: RefundId,
    pub booking_id: BookingId,
    pub amount: Decimal,
}

/// Payload of an event, tagged by its topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EventPayload {
    BookingCreated(BookingCreated),
    BookingConfirmed(BookingConfirmed),
    BookingCancelled(BookingCancelled),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    RefundProcessed(RefundProcessed),
}

impl EventPayload {
    /// Topic this payload is published on
    pub fn topic(&self) -> Topic {
        match self {
            Self::BookingCreated(_) => Topic::BookingCreated,
            Self::BookingConfirmed(_) => Topic::BookingConfirmed,
            Self::BookingCancelled(_) => Topic::BookingCancelled,
            Self::PaymentCompleted(_) => Topic::PaymentCompleted,
            Self::PaymentFailed(_) => Topic::PaymentFailed,
            Self::RefundProcessed(_) => Topic::RefundProcessed,
        }
    }

    /// Booking the event is about
    pub fn booking_id(&self) -> BookingId {
        match self {
            Self::BookingCreated(e) => e.booking_id,
            Self::BookingConfirmed(e) => e.booking_id,
            Self::BookingCancelled(e) => e.booking_id,
            Self::PaymentCompleted(e) => e.booking_id,
            Self::PaymentFailed(e) => e.booking_id,
            Self::RefundProcessed(e) => e.booking_id,
        }
    }
}

/// Event as carried on the bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Consumers' idempotency key; preserved across republishing
    pub id: EventId,
    pub topic: Topic,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Wrap a payload in a fresh envelope
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            topic: payload.topic(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Wrap a payload under a caller-chosen id
    pub fn with_id(id: EventId, payload: EventPayload) -> Self {
        Self { id, ..Self::new(payload) }
    }

    /// Check that the declared topic carries its own schema
    pub fn validate(&self) -> Result<(), BookingError> {
        if self.topic != self.payload.topic() {
            return Err(BookingError::Schema {
                topic: self.topic,
                detail: format!("payload is {}", self.payload.topic()).into_boxed_str(),
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, BookingError> {
        serde_json::to_vec(self).map_err(|e| BookingError::Schema {
            topic: self.topic,
            detail: e.to_string().into_boxed_str(),
        })
    }

    /// Decode an envelope received on `topic` and validate it
    pub fn decode(topic: Topic, bytes: &[u8]) -> Result<Self, BookingError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(|e| BookingError::Schema {
            topic,
            detail: e.to_string().into_boxed_str(),
        })?;
        if envelope.topic != topic {
            return Err(BookingError::Schema {
                topic,
                detail: format!("envelope declares {}", envelope.topic).into_boxed_str(),
            });
        }
        envelope.validate()?;
        Ok(envelope)
    }
}
