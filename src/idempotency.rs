//! Idempotency keys for commands that must not be applied twice

use crate::{BookingId, EventId, PaymentId, RefundId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving record ids from idempotency keys (UUID v5).
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_b5e2_1c8d_7a90_3e41);

/// Idempotency key identifying one logical operation.
///
/// Repeating an operation with the same key lands on the same record id, so
/// the record's state key doubles as the deduplication marker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    pub fn new(key: impl Into<Box<str>>) -> Self {
        Self(key.into())
    }

    /// Default key for paying a booking: one payment per booking
    pub fn for_booking_payment(booking_id: BookingId) -> Self {
        Self(format!("booking:{}:payment", booking_id).into_boxed_str())
    }

    /// Key for a booking's status announcements; each status is announced
    /// under one event id however many triggers lead to it
    pub fn for_booking_status(booking_id: BookingId) -> Self {
        Self(format!("booking:{}:status", booking_id).into_boxed_str())
    }

    /// Key for a caller-supplied refund request id
    pub fn for_refund_request(request_id: &str) -> Self {
        Self(format!("refund-request:{}", request_id).into_boxed_str())
    }

    /// Payment id this key resolves to
    pub fn payment_id(&self) -> PaymentId {
        PaymentId(self.derive("payment"))
    }

    /// Refund id this key resolves to
    pub fn refund_id(&self) -> RefundId {
        RefundId(self.derive("refund"))
    }

    /// Id for the outcome event `label` of this operation, so a republished
    /// outcome deduplicates against the first one
    pub fn event_id(&self, label: &str) -> EventId {
        EventId(self.derive(&format!("event:{}", label)))
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn derive(&self, entity: &str) -> Uuid {
        Uuid::new_v5(&KEY_NAMESPACE, format!("{}:{}", entity, self.0).as_bytes())
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
