//! Identity types and state-store keys

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the raw UUID value
            pub fn get(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a booking
    BookingId
);
uuid_id!(
    /// Identifier of the hotel a booking is made against
    HotelId
);
uuid_id!(
    /// Identifier of a payment record
    PaymentId
);
uuid_id!(
    /// Identifier of a refund record
    RefundId
);
uuid_id!(
    /// Identifier of a published event, used by consumers as their idempotency key
    EventId
);

/// Key under which an entity is persisted, always `{entityType}-{id}`.
///
/// Deterministic in its inputs so the same entity maps to the same key across
/// process restarts and service instances.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(Box<str>);

impl StateKey {
    /// Compose a key from an entity type and an id
    pub fn new(entity_type: &str, id: impl std::fmt::Display) -> Self {
        Self(format!("{}-{}", entity_type, id).into_boxed_str())
    }

    pub fn booking(id: BookingId) -> Self {
        Self::new("booking", id)
    }

    pub fn payment(id: PaymentId) -> Self {
        Self::new("payment", id)
    }

    pub fn refund(id: RefundId) -> Self {
        Self::new("refund", id)
    }

    /// Running refund total of one booking
    pub fn refund_ledger(booking_id: BookingId) -> Self {
        Self::new("refunds", booking_id)
    }

    /// Loyalty accounts are keyed by the guest's email, case-folded
    pub fn loyalty(guest_email: &str) -> Self {
        Self::new("loyalty", guest_email.trim().to_ascii_lowercase())
    }

    pub fn fraud(booking_id: BookingId) -> Self {
        Self::new("fraud", booking_id)
    }

    pub fn notification_sent(event_id: EventId) -> Self {
        Self::new("notification-sent", event_id)
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateKey({})", self.0)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_stable() {
        let id = BookingId(Uuid::nil());
        assert_eq!(
            StateKey::booking(id).as_str(),
            "booking-00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(StateKey::booking(id), StateKey::booking(id));
        assert!(StateKey::fraud(id).as_str().starts_with("fraud-"));
    }

    #[test]
    fn test_loyalty_key_folds_case() {
        assert_eq!(StateKey::loyalty(" A@X.com"), StateKey::loyalty("a@x.com"));
        assert_eq!(StateKey::loyalty("a@x.com").as_str(), "loyalty-a@x.com");
    }

    #[test]
    fn test_ids_serialize_as_plain_uuid() {
        let id = PaymentId(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
