//! Error taxonomy for commands and event handlers

use crate::{BookingStatus, BusError, GatewayError, JournalError, StoreError};

/// Errors surfaced by commands and subscribers
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    /// Malformed command, rejected synchronously and never retried
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Box<str> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Optimistic writes kept colliding with concurrent writers
    #[error("gave up on {key} after {attempts} conflicting writes")]
    ConcurrencyExhausted { key: Box<str>, attempts: u32 },

    /// Another caller holds the operation; retry later
    #[error("{key} is being processed by another caller")]
    InProgress { key: Box<str> },

    #[error("booking cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },

    /// Dual write partially applied and publishing did not get through
    #[error("event {event_id} needs reconciliation: {reason}")]
    ReconciliationRequired { event_id: crate::EventId, reason: Box<str> },

    #[error("timed out after {millis}ms during {operation}")]
    Timeout { operation: &'static str, millis: u64 },

    /// An event arrived that this handler has no schema for
    #[error("unexpected payload on {topic}: {detail}")]
    Schema { topic: crate::Topic, detail: Box<str> },
}

impl BookingError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound { entity, id: id.to_string().into_boxed_str() }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Bus(e) => e.is_transient(),
            Self::Gateway(e) => e.is_transient(),
            Self::Journal(_) => true,
            Self::ConcurrencyExhausted { .. } | Self::InProgress { .. } => true,
            Self::Timeout { .. } => true,
            Self::ReconciliationRequired { .. } => true,
            // A referenced record may simply not be visible yet
            Self::NotFound { .. } => true,
            Self::Validation(_) | Self::InvalidTransition { .. } | Self::Schema { .. } => false,
        }
    }
}

/// Reasons a command is rejected before any state is touched
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("check-out must be after check-in")]
    StayTooShort,

    #[error("at least one guest is required")]
    NoGuests,

    #[error("amount must not be negative")]
    NegativeAmount,

    #[error("guest email is not valid")]
    InvalidEmail,

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("refund of {requested} exceeds booking total {total}")]
    RefundExceedsTotal {
        requested: rust_decimal::Decimal,
        total: rust_decimal::Decimal,
    },
}
