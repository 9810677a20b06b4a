//! Advisory fraud screening of new bookings

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::state_ext::{Created, StateStoreExt};
use crate::traits::DEFAULT_HANDLER_TIMEOUT;
use crate::{
    BookingError, BookingId, EventEnvelope, EventHandler, EventPayload, FraudVerdict, HandlerStats,
    RetryPolicy, StateKey, StateStore, Topic,
};

/// Flags bookings above a fixed amount.
///
/// The verdict is a pure function of booking id and amount, so a redelivered
/// `booking-created` recomputes the same answer. Verdicts are recorded under
/// `fraud-{bookingId}` for audit and never hold up payment.
pub struct FraudCheck {
    store: Arc<dyn StateStore>,
    threshold: Decimal,
    retry_policy: RetryPolicy,
    timeout: Duration,
    stats: HandlerStats,
}

impl FraudCheck {
    pub fn new(store: Arc<dyn StateStore>, threshold: Decimal, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            threshold,
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

    /// Strictly above `threshold` is flagged
    pub fn evaluate(booking_id: BookingId, amount: Decimal, threshold: Decimal) -> FraudVerdict {
        FraudVerdict {
            booking_id,
            amount,
            flagged: amount > threshold,
            checked_at: Utc::now(),
        }
    }

    /// `true` when the transaction passes screening
    pub fn check_transaction(&self, booking_id: BookingId, amount: Decimal) -> bool {
        !Self::evaluate(booking_id, amount, self.threshold).flagged
    }

    pub async fn verdict_for(&self, booking_id: BookingId) -> Result<Option<FraudVerdict>, BookingError> {
        Ok(self
            .store
            .get_json::<FraudVerdict>(&StateKey::fraud(booking_id))
            .await?
            .map(|t| t.value))
    }
}

#[async_trait]
impl EventHandler for FraudCheck {
    fn name(&self) -> &str {
        "fraud-check"
    }

    fn topics(&self) -> &[Topic] {
        &[Topic::BookingCreated]
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
        let EventPayload::BookingCreated(created) = &event.payload else {
            return Err(BookingError::Schema {
                topic: event.topic,
                detail: "fraud check only screens booking-created".into(),
            });
        };

        let verdict = Self::evaluate(created.booking_id, created.amount, self.threshold);
        let flagged = verdict.flagged;
        match self.store.create_if_absent(&StateKey::fraud(created.booking_id), verdict).await? {
            Created::New(_) => {
                if flagged {
                    tracing::warn!(booking_id = %created.booking_id, amount = %created.amount, "Booking flagged for review");
                } else {
                    tracing::debug!(booking_id = %created.booking_id, "Booking passed fraud screening");
                }
            }
            Created::Existing(existing) => {
                HandlerStats::bump(&self.stats.duplicate_events);
                if existing.value.flagged != flagged {
                    // Threshold changed since the first verdict; the recorded one stands
                    tracing::warn!(booking_id = %created.booking_id, "recomputed verdict differs from recorded one");
                }
            }
        }
        Ok(())
    }
}
