//! Loyalty points accrual
//!
//! Each `booking-created` adds `floor(amount / divisor)` points to the
//! guest's account. The account document carries a ledger of the event ids
//! already applied, and the increment and the ledger entry commit together in
//! one ETag-conditional write. Redelivery therefore adds nothing, and two
//! bookings for the same guest racing each other both land.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::state_ext::{StateStoreExt, Update};
use crate::traits::DEFAULT_HANDLER_TIMEOUT;
use crate::{
    BookingError, EventEnvelope, EventHandler, EventPayload, HandlerStats, LoyaltyAccount,
    RecentEvents, RetryPolicy, StateKey, StateStore, Topic, WorkflowObserver,
};

pub struct LoyaltyAccrual {
    store: Arc<dyn StateStore>,
    observer: Arc<dyn WorkflowObserver>,
    divisor: Decimal,
    retention: usize,
    max_write_conflicts: u32,
    recent: RecentEvents,
    retry_policy: RetryPolicy,
    timeout: Duration,
    stats: HandlerStats,
}

impl LoyaltyAccrual {
    pub fn new(
        store: Arc<dyn StateStore>,
        observer: Arc<dyn WorkflowObserver>,
        divisor: Decimal,
        retention: usize,
        max_write_conflicts: u32,
        dedupe_capacity: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            observer,
            divisor,
            retention,
            max_write_conflicts,
            recent: RecentEvents::new(dedupe_capacity),
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

    /// Points earned for `amount`, rounded down. Negative amounts earn nothing.
    pub fn points_delta(amount: Decimal, divisor: Decimal) -> u64 {
        if divisor <= Decimal::ZERO {
            return 0;
        }
        (amount / divisor).floor().to_u64().unwrap_or(0)
    }

    /// Current balance; unknown guests have zero
    pub async fn points_for(&self, guest_email: &str) -> Result<u64, BookingError> {
        Ok(self
            .store
            .get_json::<LoyaltyAccount>(&StateKey::loyalty(guest_email))
            .await?
            .map(|t| t.value.points)
            .unwrap_or(0))
    }
}

#[async_trait]
impl EventHandler for LoyaltyAccrual {
    fn name(&self) -> &str {
        "loyalty"
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
                detail: "loyalty only accrues on booking-created".into(),
            });
        };

        // Fast path only; the account ledger is authoritative
        if self.recent.contains(event.id) {
            HandlerStats::bump(&self.stats.duplicate_events);
            self.observer.on_duplicate(self.name(), event);
            return Ok(());
        }

        let delta = Self::points_delta(created.amount, self.divisor);
        let key = StateKey::loyalty(&created.guest_email);
        let retention = self.retention;

        let applied = self
            .store
            .update_json::<LoyaltyAccount, Option<u64>, _>(&key, self.max_write_conflicts, |current| {
                let mut account = current.unwrap_or_else(|| LoyaltyAccount::new(&created.guest_email));
                if account.accrue(event.id, delta, retention) {
                    let points = account.points;
                    Ok(Update::Write(account, Some(points)))
                } else {
                    Ok(Update::Skip(None))
                }
            })
            .await?;
        self.recent.check_and_mark(event.id);

        match applied {
            Some(points) => {
                tracing::info!(
                    guest = %key,
                    booking_id = %created.booking_id,
                    delta,
                    points,
                    "Loyalty points accrued"
                );
            }
            None => {
                HandlerStats::bump(&self.stats.duplicate_events);
                self.observer.on_duplicate(self.name(), event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BookingCreated, BookingId, HotelId, InMemoryStateStore, NoOpObserver};
    use chrono::Utc;

    fn accrual(store: Arc<InMemoryStateStore>) -> LoyaltyAccrual {
        LoyaltyAccrual::new(
            store,
            Arc::new(NoOpObserver),
            Decimal::TEN,
            256,
            16,
            1024,
            RetryPolicy::fixed(2, 1),
        )
    }

    fn created(email: &str, amount: Decimal) -> EventEnvelope {
        EventEnvelope::new(EventPayload::BookingCreated(BookingCreated {
            booking_id: BookingId::new(),
            hotel_id: HotelId::new(),
            guest_email: email.into(),
            amount,
            created_at: Utc::now(),
        }))
    }

    #[test]
    fn test_points_delta_rounds_down() {
        assert_eq!(LoyaltyAccrual::points_delta(Decimal::from(500), Decimal::TEN), 50);
        assert_eq!(LoyaltyAccrual::points_delta(Decimal::new(9999, 2), Decimal::TEN), 9);
        assert_eq!(LoyaltyAccrual::points_delta(Decimal::from(9), Decimal::TEN), 0);
        assert_eq!(LoyaltyAccrual::points_delta(Decimal::from(-50), Decimal::TEN), 0);
        assert_eq!(LoyaltyAccrual::points_delta(Decimal::from(50), Decimal::ZERO), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let store = Arc::new(InMemoryStateStore::new());
        let loyalty = accrual(store.clone());
        let event = created("a@x.com", Decimal::from(500));

        loyalty.handle(&event).await.unwrap();
        let once = loyalty.points_for("a@x.com").await.unwrap();
        loyalty.handle(&event).await.unwrap();
        assert_eq!(loyalty.points_for("a@x.com").await.unwrap(), once);
        assert_eq!(once, 50);
        assert_eq!(loyalty.stats().snapshot().duplicate_events, 1);
    }

    #[tokio::test]
    async fn test_ledger_catches_duplicates_across_instances() {
        let store = Arc::new(InMemoryStateStore::new());
        let first = accrual(store.clone());
        let second = accrual(store.clone());
        let event = created("a@x.com", Decimal::from(500));

        first.handle(&event).await.unwrap();
        second.handle(&event).await.unwrap();
        assert_eq!(first.points_for("a@x.com").await.unwrap(), 50);
        assert_eq!(second.stats().snapshot().duplicate_events, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bookings_for_same_guest_both_land() {
        let store = Arc::new(InMemoryStateStore::new());
        let a = Arc::new(accrual(store.clone()));
        let b = Arc::new(accrual(store.clone()));
        let e500 = created("a@x.com", Decimal::from(500));
        let e300 = created("A@X.com", Decimal::from(300));

        let (ra, rb) = tokio::join!(
            {
                let a = a.clone();
                tokio::spawn(async move { a.handle(&e500).await })
            },
            {
                let b = b.clone();
                tokio::spawn(async move { b.handle(&e300).await })
            }
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        assert_eq!(a.points_for("a@x.com").await.unwrap(), 80);
    }

    #[tokio::test]
    async fn test_unknown_guest_has_no_points() {
        let loyalty = accrual(Arc::new(InMemoryStateStore::new()));
        assert_eq!(loyalty.points_for("nobody@x.com").await.unwrap(), 0);
    }
}
