//! Helper functions for event delivery

use std::sync::Arc;

use crate::{BookingError, EventEnvelope, EventHandler, HandlerStats, WorkflowObserver};

/// Outcome of delivering one event to one subscriber
#[derive(Debug)]
pub enum DeliveryOutcome {
    Handled { attempts: u32 },
    DeadLettered { attempts: u32, error: BookingError },
}

/// Deliver `event` to `handler` with redelivery.
///
/// Each attempt is bounded by the handler's timeout; a timed-out attempt
/// counts as failed but possibly applied, which is safe because handlers are
/// idempotent. Retriable errors are redelivered per the handler's retry
/// policy; terminal errors and exhausted retries are dead-lettered.
pub async fn deliver(
    handler: &Arc<dyn EventHandler>,
    event: &EventEnvelope,
    observer: &dyn WorkflowObserver,
) -> DeliveryOutcome {
    let policy = handler.retry_policy();
    let timeout = handler.timeout();
    let stats = handler.stats();
    HandlerStats::bump(&stats.events_received);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(BookingError::Timeout {
                operation: "event delivery",
                millis: timeout.as_millis() as u64,
            }),
        };

        let error = match result {
            Ok(()) => {
                HandlerStats::bump(&stats.events_handled);
                return DeliveryOutcome::Handled { attempts: attempt };
            }
            Err(error) => error,
        };

        HandlerStats::bump(&stats.failures);
        observer.on_delivery_failed(handler.name(), event, attempt, &error.to_string());

        if !error.is_retriable() || !policy.allows_retry(attempt) {
            HandlerStats::bump(&stats.dead_lettered);
            observer.on_dead_letter(handler.name(), event, &error.to_string());
            return DeliveryOutcome::DeadLettered { attempts: attempt, error };
        }

        HandlerStats::bump(&stats.retries);
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoOpObserver, RetryPolicy, StoreError, Topic, ValidationError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        fail_times: u32,
        calls: AtomicU32,
        terminal: bool,
        stats: HandlerStats,
    }

    impl Flaky {
        fn new(fail_times: u32, terminal: bool) -> Arc<Self> {
            Arc::new(Self { fail_times, calls: AtomicU32::new(0), terminal, stats: HandlerStats::new() })
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn topics(&self) -> &[Topic] {
            &[Topic::PaymentCompleted]
        }
        fn stats(&self) -> &HandlerStats {
            &self.stats
        }
        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::fixed(3, 1)
        }
        async fn handle(&self, _event: &EventEnvelope) -> Result<(), BookingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                if self.terminal {
                    return Err(ValidationError::NoGuests.into());
                }
                return Err(StoreError::Unavailable("down".into()).into());
            }
            Ok(())
        }
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new(crate::EventPayload::PaymentCompleted(crate::PaymentCompleted {
            payment_id: crate::PaymentId::new(),
            booking_id: crate::BookingId::new(),
            amount: rust_decimal::Decimal::from(1),
        }))
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let flaky = Flaky::new(2, false);
        let handler: Arc<dyn EventHandler> = flaky.clone();
        let outcome = deliver(&handler, &event(), &NoOpObserver).await;
        assert!(matches!(outcome, DeliveryOutcome::Handled { attempts: 3 }));

        let stats = flaky.stats.snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.events_handled, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let flaky = Flaky::new(10, false);
        let handler: Arc<dyn EventHandler> = flaky.clone();
        let outcome = deliver(&handler, &event(), &NoOpObserver).await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 3, .. }));
        assert_eq!(flaky.stats.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let flaky = Flaky::new(10, true);
        let handler: Arc<dyn EventHandler> = flaky.clone();
        let outcome = deliver(&handler, &event(), &NoOpObserver).await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 1, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
