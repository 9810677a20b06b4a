//! Core traits for event subscribers

use async_trait::async_trait;
use serde::Deserialize;

use crate::{BookingError, EventEnvelope, HandlerStats, Topic};

/// Per-attempt delivery timeout unless a handler says otherwise
pub const DEFAULT_HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Trait for components that react to workflow events.
///
/// Delivery is at-least-once and unordered, so implementations must
/// converge to the same state no matter how often or in which order an
/// event arrives. A subscriber's failure stays local to that subscriber.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl EventHandler for FraudCheck {
///     fn name(&self) -> &str { "fraud-check" }
///     fn topics(&self) -> &[Topic] { &[Topic::BookingCreated] }
///     fn stats(&self) -> &HandlerStats { &self.stats }
///
///     async fn handle(&self, event: &EventEnvelope) -> Result<(), BookingError> {
///         // evaluate and persist the verdict
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Subscriber name used in logs and statistics
    fn name(&self) -> &str;

    /// Topics this subscriber joins
    fn topics(&self) -> &[Topic];

    /// Counters owned by this subscriber
    fn stats(&self) -> &HandlerStats;

    /// Process one delivery of an event
    async fn handle(&self, event: &EventEnvelope) -> Result<(), BookingError>;

    /// Redelivery policy for failed deliveries
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Timeout for a single delivery attempt
    fn timeout(&self) -> std::time::Duration {
        DEFAULT_HANDLER_TIMEOUT
    }
}

/// Retry policy with capped exponential backoff
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempts and a fixed short delay
    pub fn fixed(max_attempts: u32, delay_millis: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_millis: delay_millis,
            max_delay_millis: delay_millis,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a given attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt == 0 {
            return std::time::Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        std::time::Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
