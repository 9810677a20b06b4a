//! Choreography configuration
//!
//! Loaded from JSON with every field optional, then overridden from
//! `BOOKING_*` environment variables:
//!
//! ```json
//! {
//!   "fraud_threshold": "10000",
//!   "max_write_conflicts": 8,
//!   "publish_retry": { "max_attempts": 5, "initial_delay_millis": 200 },
//!   "auto_capture_payments": true
//! }
//! ```

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChoreographyConfig {
    /// Amounts strictly above this are flagged. Default: 10000.
    pub fraud_threshold: Decimal,
    /// One loyalty point per this many currency units. Default: 10.
    pub loyalty_points_divisor: Decimal,
    /// Event ids remembered per loyalty account. Default: 256.
    pub loyalty_ledger_retention: usize,
    /// Attempts for optimistic read-modify-write. Default: 8.
    pub max_write_conflicts: u32,
    /// Capacity of in-process seen-sets. Default: 1024.
    pub dedupe_capacity: usize,
    pub publish_retry: RetryPolicy,
    pub delivery_retry: RetryPolicy,
    pub notification_retry: RetryPolicy,
    pub store_timeout_millis: u64,
    pub publish_timeout_millis: u64,
    pub handler_timeout_millis: u64,
    pub notification_timeout_millis: u64,
    /// Upper bound on one gateway charge. Default: 10000.
    pub gateway_timeout_millis: u64,
    pub reconcile_interval_millis: u64,
    /// Take payment as soon as a booking is created. Default: true.
    pub auto_capture_payments: bool,
    pub default_payment_method: String,
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            fraud_threshold: Decimal::from(10_000),
            loyalty_points_divisor: Decimal::TEN,
            loyalty_ledger_retention: 256,
            max_write_conflicts: 8,
            dedupe_capacity: 1024,
            publish_retry: RetryPolicy::default(),
            delivery_retry: RetryPolicy::default(),
            notification_retry: RetryPolicy::default(),
            store_timeout_millis: 2000,
            publish_timeout_millis: 2000,
            handler_timeout_millis: 30_000,
            notification_timeout_millis: 5000,
            gateway_timeout_millis: 10_000,
            reconcile_interval_millis: 5000,
            auto_capture_payments: true,
            default_payment_method: "card".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

fn env_override<T: std::str::FromStr>(var: &'static str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *target = value.parse().map_err(|_| ConfigError::Env { var, value })?;
    }
    Ok(())
}

impl ChoreographyConfig {
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(doc)?)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        env_override("BOOKING_FRAUD_THRESHOLD", &mut self.fraud_threshold)?;
        env_override("BOOKING_LOYALTY_POINTS_DIVISOR", &mut self.loyalty_points_divisor)?;
        env_override("BOOKING_LOYALTY_LEDGER_RETENTION", &mut self.loyalty_ledger_retention)?;
        env_override("BOOKING_MAX_WRITE_CONFLICTS", &mut self.max_write_conflicts)?;
        env_override("BOOKING_DEDUPE_CAPACITY", &mut self.dedupe_capacity)?;
        env_override("BOOKING_STORE_TIMEOUT_MILLIS", &mut self.store_timeout_millis)?;
        env_override("BOOKING_PUBLISH_TIMEOUT_MILLIS", &mut self.publish_timeout_millis)?;
        env_override("BOOKING_HANDLER_TIMEOUT_MILLIS", &mut self.handler_timeout_millis)?;
        env_override("BOOKING_NOTIFICATION_TIMEOUT_MILLIS", &mut self.notification_timeout_millis)?;
        env_override("BOOKING_GATEWAY_TIMEOUT_MILLIS", &mut self.gateway_timeout_millis)?;
        env_override("BOOKING_RECONCILE_INTERVAL_MILLIS", &mut self.reconcile_interval_millis)?;
        env_override("BOOKING_AUTO_CAPTURE_PAYMENTS", &mut self.auto_capture_payments)?;
        env_override("BOOKING_DEFAULT_PAYMENT_METHOD", &mut self.default_payment_method)?;
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_millis)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_millis)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_millis)
    }

    /// Gateway bound, capped at half the handler timeout so a slow charge
    /// settles (or is released) before its delivery attempt is abandoned
    pub fn charge_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_millis.min(self.handler_timeout_millis / 2))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChoreographyConfig::default();
        assert_eq!(config.fraud_threshold, Decimal::from(10_000));
        assert_eq!(config.loyalty_points_divisor, Decimal::from(10));
        assert!(config.auto_capture_payments);
        assert_eq!(config.publish_retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_document() {
        let config = ChoreographyConfig::from_json(
            r#"{"fraud_threshold": "500", "publish_retry": {"max_attempts": 9}}"#,
        )
        .unwrap();
        assert_eq!(config.fraud_threshold, Decimal::from(500));
        assert_eq!(config.publish_retry.max_attempts, 9);
        assert_eq!(config.max_write_conflicts, 8);
    }

    #[test]
    fn test_charge_timeout_stays_under_handler_timeout() {
        let mut config = ChoreographyConfig::default();
        assert_eq!(config.charge_timeout(), Duration::from_secs(10));
        config.handler_timeout_millis = 100;
        assert_eq!(config.charge_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("BOOKING_HANDLER_TIMEOUT_MILLIS", "1234");
        std::env::set_var("BOOKING_LOYALTY_LEDGER_RETENTION", "64");
        let config = ChoreographyConfig::from_env().unwrap();
        assert_eq!(config.handler_timeout_millis, 1234);
        assert_eq!(config.loyalty_ledger_retention, 64);

        std::env::set_var("BOOKING_LOYALTY_LEDGER_RETENTION", "lots");
        let err = ChoreographyConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env { var: "BOOKING_LOYALTY_LEDGER_RETENTION", ref value } if value == "lots"
        ));

        std::env::remove_var("BOOKING_HANDLER_TIMEOUT_MILLIS");
        std::env::remove_var("BOOKING_LOYALTY_LEDGER_RETENTION");
    }

    #[test]
    fn test_rejects_bad_document() {
        assert!(matches!(
            ChoreographyConfig::from_json(r#"{"max_write_conflicts": "many"}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
