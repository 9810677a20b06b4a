//! Fixtures and fakes for exercising the choreography in tests

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::state_ext::StateStoreExt;
use crate::{
    BookingId, BookingRecord, BookingStatus, ChoreographyConfig, Concurrency, GatewayError,
    HotelId, InMemoryEventBus, InMemoryJournal, InMemoryStateStore, Notification,
    NotificationTransport, PaymentGateway, PaymentId, ReliablePublisher, RetryPolicy, StateKey,
    TracingObserver, TransportError,
};

/// Install a fmt subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Defaults with millisecond retries so failure paths run quickly
pub fn fast_config() -> ChoreographyConfig {
    ChoreographyConfig {
        publish_retry: RetryPolicy::fixed(3, 1),
        delivery_retry: RetryPolicy::fixed(3, 1),
        notification_retry: RetryPolicy::fixed(3, 1),
        publish_timeout_millis: 200,
        notification_timeout_millis: 200,
        handler_timeout_millis: 2000,
        reconcile_interval_millis: 20,
        ..ChoreographyConfig::default()
    }
}

/// In-memory store, bus, journal and a publisher over them
pub struct Fixture {
    pub store: Arc<InMemoryStateStore>,
    pub bus: Arc<InMemoryEventBus>,
    pub journal: Arc<InMemoryJournal>,
    pub publisher: ReliablePublisher,
}

pub fn fixture() -> Fixture {
    init_tracing();
    let store = Arc::new(InMemoryStateStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let journal = Arc::new(InMemoryJournal::new());
    let publisher = ReliablePublisher::new(
        bus.clone(),
        journal.clone(),
        Arc::new(TracingObserver),
        RetryPolicy::fixed(3, 1),
        Duration::from_millis(200),
    );
    Fixture { store, bus, journal, publisher }
}

/// Stay of `nights` starting a week from today
pub fn stay(nights: u64) -> (NaiveDate, NaiveDate) {
    let check_in = Utc::now().date_naive() + Days::new(7);
    (check_in, check_in + Days::new(nights))
}

/// Write a pending booking straight into the store
pub async fn seed_booking(f: &Fixture, total_amount: Decimal) -> BookingRecord {
    let (check_in, check_out) = stay(2);
    let now = Utc::now();
    let record = BookingRecord {
        id: BookingId::new(),
        hotel_id: HotelId::new(),
        guest_name: "Ada Guest".into(),
        guest_email: "ada@example.com".into(),
        check_in,
        check_out,
        guests: 2,
        total_amount,
        status: BookingStatus::Pending,
        status_announced: false,
        created_at: now,
        updated_at: now,
    };
    f.store
        .save_json(&StateKey::booking(record.id), &record, Concurrency::FirstWrite)
        .await
        .expect("seed booking");
    record
}

/// Transport that records what it sends and can be told to fail
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Notification>>,
    fail_next: AtomicU32,
    stalls: Mutex<VecDeque<Duration>>,
    attempts: AtomicU32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transient error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Hold the next send for `delay` before it goes through
    pub fn stall_next(&self, delay: Duration) {
        if let Ok(mut stalls) = self.stalls.lock() {
            stalls.push_back(delay);
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, notification: &Notification) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let stall = self.stalls.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Unavailable("injected send failure".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }
}

enum Scripted {
    Decline(Box<str>),
    Unavailable,
    Stall(Duration),
}

/// Gateway that approves unless told otherwise, counting every charge
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    charges: AtomicU32,
}

impl ScriptedGateway {
    pub fn approving() -> Self {
        Self::default()
    }

    pub fn decline_next(&self, n: usize, reason: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.extend((0..n).map(|_| Scripted::Decline(reason.into())));
        }
    }

    pub fn fail_next(&self, n: usize) {
        if let Ok(mut script) = self.script.lock() {
            script.extend((0..n).map(|_| Scripted::Unavailable));
        }
    }

    /// Approve the next `n` charges only after `delay`
    pub fn stall_next(&self, n: usize, delay: Duration) {
        if let Ok(mut script) = self.script.lock() {
            script.extend((0..n).map(|_| Scripted::Stall(delay)));
        }
    }

    pub fn charges(&self) -> u32 {
        self.charges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, _payment_id: PaymentId, _amount: Decimal, _method: &str) -> Result<(), GatewayError> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Decline(reason)) => Err(GatewayError::Declined(reason)),
            Some(Scripted::Unavailable) => Err(GatewayError::Unavailable("injected outage".into())),
            Some(Scripted::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
