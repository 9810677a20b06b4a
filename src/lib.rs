//! Event-Driven Choreography for Hotel Bookings
//!
//! Independent services react to shared events over a pub/sub bus and keep
//! their own records in a key-value state store. There is no orchestrator:
//! a booking is created and announced, and fraud screening, payment, loyalty
//! accrual and guest notification each follow from `booking-created` on
//! their own. Payment and refund outcomes in turn drive the booking status.
//!
//! Delivery is at-least-once and unordered, so every handler converges to
//! the same state regardless of duplicates or arrival order.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let bus = Arc::new(InMemoryEventBus::new());
//! let system = BookingSystem::new(
//!     ChoreographyConfig::from_env()?,
//!     Arc::new(InMemoryStateStore::new()),
//!     bus.clone(),
//!     Arc::new(InMemoryJournal::new()),
//!     Collaborators::default(),
//! )?;
//!
//! let booking = system.create_booking(command).await?;
//! bus.settle().await;
//! assert_eq!(system.points_for(&booking.guest_email).await?, 50);
//! ```

// === Core Types ===
mod context;
mod errors;
mod events;
mod idempotency;
mod state;

// === Traits ===
pub mod state_ext;
mod traits;

// === Storage ===
mod dedupe;
mod journal;
#[cfg(feature = "lmdb")]
mod lmdb;
mod store;

// === Messaging ===
mod bus;
mod publisher;

// === Handlers ===
mod booking;
mod fraud;
mod loyalty;
mod notification;
mod payment;
mod refund;
mod system;

// === Observability ===
mod observer;
mod stats;

// === Configuration ===
mod config;

// === Helpers ===
pub mod helpers;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_support;

// === Re-exports ===

// Types
pub use context::{BookingId, EventId, HotelId, PaymentId, RefundId, StateKey};
pub use idempotency::IdempotencyKey;

// State
pub use state::{
    BookingRecord, BookingStatus, FraudVerdict, LoyaltyAccount, PaymentRecord, PaymentStatus,
    RefundLedger, RefundRecord, StatusTrigger, Transition,
};

// Events
pub use events::{
    BookingCancelled, BookingConfirmed, BookingCreated, EventEnvelope, EventPayload,
    PaymentCompleted, PaymentFailed, RefundProcessed, Topic,
};

// Errors
pub use errors::{BookingError, ValidationError};

// Traits
pub use state_ext::{Created, StateStoreExt, Tagged, Update};
pub use traits::{EventHandler, RetryPolicy, DEFAULT_HANDLER_TIMEOUT};

// Storage
pub use dedupe::RecentEvents;
pub use journal::{InMemoryJournal, JournalEntry, JournalError, ReconciliationJournal};
#[cfg(feature = "lmdb")]
pub use lmdb::{LmdbJournal, LmdbStateStore};
pub use store::{
    Concurrency, ETag, InMemoryStateStore, StateStore, StoreError, TimedStateStore, Versioned,
};

// Messaging
pub use bus::{BusError, DeadLetter, EventBus, EventPublisher, InMemoryEventBus};
pub use publisher::{PublishOutcome, ReconcileReport, Reconciler, ReliablePublisher};

// Handlers
pub use booking::{BookingService, BookingStatusSubscriber, CreateBooking};
pub use fraud::FraudCheck;
pub use loyalty::LoyaltyAccrual;
pub use notification::{
    LogTransport, Notification, NotificationReceipt, NotificationSubscriber,
    NotificationTransport, TransportError,
};
pub use payment::{
    ApprovingGateway, GatewayError, PaymentGateway, PaymentService, PaymentSubscriber,
    ProcessPayment, DEFAULT_CHARGE_TIMEOUT,
};
pub use refund::{ProcessRefund, RefundService};
pub use system::{BookingSystem, Collaborators};

// Observability
pub use observer::{NoOpObserver, TracingObserver, WorkflowObserver};
pub use stats::{HandlerStats, HandlerStatsSnapshot};

// Configuration
pub use config::{ChoreographyConfig, ConfigError};

// Helpers
pub use helpers::{deliver, DeliveryOutcome};
