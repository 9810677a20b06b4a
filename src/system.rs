//! Wiring of every service and subscriber onto one store and bus
//!
//! Nothing here is global: each component receives the narrow capability it
//! needs (the store, or the reliable publisher) through its constructor.

use chrono::NaiveDate;
use std::sync::Arc;

use crate::{
    ApprovingGateway, BookingError, BookingId, BookingRecord, BookingService,
    BookingStatusSubscriber, ChoreographyConfig, CreateBooking, EventBus, EventHandler,
    FraudCheck, FraudVerdict, HandlerStatsSnapshot, LogTransport, LoyaltyAccrual,
    NotificationSubscriber, NotificationTransport, PaymentGateway, PaymentRecord, PaymentService,
    PaymentSubscriber, ProcessPayment, ProcessRefund, Reconciler, ReconciliationJournal,
    RefundRecord, RefundService, ReliablePublisher, StateStore, TimedStateStore, TracingObserver,
    WorkflowObserver,
};

/// External collaborators a [`BookingSystem`] talks to
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub transport: Arc<dyn NotificationTransport>,
    pub observer: Arc<dyn WorkflowObserver>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            gateway: Arc::new(ApprovingGateway),
            transport: Arc::new(LogTransport),
            observer: Arc::new(TracingObserver),
        }
    }
}

/// One instance of the whole choreography
pub struct BookingSystem {
    config: ChoreographyConfig,
    publisher: ReliablePublisher,
    bookings: BookingService,
    payments: Arc<PaymentService>,
    refunds: RefundService,
    fraud: Arc<FraudCheck>,
    loyalty: Arc<LoyaltyAccrual>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl BookingSystem {
    /// Build every component and subscribe the event handlers to `bus`.
    ///
    /// Store calls are bounded by `store_timeout_millis`.
    pub fn new<B: EventBus>(
        config: ChoreographyConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<B>,
        journal: Arc<dyn ReconciliationJournal>,
        collaborators: Collaborators,
    ) -> Result<Self, BookingError> {
        let store: Arc<dyn StateStore> = Arc::new(TimedStateStore::new(store, config.store_timeout()));
        let publisher = ReliablePublisher::new(
            bus.clone(),
            journal,
            collaborators.observer.clone(),
            config.publish_retry.clone(),
            config.publish_timeout(),
        );
        let conflicts = config.max_write_conflicts;
        let delivery = config.delivery_retry.clone();
        let timeout = config.handler_timeout();

        let bookings = BookingService::new(store.clone(), publisher.clone(), conflicts);
        let payments = Arc::new(
            PaymentService::new(store.clone(), publisher.clone(), collaborators.gateway.clone(), conflicts)
                .with_charge_timeout(config.charge_timeout()),
        );
        let refunds = RefundService::new(store.clone(), publisher.clone(), conflicts);

        let status = Arc::new(
            BookingStatusSubscriber::new(store.clone(), publisher.clone(), conflicts, delivery.clone())
                .with_timeout(timeout),
        );
        let fraud = Arc::new(
            FraudCheck::new(store.clone(), config.fraud_threshold, delivery.clone()).with_timeout(timeout),
        );
        let loyalty = Arc::new(
            LoyaltyAccrual::new(
                store.clone(),
                collaborators.observer.clone(),
                config.loyalty_points_divisor,
                config.loyalty_ledger_retention,
                conflicts,
                config.dedupe_capacity,
                delivery.clone(),
            )
            .with_timeout(timeout),
        );
        let payment_subscriber = Arc::new(
            PaymentSubscriber::new(
                payments.clone(),
                config.auto_capture_payments,
                config.default_payment_method.clone(),
                delivery.clone(),
            )
            .with_timeout(timeout),
        );
        let notifications = Arc::new(
            NotificationSubscriber::new(
                store.clone(),
                collaborators.transport.clone(),
                collaborators.observer.clone(),
                config.dedupe_capacity,
                config.notification_retry.clone(),
                config.notification_timeout(),
                delivery,
            )
            .with_timeout(timeout),
        );

        let handlers: Vec<Arc<dyn EventHandler>> = vec![
            status,
            fraud.clone(),
            loyalty.clone(),
            payment_subscriber,
            notifications,
        ];
        for handler in &handlers {
            bus.subscribe(handler.clone())?;
        }
        tracing::info!(handlers = handlers.len(), "booking system wired");

        Ok(Self { config, publisher, bookings, payments, refunds, fraud, loyalty, handlers })
    }

    pub fn config(&self) -> &ChoreographyConfig {
        &self.config
    }

    pub async fn create_booking(&self, command: CreateBooking) -> Result<BookingRecord, BookingError> {
        self.bookings.create_booking(command).await
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<BookingRecord, BookingError> {
        self.bookings.get_booking(id).await
    }

    pub async fn complete_if_elapsed(&self, id: BookingId, as_of: NaiveDate) -> Result<BookingRecord, BookingError> {
        self.bookings.complete_if_elapsed(id, as_of).await
    }

    pub async fn process_payment(&self, command: ProcessPayment) -> Result<PaymentRecord, BookingError> {
        self.payments.process_payment(command).await
    }

    pub async fn process_refund(&self, command: ProcessRefund) -> Result<RefundRecord, BookingError> {
        self.refunds.process_refund(command).await
    }

    pub async fn points_for(&self, guest_email: &str) -> Result<u64, BookingError> {
        self.loyalty.points_for(guest_email).await
    }

    pub async fn fraud_verdict(&self, booking_id: BookingId) -> Result<Option<FraudVerdict>, BookingError> {
        self.fraud.verdict_for(booking_id).await
    }

    pub fn payments(&self) -> &PaymentService {
        &self.payments
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.publisher.clone())
    }

    /// Start the journal relay at the configured interval
    pub fn spawn_reconciler(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        self.reconciler().spawn(self.config.reconcile_interval(), shutdown)
    }

    /// Statistics of every subscriber, by name
    pub fn handler_stats(&self) -> Vec<(String, HandlerStatsSnapshot)> {
        self.handlers
            .iter()
            .map(|h| (h.name().to_string(), h.stats().snapshot()))
            .collect()
    }

    pub fn stats_for(&self, handler: &str) -> Option<HandlerStatsSnapshot> {
        self.handlers
            .iter()
            .find(|h| h.name() == handler)
            .map(|h| h.stats().snapshot())
    }
}
