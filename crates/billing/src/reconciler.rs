//! Periodic fail-safe driver for subscription sync
//!
//! Event handlers keep lines current in the common case; the reconciler
//! catches whatever they missed by re-syncing every subscription active in a
//! lookback window. Best effort: one failing subscription never stops the
//! others, and the joined error is returned at the end.

use std::sync::Arc;

use linesync_shared::{CustomerId, Namespace, Period, SubscriptionId};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::adapter::{ListSubscriptionsInput, SubscriptionRef, SubscriptionSource};
use crate::batch::{run_batched, Shutdown};
use crate::error::{BillingError, BillingResult};
use crate::sync::{SyncResult, Synchronizer};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Which subscriptions a reconcile run covers
#[derive(Debug, Clone)]
pub struct ReconcileInput {
    /// Subscriptions active at any point in `[now - lookback, now]`
    pub lookback: Duration,
    pub namespaces: Vec<Namespace>,
    pub customers: Vec<CustomerId>,
}

impl ReconcileInput {
    pub fn validate(&self) -> BillingResult<()> {
        if !self.lookback.is_positive() {
            return Err(BillingError::InvalidInput(format!(
                "lookback must be positive, got {}",
                self.lookback
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    subscriptions: Arc<dyn SubscriptionSource>,
    synchronizer: Synchronizer,
    batch_size: usize,
    shutdown: Shutdown,
}

impl Reconciler {
    pub fn new(subscriptions: Arc<dyn SubscriptionSource>, synchronizer: Synchronizer) -> Self {
        Self {
            subscriptions,
            synchronizer,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Subscriptions a reconcile run with `input` would sync
    pub async fn list_subscriptions(&self, input: &ReconcileInput) -> BillingResult<Vec<SubscriptionRef>> {
        input.validate()?;
        let now = self.synchronizer.clock().now();

        self.subscriptions
            .list_subscriptions(&ListSubscriptionsInput {
                namespaces: input.namespaces.clone(),
                customers: input.customers.clone(),
                active_in: Period::new(now - input.lookback, now),
            })
            .await
    }

    /// Sync every subscription matched by `input` with the current time as `as_of`
    pub async fn all(&self, input: &ReconcileInput) -> BillingResult<()> {
        let subscriptions = self.list_subscriptions(input).await?;
        let total = subscriptions.len();
        let as_of = self.synchronizer.clock().now();

        info!(count = total, "Reconciling subscriptions");

        let errors = run_batched(
            subscriptions,
            self.batch_size,
            &self.shutdown,
            |s| format!("subscription {}", s.id),
            |s| {
                let this = self.clone();
                async move { this.sync_subscription(&s.namespace, s.id, as_of).await.map(|_| ()) }
            },
        )
        .await;

        if errors.is_empty() {
            info!(count = total, "Reconciled subscriptions");
        } else {
            warn!(
                count = total,
                failed = errors.len(),
                "Reconcile finished with failures"
            );
        }

        errors.into_result()
    }

    /// Fetch the current view of one subscription and sync it
    pub async fn sync_subscription(
        &self,
        namespace: &Namespace,
        id: SubscriptionId,
        as_of: OffsetDateTime,
    ) -> BillingResult<SyncResult> {
        let view = self.subscriptions.get_view(namespace, id).await?;
        self.synchronizer.synchronize_subscription(&view, as_of).await
    }

    /// A cancelled subscription has a new end: clip or drop its lines now
    /// instead of waiting for the next reconcile
    pub async fn handle_subscription_cancelled(
        &self,
        namespace: &Namespace,
        id: SubscriptionId,
    ) -> BillingResult<SyncResult> {
        let now = self.synchronizer.clock().now();
        info!(subscription_id = %id, "Subscription cancelled, syncing lines");
        self.sync_subscription(namespace, id, now).await
    }

    /// A new invoice moved the customer's gathering lines; generate the
    /// lines of the next periods for all of the customer's subscriptions.
    pub async fn handle_invoice_created(
        &self,
        namespace: &Namespace,
        customer_id: CustomerId,
        lookback: Duration,
    ) -> BillingResult<()> {
        info!(customer_id = %customer_id, "Invoice created, syncing customer subscriptions");
        self.all(&ReconcileInput {
            lookback,
            namespaces: vec![namespace.clone()],
            customers: vec![customer_id],
        })
        .await
    }
}
