//! Contracts of the services the sync engine talks to
//!
//! The billing service owns lines, invoices and billing profiles; the
//! subscription service supplies read-only subscription views. Both are
//! consumed through these traits so the engine can run against Postgres or
//! an in-memory store.

use async_trait::async_trait;
use linesync_shared::{CustomerId, InvoiceId, Namespace, Period, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::line::{Line, LineInput};
use crate::subscription::SubscriptionView;

/// Billing settings of a customer. Lines can only be created for customers
/// that have one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingProfile {
    pub namespace: Namespace,
    pub customer_id: CustomerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub namespace: Namespace,
    pub id: SubscriptionId,
    pub customer_id: CustomerId,
}

/// Filter for listing subscriptions. Empty lists match everything.
#[derive(Debug, Clone)]
pub struct ListSubscriptionsInput {
    pub namespaces: Vec<Namespace>,
    pub customers: Vec<CustomerId>,
    /// Subscriptions active at any point of this period
    pub active_in: Period,
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn list_subscriptions(
        &self,
        input: &ListSubscriptionsInput,
    ) -> BillingResult<Vec<SubscriptionRef>>;

    async fn get_view(
        &self,
        namespace: &Namespace,
        id: SubscriptionId,
    ) -> BillingResult<SubscriptionView>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>>;
}

/// One storage transaction. Nothing is visible to others before `commit`;
/// dropping without commit discards all writes.
#[async_trait]
pub trait BillingTransaction: Send {
    async fn get_profile(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
    ) -> BillingResult<Option<BillingProfile>>;

    /// All lines of a subscription across every invoice, soft-deleted and
    /// split children included
    async fn list_subscription_lines(
        &mut self,
        namespace: &Namespace,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<Line>>;

    /// Create pending lines on the customer's gathering invoice for
    /// `currency`, opening one if needed
    async fn create_pending_lines(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        currency: &str,
        lines: Vec<LineInput>,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Line>>;

    async fn update_lines(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        lines: Vec<Line>,
    ) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;

    async fn rollback(self: Box<Self>) -> BillingResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub namespace: Namespace,
    pub id: InvoiceId,
    pub customer_id: CustomerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerRef {
    pub namespace: Namespace,
    pub customer_id: CustomerId,
}

/// Namespace/customer filter for invoice jobs. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub namespaces: Vec<Namespace>,
    pub customers: Vec<CustomerId>,
}

/// Invoice state machine operations of the billing service
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Draft invoices whose draft period has elapsed at `as_of`
    async fn list_invoices_to_advance(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceRef>>;

    /// Move an invoice to its next state. Fails with `CannotAdvance` when a
    /// concurrent actor already moved it.
    async fn advance_invoice(&self, invoice: &InvoiceRef) -> BillingResult<()>;

    /// Customers with gathering lines due at `as_of`
    async fn list_customers_to_collect(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<CustomerRef>>;

    /// Move due gathering lines onto new draft invoices
    async fn collect_customer(
        &self,
        customer: &CustomerRef,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceId>>;
}
