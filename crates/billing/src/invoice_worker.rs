//! Invoice advance and collect batch jobs
//!
//! Both jobs list their work up front and fan out with the same bounded
//! batching as the reconciler. Neither retries: whatever fails is picked up
//! by the next scheduled run.

use std::sync::Arc;

use linesync_shared::{Clock, CustomerId, Namespace};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::adapter::{CustomerRef, InvoiceFilter, InvoiceRef, InvoiceService};
use crate::batch::{run_batched, Shutdown};
use crate::error::{BillingError, BillingResult};
use crate::reconciler::DEFAULT_BATCH_SIZE;

/// Moves draft invoices whose draft period elapsed to their next state
#[derive(Clone)]
pub struct InvoiceAdvancer {
    invoices: Arc<dyn InvoiceService>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    shutdown: Shutdown,
}

impl InvoiceAdvancer {
    pub fn new(invoices: Arc<dyn InvoiceService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            invoices,
            clock,
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

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> BillingResult<Vec<InvoiceRef>> {
        self.invoices
            .list_invoices_to_advance(filter, self.clock.now())
            .await
    }

    pub async fn advance_all(&self, filter: &InvoiceFilter) -> BillingResult<()> {
        let invoices = self.list_invoices(filter).await?;
        if invoices.is_empty() {
            return Ok(());
        }
        info!(count = invoices.len(), "Advancing invoices");

        let errors = run_batched(
            invoices,
            self.batch_size,
            &self.shutdown,
            |i| format!("invoice {}", i.id),
            |invoice| {
                let this = self.clone();
                async move { this.advance_invoice(&invoice).await }
            },
        )
        .await;

        if !errors.is_empty() {
            warn!(failed = errors.len(), "Invoice advance finished with failures");
        }
        errors.into_result()
    }

    /// Advance one invoice. Losing the race against another actor that
    /// already moved it is not an error.
    pub async fn advance_invoice(&self, invoice: &InvoiceRef) -> BillingResult<()> {
        match self.invoices.advance_invoice(invoice).await {
            Ok(()) => {
                info!(invoice_id = %invoice.id, "Invoice advanced");
                Ok(())
            }
            Err(e) if e.is_cannot_advance() => {
                info!(invoice_id = %invoice.id, "Invoice cannot be advanced, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectInput {
    pub namespaces: Vec<Namespace>,
    pub customers: Vec<CustomerId>,
    /// Lines due up to this point are collected. Required.
    pub as_of: Option<OffsetDateTime>,
}

/// Moves due gathering lines onto draft invoices, one customer at a time
#[derive(Clone)]
pub struct InvoiceCollector {
    invoices: Arc<dyn InvoiceService>,
    batch_size: usize,
    shutdown: Shutdown,
}

impl InvoiceCollector {
    pub fn new(invoices: Arc<dyn InvoiceService>) -> Self {
        Self {
            invoices,
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

    pub async fn list_customers(&self, input: &CollectInput) -> BillingResult<Vec<CustomerRef>> {
        let as_of = require_as_of(input)?;
        self.invoices
            .list_customers_to_collect(&filter_of(input), as_of)
            .await
    }

    pub async fn collect_all(&self, input: &CollectInput) -> BillingResult<()> {
        let as_of = require_as_of(input)?;
        let customers = self.list_customers(input).await?;
        if customers.is_empty() {
            return Ok(());
        }
        info!(count = customers.len(), "Collecting customers");

        let errors = run_batched(
            customers,
            self.batch_size,
            &self.shutdown,
            |c| format!("customer {}", c.customer_id),
            |customer| {
                let invoices = self.invoices.clone();
                async move {
                    let created = invoices.collect_customer(&customer, as_of).await?;
                    if !created.is_empty() {
                        info!(
                            customer_id = %customer.customer_id,
                            count = created.len(),
                            "Collected lines into draft invoices"
                        );
                    }
                    Ok(())
                }
            },
        )
        .await;

        if !errors.is_empty() {
            warn!(failed = errors.len(), "Invoice collect finished with failures");
        }
        errors.into_result()
    }
}

fn require_as_of(input: &CollectInput) -> BillingResult<OffsetDateTime> {
    input
        .as_of
        .ok_or_else(|| BillingError::InvalidInput("collection timestamp is required".to_string()))
}

fn filter_of(input: &CollectInput) -> InvoiceFilter {
    InvoiceFilter {
        namespaces: input.namespaces.clone(),
        customers: input.customers.clone(),
    }
}
