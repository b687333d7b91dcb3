//! In-memory billing and subscription services
//!
//! Transactions read from a snapshot taken at `begin` and keep a change log;
//! `commit` replays the log onto the shared state row by row, so concurrent
//! transactions touching different subscriptions don't clobber each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use linesync_shared::{CustomerId, InvoiceId, LineId, Namespace, SubscriptionId};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::adapter::{
    BillingProfile, BillingStore, BillingTransaction, CustomerRef, InvoiceFilter, InvoiceRef,
    InvoiceService, ListSubscriptionsInput, SubscriptionRef, SubscriptionSource,
};
use crate::error::{BillingError, BillingResult};
use crate::line::{Line, LineInput};
use crate::subscription::SubscriptionView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryInvoiceStatus {
    Gathering,
    Draft,
    Issued,
}

#[derive(Debug, Clone)]
pub struct MemoryInvoice {
    pub id: InvoiceId,
    pub namespace: Namespace,
    pub customer_id: CustomerId,
    pub currency: String,
    pub status: MemoryInvoiceStatus,
    pub draft_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
struct State {
    profiles: HashMap<(Namespace, CustomerId), BillingProfile>,
    invoices: HashMap<InvoiceId, MemoryInvoice>,
    lines: HashMap<LineId, Line>,
}

impl State {
    fn gathering_invoice(&self, namespace: &Namespace, customer_id: CustomerId, currency: &str) -> Option<InvoiceId> {
        self.invoices
            .values()
            .find(|i| {
                i.status == MemoryInvoiceStatus::Gathering
                    && &i.namespace == namespace
                    && i.customer_id == customer_id
                    && i.currency == currency
            })
            .map(|i| i.id)
    }
}

/// Billing service backed by process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBillingStore {
    state: Arc<Mutex<State>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_profile(&self, namespace: &Namespace, customer_id: CustomerId) {
        let profile = BillingProfile {
            namespace: namespace.clone(),
            customer_id,
            name: "default".to_string(),
        };
        self.state
            .lock()
            .await
            .profiles
            .insert((namespace.clone(), customer_id), profile);
    }

    /// Insert or replace a line as-is, e.g. to seed progressively billed lines
    pub async fn put_line(&self, line: Line) {
        self.state.lock().await.lines.insert(line.id, line);
    }

    pub async fn line(&self, id: LineId) -> Option<Line> {
        self.state.lock().await.lines.get(&id).cloned()
    }

    /// Lines of a subscription ordered by period, soft-deleted ones included
    pub async fn subscription_lines(&self, subscription_id: SubscriptionId) -> Vec<Line> {
        let state = self.state.lock().await;
        let mut lines: Vec<Line> = state
            .lines
            .values()
            .filter(|l| l.subscription.is_some_and(|s| s.subscription_id == subscription_id))
            .cloned()
            .collect();
        lines.sort_by(|a, b| {
            (a.period.start, a.period.end, &a.child_unique_reference_id)
                .cmp(&(b.period.start, b.period.end, &b.child_unique_reference_id))
        });
        lines
    }

    pub async fn invoice(&self, id: InvoiceId) -> Option<MemoryInvoice> {
        self.state.lock().await.invoices.get(&id).cloned()
    }

    /// Number of live top-level lines on an invoice
    pub async fn lines_on_invoice(&self, id: InvoiceId) -> usize {
        self.state
            .lock()
            .await
            .lines
            .values()
            .filter(|l| l.invoice_id == id && !l.is_deleted() && l.parent_line_id.is_none())
            .count()
    }

    pub async fn invoices(&self) -> Vec<MemoryInvoice> {
        self.state.lock().await.invoices.values().cloned().collect()
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<State>>,
    snapshot: State,
    written_lines: Vec<LineId>,
    created_invoices: Vec<InvoiceId>,
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let snapshot = self.state.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: self.state.clone(),
            snapshot,
            written_lines: Vec::new(),
            created_invoices: Vec::new(),
        }))
    }
}

#[async_trait]
impl BillingTransaction for MemoryTransaction {
    async fn get_profile(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
    ) -> BillingResult<Option<BillingProfile>> {
        Ok(self
            .snapshot
            .profiles
            .get(&(namespace.clone(), customer_id))
            .cloned())
    }

    async fn list_subscription_lines(
        &mut self,
        namespace: &Namespace,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<Line>> {
        let parents: HashSet<LineId> = self
            .snapshot
            .lines
            .values()
            .filter(|l| {
                &l.namespace == namespace
                    && l.subscription.is_some_and(|s| s.subscription_id == subscription_id)
            })
            .map(|l| l.id)
            .collect();

        Ok(self
            .snapshot
            .lines
            .values()
            .filter(|l| {
                parents.contains(&l.id) || l.parent_line_id.is_some_and(|p| parents.contains(&p))
            })
            .cloned()
            .collect())
    }

    async fn create_pending_lines(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        currency: &str,
        lines: Vec<LineInput>,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Line>> {
        let invoice_id = match self.snapshot.gathering_invoice(namespace, customer_id, currency) {
            Some(id) => id,
            None => {
                let invoice = MemoryInvoice {
                    id: InvoiceId::new(),
                    namespace: namespace.clone(),
                    customer_id,
                    currency: currency.to_string(),
                    status: MemoryInvoiceStatus::Gathering,
                    draft_until: None,
                };
                let id = invoice.id;
                self.snapshot.invoices.insert(id, invoice);
                self.created_invoices.push(id);
                id
            }
        };

        let mut created = Vec::with_capacity(lines.len());
        for input in lines {
            let duplicate = self.snapshot.lines.values().any(|l| {
                &l.namespace == namespace
                    && l.child_unique_reference_id.as_deref() == Some(input.child_unique_reference_id.as_str())
                    && l.subscription.map(|s| s.subscription_id) == Some(input.subscription.subscription_id)
            });
            if duplicate {
                return Err(BillingError::Database(format!(
                    "unique violation on child unique reference id {}",
                    input.child_unique_reference_id
                )));
            }

            let line = Line::from_input(input, namespace.clone(), customer_id, invoice_id, now);
            self.written_lines.push(line.id);
            self.snapshot.lines.insert(line.id, line.clone());
            created.push(line);
        }

        Ok(created)
    }

    async fn update_lines(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        lines: Vec<Line>,
    ) -> BillingResult<()> {
        for line in lines {
            let known = self
                .snapshot
                .lines
                .get(&line.id)
                .is_some_and(|l| &l.namespace == namespace && l.customer_id == customer_id);
            if !known {
                return Err(BillingError::NotFound(format!("line {}", line.id)));
            }
            self.written_lines.push(line.id);
            self.snapshot.lines.insert(line.id, line);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let mut shared = self.shared.lock().await;

        // Same constraint as the unique child reference index: a concurrent
        // transaction may have committed the line first
        for id in &self.written_lines {
            let Some(line) = self.snapshot.lines.get(id) else {
                continue;
            };
            if shared.lines.contains_key(id) {
                continue;
            }
            let Some(reference) = line.child_unique_reference_id.as_deref() else {
                continue;
            };
            let subscription_id = line.subscription.map(|s| s.subscription_id);
            let taken = shared.lines.values().any(|l| {
                l.id != line.id
                    && l.namespace == line.namespace
                    && l.subscription.map(|s| s.subscription_id) == subscription_id
                    && l.child_unique_reference_id.as_deref() == Some(reference)
            });
            if taken {
                return Err(BillingError::Database(format!(
                    "unique violation on child unique reference id {reference}"
                )));
            }
        }

        // A concurrent transaction may have opened the same gathering invoice
        let mut remap: HashMap<InvoiceId, InvoiceId> = HashMap::new();
        for id in &self.created_invoices {
            let Some(invoice) = self.snapshot.invoices.get(id) else {
                continue;
            };
            match shared.gathering_invoice(&invoice.namespace, invoice.customer_id, &invoice.currency) {
                Some(existing) => {
                    remap.insert(*id, existing);
                }
                None => {
                    shared.invoices.insert(*id, invoice.clone());
                }
            }
        }

        for id in &self.written_lines {
            if let Some(line) = self.snapshot.lines.get(id) {
                let mut line = line.clone();
                if let Some(target) = remap.get(&line.invoice_id) {
                    line.invoice_id = *target;
                }
                shared.lines.insert(*id, line);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        Ok(())
    }
}

fn matches_filter(filter: &InvoiceFilter, namespace: &Namespace, customer_id: CustomerId) -> bool {
    (filter.namespaces.is_empty() || filter.namespaces.contains(namespace))
        && (filter.customers.is_empty() || filter.customers.contains(&customer_id))
}

#[async_trait]
impl InvoiceService for MemoryBillingStore {
    async fn list_invoices_to_advance(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceRef>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .filter(|i| {
                i.status == MemoryInvoiceStatus::Draft
                    && i.draft_until.is_some_and(|until| until <= as_of)
                    && matches_filter(filter, &i.namespace, i.customer_id)
            })
            .map(|i| InvoiceRef {
                namespace: i.namespace.clone(),
                id: i.id,
                customer_id: i.customer_id,
            })
            .collect())
    }

    async fn advance_invoice(&self, invoice: &InvoiceRef) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice.id)))?;

        if stored.status != MemoryInvoiceStatus::Draft {
            return Err(BillingError::CannotAdvance(invoice.id));
        }
        stored.status = MemoryInvoiceStatus::Issued;
        Ok(())
    }

    async fn list_customers_to_collect(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<CustomerRef>> {
        let state = self.state.lock().await;
        let mut customers: Vec<CustomerRef> = state
            .lines
            .values()
            .filter(|l| {
                !l.is_deleted()
                    && l.parent_line_id.is_none()
                    && l.invoice_at <= as_of
                    && matches_filter(filter, &l.namespace, l.customer_id)
                    && state
                        .invoices
                        .get(&l.invoice_id)
                        .is_some_and(|i| i.status == MemoryInvoiceStatus::Gathering)
            })
            .map(|l| CustomerRef {
                namespace: l.namespace.clone(),
                customer_id: l.customer_id,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        customers.sort_by_key(|c| c.customer_id);
        Ok(customers)
    }

    async fn collect_customer(
        &self,
        customer: &CustomerRef,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceId>> {
        let mut state = self.state.lock().await;
        let gathering: Vec<(InvoiceId, String)> = state
            .invoices
            .values()
            .filter(|i| {
                i.status == MemoryInvoiceStatus::Gathering
                    && i.namespace == customer.namespace
                    && i.customer_id == customer.customer_id
            })
            .map(|i| (i.id, i.currency.clone()))
            .collect();

        let mut created = Vec::new();
        for (gathering_id, currency) in gathering {
            let due: Vec<LineId> = state
                .lines
                .values()
                .filter(|l| {
                    l.invoice_id == gathering_id
                        && !l.is_deleted()
                        && l.parent_line_id.is_none()
                        && l.invoice_at <= as_of
                })
                .map(|l| l.id)
                .collect();
            if due.is_empty() {
                continue;
            }

            let draft = MemoryInvoice {
                id: InvoiceId::new(),
                namespace: customer.namespace.clone(),
                customer_id: customer.customer_id,
                currency,
                status: MemoryInvoiceStatus::Draft,
                draft_until: Some(as_of),
            };
            let draft_id = draft.id;
            state.invoices.insert(draft_id, draft);

            for id in due {
                if let Some(line) = state.lines.get_mut(&id) {
                    line.invoice_id = draft_id;
                }
            }
            created.push(draft_id);
        }

        Ok(created)
    }
}

/// Subscription service backed by process memory
#[derive(Debug, Clone, Default)]
pub struct MemorySubscriptionSource {
    views: Arc<RwLock<HashMap<SubscriptionId, SubscriptionView>>>,
}

impl MemorySubscriptionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, view: SubscriptionView) {
        self.views.write().await.insert(view.subscription.id, view);
    }
}

#[async_trait]
impl SubscriptionSource for MemorySubscriptionSource {
    async fn list_subscriptions(
        &self,
        input: &ListSubscriptionsInput,
    ) -> BillingResult<Vec<SubscriptionRef>> {
        let views = self.views.read().await;
        let mut refs: Vec<SubscriptionRef> = views
            .values()
            .map(|v| &v.subscription)
            .filter(|s| {
                s.active_from < input.active_in.end
                    && s.active_to.map_or(true, |to| to > input.active_in.start)
                    && (input.namespaces.is_empty() || input.namespaces.contains(&s.namespace))
                    && (input.customers.is_empty() || input.customers.contains(&s.customer_id))
            })
            .map(|s| SubscriptionRef {
                namespace: s.namespace.clone(),
                id: s.id,
                customer_id: s.customer_id,
            })
            .collect();
        refs.sort_by_key(|r| r.id);
        Ok(refs)
    }

    async fn get_view(
        &self,
        namespace: &Namespace,
        id: SubscriptionId,
    ) -> BillingResult<SubscriptionView> {
        self.views
            .read()
            .await
            .get(&id)
            .filter(|v| &v.subscription.namespace == namespace)
            .cloned()
            .ok_or(BillingError::SubscriptionNotFound(id))
    }
}
