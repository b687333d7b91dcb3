//! Postgres-backed billing and subscription services
//!
//! Schema lives in `migrations/`. Pricing, tax settings and rate cards are
//! stored as JSONB payloads of their serde representation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use linesync_shared::{CustomerId, InvoiceId, ItemId, LineId, Namespace, Period, PhaseId, SubscriptionId};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::adapter::{
    BillingProfile, BillingStore, BillingTransaction, CustomerRef, InvoiceFilter, InvoiceRef,
    InvoiceService, ListSubscriptionsInput, SubscriptionRef, SubscriptionSource,
};
use crate::error::{BillingError, BillingResult};
use crate::line::{Line, LineInput, LinePricing, SubscriptionReference};
use crate::subscription::{RateCard, Subscription, SubscriptionItem, SubscriptionPhase, SubscriptionView, TaxConfig};

const LINE_COLUMNS: &str = r#"
    l.id, l.namespace, l.customer_id, l.invoice_id, l.name, l.description, l.currency,
    l.status, l.period_start, l.period_end, l.invoice_at, l.pricing, l.tax_config,
    l.child_unique_reference_id, l.subscription_id, l.phase_id, l.item_id,
    l.parent_line_id, l.created_at, l.updated_at, l.deleted_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    namespace: String,
    customer_id: Uuid,
    invoice_id: Uuid,
    name: String,
    description: Option<String>,
    currency: String,
    status: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    invoice_at: OffsetDateTime,
    pricing: Json<LinePricing>,
    tax_config: Option<Json<TaxConfig>>,
    child_unique_reference_id: Option<String>,
    subscription_id: Option<Uuid>,
    phase_id: Option<Uuid>,
    item_id: Option<Uuid>,
    parent_line_id: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<LineRow> for Line {
    type Error = BillingError;

    fn try_from(row: LineRow) -> Result<Self, Self::Error> {
        let subscription = match (row.subscription_id, row.phase_id, row.item_id) {
            (Some(subscription_id), Some(phase_id), Some(item_id)) => Some(SubscriptionReference {
                subscription_id: subscription_id.into(),
                phase_id: phase_id.into(),
                item_id: item_id.into(),
            }),
            _ => None,
        };

        Ok(Line {
            id: row.id.into(),
            namespace: Namespace::new(row.namespace)?,
            customer_id: row.customer_id.into(),
            invoice_id: row.invoice_id.into(),
            name: row.name,
            description: row.description,
            currency: row.currency,
            status: row.status.parse()?,
            period: Period::new(row.period_start, row.period_end),
            invoice_at: row.invoice_at,
            pricing: row.pricing.0,
            tax_config: row.tax_config.map(|t| t.0),
            child_unique_reference_id: row.child_unique_reference_id,
            subscription,
            parent_line_id: row.parent_line_id.map(LineId::from),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn namespace_filter(namespaces: &[Namespace]) -> Vec<String> {
    namespaces.iter().map(|n| n.as_str().to_string()).collect()
}

fn customer_filter(customers: &[CustomerId]) -> Vec<Uuid> {
    customers.iter().map(|c| c.0).collect()
}

// =============================================================================
// Billing store
// =============================================================================

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgBillingTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBillingTransaction { tx }))
    }
}

impl PgBillingTransaction {
    /// Gathering invoice of the customer for `currency`, created on first use.
    /// Locked for the rest of the transaction.
    async fn gathering_invoice(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        currency: &str,
    ) -> BillingResult<InvoiceId> {
        sqlx::query(
            r#"
            INSERT INTO invoices (id, namespace, customer_id, currency, status)
            VALUES ($1, $2, $3, $4, 'gathering')
            ON CONFLICT (namespace, customer_id, currency) WHERE status = 'gathering' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(namespace.as_str())
        .bind(customer_id.0)
        .bind(currency)
        .execute(&mut *self.tx)
        .await?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            SELECT id FROM invoices
            WHERE namespace = $1 AND customer_id = $2 AND currency = $3 AND status = 'gathering'
            FOR UPDATE
            "#,
        )
        .bind(namespace.as_str())
        .bind(customer_id.0)
        .bind(currency)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id.into())
    }
}

#[async_trait]
impl BillingTransaction for PgBillingTransaction {
    async fn get_profile(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
    ) -> BillingResult<Option<BillingProfile>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM billing_profiles WHERE namespace = $1 AND customer_id = $2",
        )
        .bind(namespace.as_str())
        .bind(customer_id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|(name,)| BillingProfile {
            namespace: namespace.clone(),
            customer_id,
            name,
        }))
    }

    async fn list_subscription_lines(
        &mut self,
        namespace: &Namespace,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<Line>> {
        let rows: Vec<LineRow> = sqlx::query_as(&format!(
            r#"
            SELECT {LINE_COLUMNS}
            FROM invoice_lines l
            WHERE l.namespace = $1
              AND (
                  l.subscription_id = $2
                  OR l.parent_line_id IN (
                      SELECT p.id FROM invoice_lines p
                      WHERE p.namespace = $1 AND p.subscription_id = $2
                  )
              )
            ORDER BY l.period_start, l.id
            "#
        ))
        .bind(namespace.as_str())
        .bind(subscription_id.0)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(Line::try_from).collect()
    }

    async fn create_pending_lines(
        &mut self,
        namespace: &Namespace,
        customer_id: CustomerId,
        currency: &str,
        lines: Vec<LineInput>,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Line>> {
        let invoice_id = self.gathering_invoice(namespace, customer_id, currency).await?;

        let mut created = Vec::with_capacity(lines.len());
        for input in lines {
            let line = Line::from_input(input, namespace.clone(), customer_id, invoice_id, now);

            sqlx::query(
                r#"
                INSERT INTO invoice_lines (
                    id, namespace, customer_id, invoice_id, name, description, currency,
                    status, period_start, period_end, invoice_at, pricing, tax_config,
                    child_unique_reference_id, subscription_id, phase_id, item_id,
                    parent_line_id, created_at, updated_at, deleted_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21
                )
                "#,
            )
            .bind(line.id.0)
            .bind(namespace.as_str())
            .bind(customer_id.0)
            .bind(invoice_id.0)
            .bind(&line.name)
            .bind(&line.description)
            .bind(&line.currency)
            .bind(line.status.as_str())
            .bind(line.period.start)
            .bind(line.period.end)
            .bind(line.invoice_at)
            .bind(Json(&line.pricing))
            .bind(line.tax_config.as_ref().map(Json))
            .bind(&line.child_unique_reference_id)
            .bind(line.subscription.map(|s| s.subscription_id.0))
            .bind(line.subscription.map(|s| s.phase_id.0))
            .bind(line.subscription.map(|s| s.item_id.0))
            .bind(line.parent_line_id.map(|p| p.0))
            .bind(line.created_at)
            .bind(line.updated_at)
            .bind(line.deleted_at)
            .execute(&mut *self.tx)
            .await?;

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
            let result = sqlx::query(
                r#"
                UPDATE invoice_lines SET
                    name = $4,
                    description = $5,
                    status = $6,
                    period_start = $7,
                    period_end = $8,
                    invoice_at = $9,
                    pricing = $10,
                    tax_config = $11,
                    deleted_at = $12,
                    updated_at = $13
                WHERE id = $1 AND namespace = $2 AND customer_id = $3
                "#,
            )
            .bind(line.id.0)
            .bind(namespace.as_str())
            .bind(customer_id.0)
            .bind(&line.name)
            .bind(&line.description)
            .bind(line.status.as_str())
            .bind(line.period.start)
            .bind(line.period.end)
            .bind(line.invoice_at)
            .bind(Json(&line.pricing))
            .bind(line.tax_config.as_ref().map(Json))
            .bind(line.deleted_at)
            .bind(line.updated_at)
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(BillingError::NotFound(format!("line {}", line.id)));
            }
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Invoice state machine
// =============================================================================

#[async_trait]
impl InvoiceService for PgBillingStore {
    async fn list_invoices_to_advance(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceRef>> {
        let rows: Vec<(Uuid, String, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, namespace, customer_id
            FROM invoices
            WHERE status = 'draft'
              AND draft_until <= $1
              AND (cardinality($2::text[]) = 0 OR namespace = ANY($2))
              AND (cardinality($3::uuid[]) = 0 OR customer_id = ANY($3))
            ORDER BY created_at ASC
            "#,
        )
        .bind(as_of)
        .bind(namespace_filter(&filter.namespaces))
        .bind(customer_filter(&filter.customers))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, namespace, customer_id)| {
                Ok(InvoiceRef {
                    namespace: Namespace::new(namespace)?,
                    id: id.into(),
                    customer_id: customer_id.into(),
                })
            })
            .collect()
    }

    async fn advance_invoice(&self, invoice: &InvoiceRef) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoices SET status = 'issued', updated_at = NOW()
            WHERE id = $1 AND namespace = $2 AND status = 'draft'
            "#,
        )
        .bind(invoice.id.0)
        .bind(invoice.namespace.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM invoices WHERE id = $1 AND namespace = $2")
                .bind(invoice.id.0)
                .bind(invoice.namespace.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Err(BillingError::CannotAdvance(invoice.id)),
            None => Err(BillingError::NotFound(format!("invoice {}", invoice.id))),
        }
    }

    async fn list_customers_to_collect(
        &self,
        filter: &InvoiceFilter,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<CustomerRef>> {
        let rows: Vec<(String, Uuid)> = sqlx::query_as(
            r#"
            SELECT DISTINCT i.namespace, i.customer_id
            FROM invoices i
            JOIN invoice_lines l ON l.invoice_id = i.id
            WHERE i.status = 'gathering'
              AND l.deleted_at IS NULL
              AND l.parent_line_id IS NULL
              AND l.invoice_at <= $1
              AND (cardinality($2::text[]) = 0 OR i.namespace = ANY($2))
              AND (cardinality($3::uuid[]) = 0 OR i.customer_id = ANY($3))
            ORDER BY i.customer_id
            "#,
        )
        .bind(as_of)
        .bind(namespace_filter(&filter.namespaces))
        .bind(customer_filter(&filter.customers))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(namespace, customer_id)| {
                Ok(CustomerRef {
                    namespace: Namespace::new(namespace)?,
                    customer_id: customer_id.into(),
                })
            })
            .collect()
    }

    async fn collect_customer(
        &self,
        customer: &CustomerRef,
        as_of: OffsetDateTime,
    ) -> BillingResult<Vec<InvoiceId>> {
        let mut tx = self.pool.begin().await?;

        let gathering: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, currency FROM invoices
            WHERE namespace = $1 AND customer_id = $2 AND status = 'gathering'
            FOR UPDATE
            "#,
        )
        .bind(customer.namespace.as_str())
        .bind(customer.customer_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let mut created = Vec::new();
        for (gathering_id, currency) in gathering {
            let (due,): (i64,) = sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM invoice_lines
                WHERE invoice_id = $1 AND deleted_at IS NULL
                  AND parent_line_id IS NULL AND invoice_at <= $2
                "#,
            )
            .bind(gathering_id)
            .bind(as_of)
            .fetch_one(&mut *tx)
            .await?;

            if due == 0 {
                continue;
            }

            let draft_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO invoices (id, namespace, customer_id, currency, status, draft_until)
                VALUES ($1, $2, $3, $4, 'draft', $5)
                "#,
            )
            .bind(draft_id)
            .bind(customer.namespace.as_str())
            .bind(customer.customer_id.0)
            .bind(&currency)
            .bind(as_of)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE invoice_lines SET invoice_id = $1, updated_at = NOW()
                WHERE invoice_id = $2 AND deleted_at IS NULL
                  AND parent_line_id IS NULL AND invoice_at <= $3
                "#,
            )
            .bind(draft_id)
            .bind(gathering_id)
            .bind(as_of)
            .execute(&mut *tx)
            .await?;

            created.push(InvoiceId::from(draft_id));
        }

        tx.commit().await?;

        Ok(created)
    }
}

// =============================================================================
// Subscription source
// =============================================================================

#[derive(Clone)]
pub struct PgSubscriptionSource {
    pool: PgPool,
}

impl PgSubscriptionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    namespace: String,
    customer_id: Uuid,
    name: String,
    currency: String,
    active_from: OffsetDateTime,
    active_to: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct PhaseRow {
    id: Uuid,
    key: String,
    name: String,
    active_from: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    phase_id: Uuid,
    key: String,
    active_from: OffsetDateTime,
    active_to: Option<OffsetDateTime>,
    rate_card: Json<RateCard>,
}

#[async_trait]
impl SubscriptionSource for PgSubscriptionSource {
    async fn list_subscriptions(
        &self,
        input: &ListSubscriptionsInput,
    ) -> BillingResult<Vec<SubscriptionRef>> {
        let rows: Vec<(Uuid, String, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, namespace, customer_id
            FROM subscriptions
            WHERE active_from < $1
              AND (active_to IS NULL OR active_to > $2)
              AND (cardinality($3::text[]) = 0 OR namespace = ANY($3))
              AND (cardinality($4::uuid[]) = 0 OR customer_id = ANY($4))
            ORDER BY id
            "#,
        )
        .bind(input.active_in.end)
        .bind(input.active_in.start)
        .bind(namespace_filter(&input.namespaces))
        .bind(customer_filter(&input.customers))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, namespace, customer_id)| {
                Ok(SubscriptionRef {
                    namespace: Namespace::new(namespace)?,
                    id: id.into(),
                    customer_id: customer_id.into(),
                })
            })
            .collect()
    }

    async fn get_view(
        &self,
        namespace: &Namespace,
        id: SubscriptionId,
    ) -> BillingResult<SubscriptionView> {
        let subscription: SubscriptionRow = sqlx::query_as(
            r#"
            SELECT id, namespace, customer_id, name, currency, active_from, active_to
            FROM subscriptions
            WHERE id = $1 AND namespace = $2
            "#,
        )
        .bind(id.0)
        .bind(namespace.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::SubscriptionNotFound(id))?;

        let phases: Vec<PhaseRow> = sqlx::query_as(
            r#"
            SELECT id, key, name, active_from
            FROM subscription_phases
            WHERE subscription_id = $1
            ORDER BY active_from
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.phase_id, i.key, i.active_from, i.active_to, i.rate_card
            FROM subscription_items i
            JOIN subscription_phases p ON p.id = i.phase_id
            WHERE p.subscription_id = $1
            ORDER BY i.active_from
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut items_by_phase: BTreeMap<Uuid, BTreeMap<String, Vec<SubscriptionItem>>> = BTreeMap::new();
        for item in items {
            items_by_phase
                .entry(item.phase_id)
                .or_default()
                .entry(item.key.clone())
                .or_default()
                .push(SubscriptionItem {
                    id: ItemId::from(item.id),
                    key: item.key,
                    active_from: item.active_from,
                    active_to: item.active_to,
                    rate_card: item.rate_card.0,
                });
        }

        let phases = phases
            .into_iter()
            .map(|phase| SubscriptionPhase {
                id: PhaseId::from(phase.id),
                items_by_key: items_by_phase.remove(&phase.id).unwrap_or_default(),
                key: phase.key,
                name: phase.name,
                active_from: phase.active_from,
            })
            .collect();

        Ok(SubscriptionView {
            subscription: Subscription {
                id: subscription.id.into(),
                namespace: Namespace::new(subscription.namespace)?,
                customer_id: subscription.customer_id.into(),
                name: subscription.name,
                currency: subscription.currency,
                active_from: subscription.active_from,
                active_to: subscription.active_to,
            },
            phases,
        })
    }
}
