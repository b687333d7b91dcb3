//! Subscription to invoice line synchronization
//!
//! `Synchronizer::synchronize_subscription` derives the lines a subscription
//! should have up to `as_of`, diffs them against the persisted lines by their
//! child unique reference ID and applies creates, soft deletes and merges in
//! one storage transaction. It holds no lock: running it twice, concurrently
//! or after a crash converges on the same line set.

use std::collections::HashMap;
use std::sync::Arc;

use linesync_shared::Clock;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::adapter::{BillingStore, BillingTransaction};
use crate::currency::CurrencyCalculator;
use crate::error::{BillingError, BillingResult};
use crate::line::{FlatFeeLine, LineArena, LineInput, LinePricing, SubscriptionReference, UsageBasedLine};
use crate::merge::merge_line;
use crate::phase_iterator::{Candidate, PhaseIterator};
use crate::subscription::{PaymentTerm, Price, SubscriptionView};

/// What a sync changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SyncResult {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Bring the persisted lines of `view` in line with its state at `as_of`.
    /// All or nothing: any error rolls the whole transaction back.
    pub async fn synchronize_subscription(
        &self,
        view: &SubscriptionView,
        as_of: OffsetDateTime,
    ) -> BillingResult<SyncResult> {
        let subscription_id = view.subscription.id;
        let mut tx = self.store.begin().await?;

        match self.sync_in_tx(tx.as_mut(), view, as_of).await {
            Ok(result) => {
                tx.commit().await?;
                if !result.is_noop() {
                    info!(
                        subscription_id = %subscription_id,
                        created = result.created,
                        updated = result.updated,
                        deleted = result.deleted,
                        "Synchronized subscription lines"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        subscription_id = %subscription_id,
                        error = %rollback_err,
                        "Failed to roll back subscription sync"
                    );
                }
                if e.is_invariant_violation() {
                    error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Invariant violation while synchronizing subscription"
                    );
                }
                Err(e)
            }
        }
    }

    async fn sync_in_tx(
        &self,
        tx: &mut dyn BillingTransaction,
        view: &SubscriptionView,
        as_of: OffsetDateTime,
    ) -> BillingResult<SyncResult> {
        let subscription = &view.subscription;
        let namespace = &subscription.namespace;
        let now = self.clock.now();

        if tx.get_profile(namespace, subscription.customer_id).await?.is_none() {
            return Err(BillingError::BillingProfileNotFound {
                namespace: namespace.clone(),
                customer_id: subscription.customer_id,
            });
        }

        let currency = CurrencyCalculator::for_code(&subscription.currency)?;

        let candidates = collect_candidates(view, as_of)?;
        let mut in_scope: HashMap<&str, &Candidate<'_>> = HashMap::with_capacity(candidates.len());
        for candidate in &candidates {
            if in_scope.insert(candidate.unique_id.as_str(), candidate).is_some() {
                return Err(BillingError::DuplicateUniqueId(candidate.unique_id.clone()));
            }
        }

        let mut arena = LineArena::new(tx.list_subscription_lines(namespace, subscription.id).await?);

        // Manually created lines have no reference and stay out of the diff
        let mut existing: HashMap<String, usize> = HashMap::new();
        for (idx, line) in arena.iter() {
            if let Some(reference) = &line.child_unique_reference_id {
                if existing.insert(reference.clone(), idx).is_some() {
                    return Err(BillingError::DuplicateChildReference(reference.clone()));
                }
            }
        }

        let mut result = SyncResult::default();
        let mut to_create = Vec::new();

        for candidate in &candidates {
            let expected = line_input(view, candidate, &currency)?;

            match (existing.get(candidate.unique_id.as_str()), expected) {
                (None, Some(expected)) => to_create.push(expected),
                (None, None) => {}
                (Some(&idx), Some(expected)) => {
                    result.deleted += merge_line(&mut arena, idx, &expected, now)?;
                }
                // The item lost its price, the line is no longer billable
                (Some(&idx), None) => {
                    if soft_delete(&mut arena, idx, now) {
                        result.deleted += 1;
                    }
                }
            }
        }

        for (reference, &idx) in &existing {
            if !in_scope.contains_key(reference.as_str()) && soft_delete(&mut arena, idx, now) {
                result.deleted += 1;
            }
        }

        if !to_create.is_empty() {
            result.created = to_create.len();
            tx.create_pending_lines(namespace, subscription.customer_id, currency.code(), to_create, now)
                .await?;
        }

        let changed = arena.into_changed(now);
        result.updated = changed.len().saturating_sub(result.deleted);
        if !changed.is_empty() {
            tx.update_lines(namespace, subscription.customer_id, changed).await?;
        }

        Ok(result)
    }
}

/// Mark a line deleted; its content stays as it was. Returns false when the
/// line was already deleted.
fn soft_delete(arena: &mut LineArena, idx: usize, now: OffsetDateTime) -> bool {
    match arena.get_mut(idx) {
        Some(line) if !line.is_deleted() => {
            line.deleted_at = Some(now);
            true
        }
        _ => false,
    }
}

/// Generate the candidates of every phase relevant at `as_of`
pub fn collect_candidates(view: &SubscriptionView, as_of: OffsetDateTime) -> BillingResult<Vec<Candidate<'_>>> {
    let mut out = Vec::new();

    for phase in view.sorted_phases() {
        let iterator = PhaseIterator::new(view, &phase.key)?;
        if iterator.is_empty() || !iterator.has_invoicable_items() {
            continue;
        }

        let mut generation_limit = as_of;
        if iterator.phase_start() > as_of {
            // Future phases still get their first line, so we don't have to
            // revisit every subscription on every tick
            match iterator.minimum_billable_time()? {
                Some(min) => generation_limit = min,
                None => continue,
            }
        }

        out.extend(iterator.generate(generation_limit)?);

        if iterator.phase_end().is_some_and(|end| end >= as_of) {
            break;
        }
    }

    Ok(out)
}

/// Line content for a candidate; `None` when the item carries no price
pub fn line_input(
    view: &SubscriptionView,
    candidate: &Candidate<'_>,
    currency: &CurrencyCalculator,
) -> BillingResult<Option<LineInput>> {
    let item = candidate.item;
    let rate_card = &item.rate_card;
    let Some(price) = &rate_card.price else {
        return Ok(None);
    };

    let (pricing, invoice_at) = match price {
        Price::Flat(flat) => {
            let (amount, invoice_at) = match flat.payment_term {
                PaymentTerm::InAdvance => (flat.amount, candidate.period.start),
                PaymentTerm::InArrears => (
                    currency.round(flat.amount * candidate.period_percentage()),
                    candidate.period.end,
                ),
            };
            (
                LinePricing::FlatFee(FlatFeeLine {
                    per_unit_amount: amount,
                    quantity: Decimal::ONE,
                    payment_term: flat.payment_term,
                }),
                invoice_at,
            )
        }
        Price::Unit(_) | Price::Tiered(_) => {
            let feature_key = rate_card
                .feature_key
                .clone()
                .ok_or_else(|| BillingError::MissingFeatureKey {
                    item_key: item.key.clone(),
                })?;
            (
                LinePricing::UsageBased(UsageBasedLine {
                    price: price.clone(),
                    feature_key,
                }),
                candidate.period.end,
            )
        }
        other => {
            return Err(BillingError::UnsupportedPrice {
                item_key: item.key.clone(),
                price_type: other.type_name().to_string(),
            })
        }
    };

    Ok(Some(LineInput {
        name: rate_card.name.clone(),
        description: rate_card.description.clone(),
        currency: currency.code().to_string(),
        period: candidate.period,
        invoice_at,
        pricing,
        tax_config: rate_card.tax_config.clone(),
        child_unique_reference_id: candidate.unique_id.clone(),
        subscription: SubscriptionReference {
            subscription_id: view.subscription.id,
            phase_id: candidate.phase_id,
            item_id: item.id,
        },
    }))
}
