//! Billable period generation for a single subscription phase
//!
//! For every item key of the phase, each item version is expanded into the
//! periods it should be billed for. Every period gets a deterministic unique
//! ID so repeated generation lines up with what was persisted earlier:
//!
//! ```text
//! <subscription id>/<phase key>/<item key>/v[<version>]/period[<index>]
//! ```
//!
//! One-time items have no `period[..]` suffix.

use linesync_shared::{Period, PhaseId};
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::subscription::{PhaseCadence, SubscriptionItem, SubscriptionPhase, SubscriptionView};

/// Resolution of the metering system. Usage based periods are truncated to it.
pub const METER_RESOLUTION: Duration = Duration::MINUTE;

/// A billable period of one item version. Recomputed on every sync.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub unique_id: String,
    pub item: &'a SubscriptionItem,
    pub phase_id: PhaseId,
    /// Period after clipping to the item/phase end and meter resolution
    pub period: Period,
    /// Full cadence length, used for prorating
    pub non_truncated_period: Period,
}

impl Candidate<'_> {
    /// Share of the full cadence this period covers
    pub fn period_percentage(&self) -> Decimal {
        let full = self.non_truncated_period.duration().whole_nanoseconds();
        if full == 0 {
            return Decimal::ONE;
        }
        let actual = self.period.duration().whole_nanoseconds();

        match (Decimal::try_from_i128_with_scale(actual, 0), Decimal::try_from_i128_with_scale(full, 0)) {
            (Ok(actual), Ok(full)) => actual.checked_div(full).unwrap_or(Decimal::ONE),
            _ => Decimal::ONE,
        }
    }
}

pub struct PhaseIterator<'a> {
    subscription: &'a SubscriptionView,
    phase: &'a SubscriptionPhase,
    cadence: PhaseCadence,
}

impl<'a> PhaseIterator<'a> {
    pub fn new(subscription: &'a SubscriptionView, phase_key: &str) -> BillingResult<Self> {
        let not_found = || BillingError::PhaseNotFound {
            subscription_id: subscription.subscription.id,
            phase_key: phase_key.to_string(),
        };

        let phase = subscription
            .phases
            .iter()
            .find(|p| p.key == phase_key)
            .ok_or_else(not_found)?;
        let cadence = subscription.phase_cadence(phase_key).ok_or_else(not_found)?;

        Ok(Self {
            subscription,
            phase,
            cadence,
        })
    }

    pub fn phase_start(&self) -> OffsetDateTime {
        self.cadence.active_from
    }

    pub fn phase_end(&self) -> Option<OffsetDateTime> {
        self.cadence.active_to
    }

    /// The phase never became active before the subscription ended
    pub fn is_empty(&self) -> bool {
        self.cadence.is_empty()
    }

    pub fn has_invoicable_items(&self) -> bool {
        self.phase.items().any(SubscriptionItem::is_priced)
    }

    /// Earliest point at which this phase has something to bill. Used to
    /// bootstrap phases that start after the sync horizon.
    pub fn minimum_billable_time(&self) -> BillingResult<Option<OffsetDateTime>> {
        let mut min: Option<OffsetDateTime> = None;

        for item in self.phase.items().filter(|i| i.is_priced()) {
            let first = if item.rate_card.billing_cadence.is_none() {
                Some(item.active_from)
            } else {
                // Generating up to the item's own start yields exactly its first period
                let periods = self.recurring_periods(item, 0, item.active_from)?;
                truncate_if_needed(periods).first().map(|c| c.period.start)
            };

            if let Some(first) = first {
                min = Some(min.map_or(first, |m| m.min(first)));
            }
        }

        Ok(min)
    }

    /// Generate all billable periods up to `iteration_end`. Every item
    /// version yields at least its first period, even past the horizon.
    pub fn generate(&self, iteration_end: OffsetDateTime) -> BillingResult<Vec<Candidate<'a>>> {
        let mut out = Vec::new();

        for versions in self.phase.items_by_key.values() {
            // Version indexes are part of the unique ID, keep them stable
            let mut versions: Vec<&'a SubscriptionItem> = versions.iter().collect();
            versions.sort_by_key(|item| item.active_from);

            for (version, item) in versions.into_iter().enumerate() {
                if item.rate_card.billing_cadence.is_none() {
                    if let Some(candidate) = self.one_time_period(item, version)? {
                        out.push(candidate);
                    }
                    continue;
                }

                out.extend(self.recurring_periods(item, version, iteration_end)?);
            }
        }

        Ok(truncate_if_needed(out))
    }

    fn one_time_period(
        &self,
        item: &'a SubscriptionItem,
        version: usize,
    ) -> BillingResult<Option<Candidate<'a>>> {
        if !item.is_priced() {
            return Ok(None);
        }

        // Open-ended one-time charges are not supported, we never guess an end
        let mut end = item
            .active_to
            .or(self.cadence.active_to)
            .ok_or_else(|| BillingError::OpenEndedOneTimeItem {
                item_key: item.key.clone(),
            })?;
        if let Some(phase_end) = self.cadence.active_to {
            end = end.min(phase_end);
        }

        // Ends before it starts, e.g. the subscription was cancelled first
        if end <= item.active_from {
            return Ok(None);
        }

        let period = Period::new(item.active_from, end);
        Ok(Some(Candidate {
            unique_id: self.unique_id(item, version, None),
            item,
            phase_id: self.phase.id,
            period,
            non_truncated_period: period,
        }))
    }

    fn recurring_periods(
        &self,
        item: &'a SubscriptionItem,
        version: usize,
        iteration_end: OffsetDateTime,
    ) -> BillingResult<Vec<Candidate<'a>>> {
        let mut out = Vec::new();
        let Some(cadence) = item.rate_card.billing_cadence else {
            return Ok(out);
        };

        let mut index: u32 = 0;
        loop {
            let start = cadence.add_times(item.active_from, index)?;
            let full_end = cadence.add_times(item.active_from, index + 1)?;

            let mut end = full_end;
            if let Some(item_end) = item.active_to {
                end = end.min(item_end);
            }
            if let Some(phase_end) = self.cadence.active_to {
                end = end.min(phase_end);
            }

            // Zero-length item versions bill nothing
            if end <= start {
                break;
            }

            out.push(Candidate {
                unique_id: self.unique_id(item, version, Some(index)),
                item,
                phase_id: self.phase.id,
                period: Period::new(start, end),
                non_truncated_period: Period::new(start, full_end),
            });
            index += 1;

            if self.cadence.active_to.is_some_and(|phase_end| end >= phase_end)
                || item.active_to.is_some_and(|item_end| end >= item_end)
                || end >= iteration_end
            {
                break;
            }
        }

        Ok(out)
    }

    fn unique_id(&self, item: &SubscriptionItem, version: usize, period: Option<u32>) -> String {
        let mut id = format!(
            "{}/{}/{}/v[{}]",
            self.subscription.subscription.id, self.phase.key, item.key, version
        );
        if let Some(period) = period {
            id.push_str(&format!("/period[{period}]"));
        }
        id
    }
}

/// Truncate usage based periods to the meter resolution. Flat fees are billed
/// by time and keep their exact period.
fn truncate_if_needed(candidates: Vec<Candidate<'_>>) -> Vec<Candidate<'_>> {
    candidates
        .into_iter()
        .filter_map(|mut candidate| {
            match &candidate.item.rate_card.price {
                Some(price) if !price.is_flat() => {
                    candidate.period = candidate.period.truncate_end(METER_RESOLUTION);
                    if candidate.period.is_empty() {
                        return None;
                    }
                }
                _ => {}
            }
            Some(candidate)
        })
        .collect()
}
