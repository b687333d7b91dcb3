//! Read-only view of a subscription as supplied by the subscription service
//!
//! A subscription is an ordered list of phases. Each phase groups its items by
//! key, and each key holds one or more time-disjoint versions of the item,
//! each carrying a snapshot of its rate card.

use std::collections::BTreeMap;

use linesync_shared::{CustomerId, ItemId, Namespace, PhaseId, SubscriptionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cadence::Cadence;

// =============================================================================
// Prices
// =============================================================================

/// When a flat fee is charged relative to its service period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTerm {
    #[default]
    InAdvance,
    InArrears,
}

impl std::fmt::Display for PaymentTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentTerm::InAdvance => write!(f, "in_advance"),
            PaymentTerm::InArrears => write!(f, "in_arrears"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatPrice {
    pub amount: Decimal,
    #[serde(default)]
    pub payment_term: PaymentTerm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPrice {
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieredPriceMode {
    Volume,
    Graduated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Upper bound of the tier; `None` for the last, open tier
    #[serde(default)]
    pub up_to_amount: Option<Decimal>,
    #[serde(default)]
    pub flat_price: Option<Decimal>,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredPrice {
    pub mode: TieredPriceMode,
    pub tiers: Vec<PriceTier>,
}

/// Price derived from the cost of an underlying resource. Not billable
/// through subscription sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPrice {
    pub multiplier: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Price {
    Flat(FlatPrice),
    Unit(UnitPrice),
    Tiered(TieredPrice),
    Dynamic(DynamicPrice),
}

impl Price {
    pub fn type_name(&self) -> &'static str {
        match self {
            Price::Flat(_) => "flat",
            Price::Unit(_) => "unit",
            Price::Tiered(_) => "tiered",
            Price::Dynamic(_) => "dynamic",
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, Price::Flat(_))
    }
}

// =============================================================================
// Rate cards and items
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaxConfig {
    #[serde(default)]
    pub tax_code: Option<String>,
    #[serde(default)]
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCard {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
    /// `None` for one-time items
    #[serde(default)]
    pub billing_cadence: Option<Cadence>,
    #[serde(default)]
    pub feature_key: Option<String>,
    #[serde(default)]
    pub tax_config: Option<TaxConfig>,
}

/// One version of a subscription item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: ItemId,
    pub key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub active_from: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub active_to: Option<OffsetDateTime>,
    pub rate_card: RateCard,
}

impl SubscriptionItem {
    pub fn is_priced(&self) -> bool {
        self.rate_card.price.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPhase {
    pub id: PhaseId,
    pub key: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub active_from: OffsetDateTime,
    /// Item versions grouped by item key
    pub items_by_key: BTreeMap<String, Vec<SubscriptionItem>>,
}

impl SubscriptionPhase {
    pub fn items(&self) -> impl Iterator<Item = &SubscriptionItem> {
        self.items_by_key.values().flatten()
    }
}

/// Boundary of a phase: `[active_from, active_to)`, open when `active_to` is `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCadence {
    pub active_from: OffsetDateTime,
    pub active_to: Option<OffsetDateTime>,
}

impl PhaseCadence {
    /// A phase starting at or after the subscription end covers no time
    pub fn is_empty(&self) -> bool {
        self.active_to.is_some_and(|end| end <= self.active_from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub namespace: Namespace,
    pub customer_id: CustomerId,
    pub name: String,
    /// ISO-4217 code
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub active_from: OffsetDateTime,
    /// Set once the subscription is cancelled
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub active_to: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub phases: Vec<SubscriptionPhase>,
}

impl SubscriptionView {
    /// Phases ordered by their start
    pub fn sorted_phases(&self) -> Vec<&SubscriptionPhase> {
        let mut phases: Vec<&SubscriptionPhase> = self.phases.iter().collect();
        phases.sort_by_key(|p| p.active_from);
        phases
    }

    /// Resolve a phase's boundary. A phase ends where the next one starts; no
    /// phase outlives the subscription (open if it was never cancelled).
    pub fn phase_cadence(&self, phase_key: &str) -> Option<PhaseCadence> {
        let phases = self.sorted_phases();
        let idx = phases.iter().position(|p| p.key == phase_key)?;

        let active_to = match (phases.get(idx + 1), self.subscription.active_to) {
            (Some(next), Some(end)) => Some(next.active_from.min(end)),
            (Some(next), None) => Some(next.active_from),
            (None, end) => end,
        };

        Some(PhaseCadence {
            active_from: phases[idx].active_from,
            active_to,
        })
    }
}
