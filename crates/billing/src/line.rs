//! Invoice lines as persisted by the billing service
//!
//! Lines form a shallow tree: a `Split` parent owns the progressively billed
//! children through `parent_line_id` back-references. The tree is never held
//! as live references; `LineArena` indexes a flat list by ID instead.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use linesync_shared::{CustomerId, InvoiceId, ItemId, LineId, Namespace, Period, PhaseId, SubscriptionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingError;
use crate::subscription::{PaymentTerm, Price, TaxConfig};

/// Line status as reported by the billing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    /// Regular line, billed as a whole
    Valid,
    /// Progressively billed parent; the billed pieces are its children
    Split,
    /// Calculated detail of another line, never produced by subscription sync
    Detailed,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Valid => "valid",
            LineStatus::Split => "split",
            LineStatus::Detailed => "detailed",
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(LineStatus::Valid),
            "split" => Ok(LineStatus::Split),
            "detailed" => Ok(LineStatus::Detailed),
            other => Err(BillingError::InvariantViolation(format!(
                "unknown line status {other}"
            ))),
        }
    }
}

/// Links a line back to the subscription item that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionReference {
    pub subscription_id: SubscriptionId,
    pub phase_id: PhaseId,
    pub item_id: ItemId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatFeeLine {
    pub per_unit_amount: Decimal,
    pub quantity: Decimal,
    pub payment_term: PaymentTerm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBasedLine {
    pub price: Price,
    pub feature_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinePricing {
    FlatFee(FlatFeeLine),
    UsageBased(UsageBasedLine),
}

/// Line content derived from a subscription, before it is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInput {
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub period: Period,
    pub invoice_at: OffsetDateTime,
    pub pricing: LinePricing,
    pub tax_config: Option<TaxConfig>,
    pub child_unique_reference_id: String,
    pub subscription: SubscriptionReference,
}

/// A persisted invoice line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub namespace: Namespace,
    pub customer_id: CustomerId,
    pub invoice_id: InvoiceId,
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub status: LineStatus,
    pub period: Period,
    #[serde(with = "time::serde::rfc3339")]
    pub invoice_at: OffsetDateTime,
    pub pricing: LinePricing,
    pub tax_config: Option<TaxConfig>,
    /// Set on lines created by subscription sync; manual lines carry none
    pub child_unique_reference_id: Option<String>,
    pub subscription: Option<SubscriptionReference>,
    pub parent_line_id: Option<LineId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Line {
    /// Materialize a pending line on `invoice_id`
    pub fn from_input(
        input: LineInput,
        namespace: Namespace,
        customer_id: CustomerId,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: LineId::new(),
            namespace,
            customer_id,
            invoice_id,
            name: input.name,
            description: input.description,
            currency: input.currency,
            status: LineStatus::Valid,
            period: input.period,
            invoice_at: input.invoice_at,
            pricing: input.pricing,
            tax_config: input.tax_config,
            child_unique_reference_id: Some(input.child_unique_reference_id),
            subscription: Some(input.subscription),
            parent_line_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn flat_fee(&self) -> Option<&FlatFeeLine> {
        match &self.pricing {
            LinePricing::FlatFee(flat) => Some(flat),
            LinePricing::UsageBased(_) => None,
        }
    }
}

/// Flat, ID-indexed view over one subscription's lines. Tracks the loaded
/// state so only lines that actually changed get written back.
#[derive(Debug)]
pub struct LineArena {
    lines: Vec<Line>,
    loaded: Vec<Line>,
    by_id: HashMap<LineId, usize>,
    children: HashMap<LineId, Vec<usize>>,
}

impl LineArena {
    pub fn new(lines: Vec<Line>) -> Self {
        let mut by_id = HashMap::with_capacity(lines.len());
        let mut children: HashMap<LineId, Vec<usize>> = HashMap::new();

        for (idx, line) in lines.iter().enumerate() {
            by_id.insert(line.id, idx);
            if let Some(parent) = line.parent_line_id {
                children.entry(parent).or_default().push(idx);
            }
        }

        for indexes in children.values_mut() {
            indexes.sort_by_key(|&i| (lines[i].period.start, lines[i].period.end));
        }

        Self {
            loaded: lines.clone(),
            lines,
            by_id,
            children,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Line> {
        self.lines.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Line> {
        self.lines.get_mut(idx)
    }

    pub fn index_of(&self, id: LineId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Children of `parent`, ordered by period
    pub fn children_of(&self, parent: LineId) -> &[usize] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Line)> {
        self.lines.iter().enumerate()
    }

    /// Lines that differ from their loaded state, stamped with `now`
    pub fn into_changed(self, now: OffsetDateTime) -> Vec<Line> {
        self.lines
            .into_iter()
            .zip(self.loaded)
            .filter(|(current, loaded)| current != loaded)
            .map(|(mut line, _)| {
                line.updated_at = now;
                line
            })
            .collect()
    }
}
