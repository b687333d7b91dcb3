//! Billing error types

use std::fmt;

use linesync_shared::{CustomerId, InvoiceId, LineId, Namespace, SubscriptionId, ValidationError};
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    // Input validation, rejected before any I/O
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Not found
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No billing profile for customer {customer_id} in namespace {namespace}")]
    BillingProfileNotFound {
        namespace: Namespace,
        customer_id: CustomerId,
    },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Phase {phase_key} not found in subscription {subscription_id}")]
    PhaseNotFound {
        subscription_id: SubscriptionId,
        phase_key: String,
    },

    // Generation errors
    #[error("One-time item {item_key} has neither an item end nor a phase end")]
    OpenEndedOneTimeItem { item_key: String },

    #[error("Unsupported price type {price_type} for item {item_key}")]
    UnsupportedPrice { item_key: String, price_type: String },

    #[error("Usage based item {item_key} has no feature key")]
    MissingFeatureKey { item_key: String },

    #[error("No currency calculator for {0}")]
    UnknownCurrency(String),

    #[error("Invalid billing cadence {value}: {reason}")]
    InvalidCadence { value: String, reason: String },

    // Invariant violations: never retried, never absorbed
    #[error("Invariant violation: duplicate unique id {0}")]
    DuplicateUniqueId(String),

    #[error("Invariant violation: duplicate child unique reference id {0}")]
    DuplicateChildReference(String),

    #[error("Invariant violation: line {line_id} has unexpected status {status}")]
    UnexpectedLineStatus { line_id: LineId, status: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // Known benign race with the invoice state machine
    #[error("Invoice {0} cannot be advanced")]
    CannotAdvance(InvoiceId),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Batch(BatchErrors),
}

impl BillingError {
    /// Data corruption or programming errors that must abort the sync
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            BillingError::DuplicateUniqueId(_)
                | BillingError::DuplicateChildReference(_)
                | BillingError::UnexpectedLineStatus { .. }
                | BillingError::InvariantViolation(_)
        )
    }

    pub fn is_cannot_advance(&self) -> bool {
        matches!(self, BillingError::CannotAdvance(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BillingError::NotFound(_)
                | BillingError::BillingProfileNotFound { .. }
                | BillingError::SubscriptionNotFound(_)
                | BillingError::PhaseNotFound { .. }
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors collected from a best-effort batch run, one per failed item
#[derive(Debug, Default)]
pub struct BatchErrors {
    pub failures: Vec<(String, BillingError)>,
}

impl BatchErrors {
    pub fn push(&mut self, item: impl Into<String>, err: BillingError) {
        self.failures.push((item.into(), err));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the joined error
    pub fn into_result(self) -> BillingResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BillingError::Batch(self))
        }
    }
}

impl fmt::Display for BatchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item(s) failed", self.failures.len())?;
        for (item, err) in &self.failures {
            write!(f, "; {item}: {err}")?;
        }
        Ok(())
    }
}
