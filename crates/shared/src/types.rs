//! Common types used across linesync

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::ValidationError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Customer ID wrapper
    CustomerId
);
uuid_id!(
    /// Subscription ID wrapper
    SubscriptionId
);
uuid_id!(
    /// Subscription phase ID wrapper
    PhaseId
);
uuid_id!(
    /// Subscription item (one version of an item key) ID wrapper
    ItemId
);
uuid_id!(
    /// Invoice ID wrapper
    InvoiceId
);
uuid_id!(
    /// Invoice line ID wrapper
    LineId
);

/// Tenant namespace. Every persisted record is scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyNamespace);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Periods
// =============================================================================

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Period {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// A period is empty when it covers no time at all
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Floor the end of the period to `resolution`. The start is kept as is,
    /// so the result may be empty.
    pub fn truncate_end(&self, resolution: Duration) -> Self {
        Self {
            start: self.start,
            end: truncate_time(self.end, resolution),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Floor a timestamp to a multiple of `resolution` since the unix epoch
pub fn truncate_time(at: OffsetDateTime, resolution: Duration) -> OffsetDateTime {
    let step = resolution.whole_nanoseconds();
    if step <= 0 {
        return at;
    }

    let nanos = at.unix_timestamp_nanos();
    let floored = nanos - nanos.rem_euclid(step);

    OffsetDateTime::from_unix_timestamp_nanos(floored)
        .map(|t| t.to_offset(at.offset()))
        .unwrap_or(at)
}
