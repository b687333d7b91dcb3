//! Storage backends for the billing and subscription services

pub mod memory;
pub mod postgres;

pub use memory::{MemoryBillingStore, MemoryInvoice, MemoryInvoiceStatus, MemorySubscriptionSource};
pub use postgres::{PgBillingStore, PgBillingTransaction, PgSubscriptionSource};
