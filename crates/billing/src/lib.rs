//! linesync billing engine
//!
//! Derives the invoice lines a subscription should have at a point in time
//! and reconciles them against the persisted lines of the billing service.

pub mod adapter;
pub mod batch;
pub mod cadence;
pub mod currency;
pub mod error;
pub mod invoice_worker;
pub mod line;
pub mod merge;
pub mod phase_iterator;
pub mod reconciler;
pub mod store;
pub mod subscription;
pub mod sync;

pub use adapter::{
    BillingProfile, BillingStore, BillingTransaction, CustomerRef, InvoiceFilter, InvoiceRef,
    InvoiceService, ListSubscriptionsInput, SubscriptionRef, SubscriptionSource,
};
pub use batch::{run_batched, Shutdown, ShutdownTrigger};
pub use cadence::Cadence;
pub use currency::CurrencyCalculator;
pub use error::{BatchErrors, BillingError, BillingResult};
pub use invoice_worker::{CollectInput, InvoiceAdvancer, InvoiceCollector};
pub use line::{Line, LineInput, LinePricing, LineStatus};
pub use phase_iterator::{Candidate, PhaseIterator, METER_RESOLUTION};
pub use reconciler::{ReconcileInput, Reconciler};
pub use store::{MemoryBillingStore, MemorySubscriptionSource, PgBillingStore, PgSubscriptionSource};
pub use subscription::{
    PaymentTerm, Price, RateCard, Subscription, SubscriptionItem, SubscriptionPhase, SubscriptionView,
};
pub use sync::{SyncResult, Synchronizer};
