//! linesync shared types and utilities
//!
//! ID newtypes, billing periods, the clock capability and database helpers
//! shared by the billing engine and the worker.

pub mod clock;
pub mod db;
pub mod error;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use db::*;
pub use error::*;
pub use types::*;
