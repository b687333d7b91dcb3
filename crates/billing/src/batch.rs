//! Bounded fan-out over independent work items
//!
//! Items are processed in fixed-size batches, one after the other. Within a
//! batch every item gets its own task; the batch is awaited as a whole before
//! the next one starts, which caps concurrent downstream connections at the
//! batch size. Failures are collected and never stop the run.

use std::future::Future;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{BatchErrors, BillingError, BillingResult};

/// Sending half of a shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Receiving half of a shutdown signal. Checked between batches: work already
/// started is allowed to finish its write.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    /// A signal that never fires
    pub fn never() -> Shutdown {
        Shutdown::channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

/// Run `op` over `items` in batches of `batch_size`, returning every failure
pub async fn run_batched<T, L, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    shutdown: &Shutdown,
    label: L,
    op: F,
) -> BatchErrors
where
    T: Send + 'static,
    L: Fn(&T) -> String,
    F: Fn(T) -> Fut,
    Fut: Future<Output = BillingResult<()>> + Send + 'static,
{
    let batch_size = batch_size.max(1);
    let total = items.len();
    let mut errors = BatchErrors::default();
    let mut remaining = items.into_iter().peekable();
    let mut processed = 0usize;

    while remaining.peek().is_some() {
        if shutdown.is_triggered() {
            warn!(
                processed = processed,
                remaining = total - processed,
                "Shutdown requested, not starting further batches"
            );
            errors.push(
                format!("{} unprocessed item(s)", total - processed),
                BillingError::Cancelled,
            );
            break;
        }

        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        let batch_len = batch.len();

        // Sized to the batch so no worker ever blocks on reporting
        let (err_tx, mut err_rx) = mpsc::channel::<(String, BillingError)>(batch_len);
        let mut workers = JoinSet::new();

        for item in batch {
            let name = label(&item);
            let work = op(item);
            let err_tx = err_tx.clone();
            workers.spawn(async move {
                if let Err(e) = work.await {
                    let _ = err_tx.send((name, e)).await;
                }
            });
        }
        drop(err_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                errors.push("worker", BillingError::Internal(e.to_string()));
            }
        }
        while let Some((name, err)) = err_rx.recv().await {
            errors.push(name, err);
        }

        processed += batch_len;
        debug!(processed = processed, total = total, "Batch finished");
    }

    errors
}
