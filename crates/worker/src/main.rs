//! linesync background worker
//!
//! Runs the billing jobs on a cron schedule:
//! - hourly fail-safe subscription reconcile
//! - per-minute invoice collect and advance

mod config;

use std::sync::Arc;

use anyhow::Context;
use linesync_billing::{
    CollectInput, InvoiceAdvancer, InvoiceCollector, InvoiceFilter, PgBillingStore, PgSubscriptionSource,
    ReconcileInput, Reconciler, Shutdown, Synchronizer,
};
use linesync_shared::{create_migration_pool, create_pool, run_migrations, Clock, SystemClock};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    if config.run_migrations {
        let migration_pool = create_migration_pool(&config.database_url)
            .await
            .context("Failed to connect for migrations")?;
        run_migrations(&migration_pool)
            .await
            .context("Failed to run migrations")?;
        migration_pool.close().await;
        info!("Database migrations applied");
    }

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = PgBillingStore::new(pool.clone());
    let (shutdown_trigger, shutdown) = Shutdown::channel();

    let reconciler = Reconciler::new(
        Arc::new(PgSubscriptionSource::new(pool.clone())),
        Synchronizer::new(Arc::new(store.clone()), clock.clone()),
    )
    .with_batch_size(config.batch_size)
    .with_shutdown(shutdown.clone());

    let advancer = InvoiceAdvancer::new(Arc::new(store.clone()), clock.clone())
        .with_batch_size(config.batch_size)
        .with_shutdown(shutdown.clone());

    let collector = InvoiceCollector::new(Arc::new(store))
        .with_batch_size(config.batch_size)
        .with_shutdown(shutdown);

    let reconcile_input = ReconcileInput {
        lookback: config.lookback(),
        namespaces: config.namespaces.clone(),
        customers: config.customers.clone(),
    };
    let filter = InvoiceFilter {
        namespaces: config.namespaces.clone(),
        customers: config.customers.clone(),
    };

    let mut scheduler = JobScheduler::new().await?;
    scheduler
        .add(reconcile_job(&config.sync_schedule, reconciler, reconcile_input)?)
        .await?;
    scheduler
        .add(collect_job(&config.collect_schedule, collector, filter.clone(), clock)?)
        .await?;
    scheduler
        .add(advance_job(&config.advance_schedule, advancer, filter)?)
        .await?;
    scheduler.start().await?;

    info!(
        sync_schedule = %config.sync_schedule,
        collect_schedule = %config.collect_schedule,
        advance_schedule = %config.advance_schedule,
        batch_size = config.batch_size,
        "linesync worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested, letting running batches finish");
    shutdown_trigger.trigger();
    scheduler.shutdown().await?;
    pool.close().await;

    info!("linesync worker stopped");
    Ok(())
}

/// `RUST_LOG` filters, `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "linesync_worker=info,linesync_billing=info".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn reconcile_job(schedule: &str, reconciler: Reconciler, input: ReconcileInput) -> Result<Job, JobSchedulerError> {
    Job::new_async(schedule, move |_id, _scheduler| {
        let reconciler = reconciler.clone();
        let input = input.clone();
        Box::pin(async move {
            if let Err(e) = reconciler.all(&input).await {
                warn!(error = %e, "Subscription reconcile failed");
            }
        })
    })
}

fn collect_job(
    schedule: &str,
    collector: InvoiceCollector,
    filter: InvoiceFilter,
    clock: Arc<dyn Clock>,
) -> Result<Job, JobSchedulerError> {
    Job::new_async(schedule, move |_id, _scheduler| {
        let collector = collector.clone();
        let input = CollectInput {
            namespaces: filter.namespaces.clone(),
            customers: filter.customers.clone(),
            as_of: Some(clock.now()),
        };
        Box::pin(async move {
            if let Err(e) = collector.collect_all(&input).await {
                warn!(error = %e, "Invoice collect failed");
            }
        })
    })
}

fn advance_job(schedule: &str, advancer: InvoiceAdvancer, filter: InvoiceFilter) -> Result<Job, JobSchedulerError> {
    Job::new_async(schedule, move |_id, _scheduler| {
        let advancer = advancer.clone();
        let filter = filter.clone();
        Box::pin(async move {
            if let Err(e) = advancer.advance_all(&filter).await {
                warn!(error = %e, "Invoice advance failed");
            }
        })
    })
}
