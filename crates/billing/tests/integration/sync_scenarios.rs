//! End-to-end subscription sync scenarios against the in-memory stores
//!
//! Each test builds a subscription view, syncs it through the public
//! `Synchronizer`/`Reconciler` API and inspects the persisted lines.

use std::collections::BTreeMap;
use std::sync::Arc;

use linesync_billing::subscription::{DynamicPrice, FlatPrice, PriceTier, TieredPrice, TieredPriceMode, UnitPrice};
use linesync_billing::{
    BillingError, Cadence, Line, LinePricing, LineStatus, MemoryBillingStore, MemorySubscriptionSource,
    PaymentTerm, Price, RateCard, Reconciler, Subscription, SubscriptionItem, SubscriptionPhase,
    SubscriptionView, Synchronizer,
};
use linesync_shared::{Clock, CustomerId, FixedClock, ItemId, LineId, Namespace, Period, PhaseId, SubscriptionId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

// ============================================================================
// Test Utilities
// ============================================================================

struct Env {
    store: MemoryBillingStore,
    clock: Arc<FixedClock>,
    sync: Synchronizer,
    namespace: Namespace,
    customer_id: CustomerId,
}

async fn env(now: OffsetDateTime) -> Env {
    let store = MemoryBillingStore::new();
    let clock = Arc::new(FixedClock::new(now));
    let namespace = Namespace::new("acme").unwrap();
    let customer_id = CustomerId::new();
    store.add_profile(&namespace, customer_id).await;

    Env {
        sync: Synchronizer::new(Arc::new(store.clone()), clock.clone()),
        store,
        clock,
        namespace,
        customer_id,
    }
}

fn item(key: &str, from: OffsetDateTime, price: Option<Price>, cadence: Option<Cadence>) -> SubscriptionItem {
    SubscriptionItem {
        id: ItemId::new(),
        key: key.to_string(),
        active_from: from,
        active_to: None,
        rate_card: RateCard {
            name: format!("{key} fee"),
            description: None,
            price,
            billing_cadence: cadence,
            feature_key: Some("api_calls".to_string()),
            tax_config: None,
        },
    }
}

fn flat(amount: Decimal, payment_term: PaymentTerm) -> Option<Price> {
    Some(Price::Flat(FlatPrice { amount, payment_term }))
}

fn phase(key: &str, from: OffsetDateTime, items: Vec<SubscriptionItem>) -> SubscriptionPhase {
    let mut items_by_key: BTreeMap<String, Vec<SubscriptionItem>> = BTreeMap::new();
    for item in items {
        items_by_key.entry(item.key.clone()).or_default().push(item);
    }
    SubscriptionPhase {
        id: PhaseId::new(),
        key: key.to_string(),
        name: key.to_string(),
        active_from: from,
        items_by_key,
    }
}

fn view(env: &Env, phases: Vec<SubscriptionPhase>) -> SubscriptionView {
    let active_from = phases
        .iter()
        .map(|p| p.active_from)
        .min()
        .unwrap_or(datetime!(2024-01-01 00:00 UTC));

    SubscriptionView {
        subscription: Subscription {
            id: SubscriptionId::new(),
            namespace: env.namespace.clone(),
            customer_id: env.customer_id,
            name: "Scenario".to_string(),
            currency: "USD".to_string(),
            active_from,
            active_to: None,
        },
        phases,
    }
}

/// Daily in-arrears flat fee of 5 starting 2024-01-01
fn daily_in_arrears(env: &Env) -> SubscriptionView {
    let start = datetime!(2024-01-01 00:00 UTC);
    view(
        env,
        vec![phase(
            "default",
            start,
            vec![item("base", start, flat(dec!(5), PaymentTerm::InArrears), Some(Cadence::days(1)))],
        )],
    )
}

fn live(lines: Vec<Line>) -> Vec<Line> {
    lines.into_iter().filter(|l| !l.is_deleted()).collect()
}

fn per_unit_amount(line: &Line) -> Decimal {
    match &line.pricing {
        LinePricing::FlatFee(fee) => fee.per_unit_amount,
        LinePricing::UsageBased(_) => panic!("expected a flat fee line"),
    }
}

/// Mark `parent` as progressively billed, split at `cuts`
async fn split(env: &Env, parent: &Line, cuts: &[OffsetDateTime]) -> Vec<LineId> {
    let mut parent = parent.clone();
    parent.status = LineStatus::Split;
    env.store.put_line(parent.clone()).await;

    let mut bounds = vec![parent.period.start];
    bounds.extend_from_slice(cuts);
    bounds.push(parent.period.end);

    let mut ids = Vec::new();
    for pair in bounds.windows(2) {
        let period = Period::new(pair[0], pair[1]);
        let child = Line {
            id: LineId::new(),
            status: LineStatus::Valid,
            period,
            invoice_at: period.end,
            child_unique_reference_id: None,
            parent_line_id: Some(parent.id),
            ..parent.clone()
        };
        ids.push(child.id);
        env.store.put_line(child).await;
    }
    ids
}

// ============================================================================
// Flat fees
// ============================================================================

#[tokio::test]
async fn test_daily_in_arrears_then_cancel() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(result.created, 5);

    let lines = env.store.subscription_lines(id).await;
    assert_eq!(lines.len(), 5);
    for (i, line) in lines.iter().enumerate() {
        let start = datetime!(2024-01-01 00:00 UTC) + Duration::days(i as i64);
        assert_eq!(line.period, Period::new(start, start + Duration::days(1)));
        assert_eq!(line.invoice_at, line.period.end);
        assert_eq!(per_unit_amount(line), dec!(5));
        assert_eq!(
            line.child_unique_reference_id.as_deref(),
            Some(format!("{id}/default/base/v[0]/period[{i}]").as_str())
        );
    }

    // Cancelled half way through the first day
    sub.subscription.active_to = Some(datetime!(2024-01-01 12:00 UTC));
    env.clock.advance(Duration::minutes(1));
    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(result.deleted, 4);

    let remaining = live(env.store.subscription_lines(id).await);
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].period,
        Period::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-01 12:00 UTC))
    );
    assert_eq!(remaining[0].invoice_at, datetime!(2024-01-01 12:00 UTC));
    assert_eq!(per_unit_amount(&remaining[0]), dec!(2.5));
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let before = env.store.subscription_lines(id).await;

    env.clock.advance(Duration::minutes(10));
    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    assert!(result.is_noop());
    assert_eq!(env.store.subscription_lines(id).await, before);
}

#[tokio::test]
async fn test_uncancel_restores_deleted_lines() {
    let env = env(datetime!(2024-01-03 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(env.store.subscription_lines(id).await.len(), 3);

    sub.subscription.active_to = Some(datetime!(2024-01-02 00:00 UTC));
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(live(env.store.subscription_lines(id).await).len(), 1);

    sub.subscription.active_to = None;
    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(result.created, 0);

    let lines = env.store.subscription_lines(id).await;
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| !l.is_deleted()));
}

#[tokio::test]
async fn test_manual_edits_survive_merge() {
    let env = env(datetime!(2024-01-02 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let mut first = env.store.subscription_lines(id).await.remove(0);
    first.name = "Renamed by support".to_string();
    first.description = Some("manual note".to_string());
    env.store.put_line(first.clone()).await;

    sub.subscription.active_to = Some(datetime!(2024-01-01 06:00 UTC));
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let merged = env.store.line(first.id).await.unwrap();
    assert_eq!(merged.name, "Renamed by support");
    assert_eq!(merged.description.as_deref(), Some("manual note"));
    assert_eq!(merged.period.end, datetime!(2024-01-01 06:00 UTC));
    assert_eq!(per_unit_amount(&merged), dec!(1.25));
}

#[tokio::test]
async fn test_manual_lines_are_left_alone() {
    let env = env(datetime!(2024-01-02 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let mut manual = env.store.subscription_lines(id).await.remove(0);
    manual.id = LineId::new();
    manual.name = "One-off credit".to_string();
    manual.child_unique_reference_id = None;
    env.store.put_line(manual.clone()).await;

    sub.subscription.active_to = Some(datetime!(2024-01-01 00:30 UTC));
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    assert_eq!(env.store.line(manual.id).await.unwrap(), manual);
}

#[tokio::test]
async fn test_clipped_in_advance_fee_keeps_full_amount() {
    let env = env(datetime!(2024-01-02 00:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let mut sub = view(
        &env,
        vec![phase(
            "default",
            start,
            vec![item("base", start, flat(dec!(5), PaymentTerm::InAdvance), Some(Cadence::days(1)))],
        )],
    );
    sub.subscription.active_to = Some(datetime!(2024-01-01 12:00 UTC));

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let lines = env.store.subscription_lines(sub.subscription.id).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].period, Period::new(start, datetime!(2024-01-01 12:00 UTC)));
    assert_eq!(lines[0].invoice_at, start);
    assert_eq!(per_unit_amount(&lines[0]), dec!(5));
}

#[tokio::test]
async fn test_cancel_in_first_phase_stops_later_phases() {
    let env = env(datetime!(2024-01-20 12:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let paid_start = datetime!(2024-02-01 00:00 UTC);
    let cancel_at = datetime!(2024-01-10 00:00 UTC);
    let mut sub = view(
        &env,
        vec![
            phase(
                "default",
                start,
                vec![item("base", start, flat(dec!(5), PaymentTerm::InArrears), Some(Cadence::days(1)))],
            ),
            phase(
                "paid",
                paid_start,
                vec![item("setup", paid_start, flat(dec!(100), PaymentTerm::InAdvance), None)],
            ),
        ],
    );
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(live(env.store.subscription_lines(id).await).len(), 20);

    sub.subscription.active_to = Some(cancel_at);
    env.clock.set(datetime!(2024-02-05 00:00 UTC));
    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(result.created, 0);
    assert_eq!(result.deleted, 11);

    let remaining = live(env.store.subscription_lines(id).await);
    assert_eq!(remaining.len(), 9);
    for line in &remaining {
        assert!(line.period.start < line.period.end);
        assert!(line.period.end <= cancel_at);
        assert!(line
            .child_unique_reference_id
            .as_deref()
            .is_some_and(|r| r.contains("/default/base/")));
    }
}

#[tokio::test]
async fn test_future_phase_gets_first_line() {
    let env = env(datetime!(2024-01-05 00:00 UTC)).await;
    let trial_start = datetime!(2024-01-01 00:00 UTC);
    let paid_start = datetime!(2024-02-01 00:00 UTC);
    let sub = view(
        &env,
        vec![
            phase("trial", trial_start, vec![item("base", trial_start, None, Some(Cadence::months(1)))]),
            phase(
                "paid",
                paid_start,
                vec![item(
                    "base",
                    paid_start,
                    flat(dec!(49), PaymentTerm::InAdvance),
                    Some(Cadence::months(1)),
                )],
            ),
        ],
    );

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let lines = env.store.subscription_lines(sub.subscription.id).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].period, Period::new(paid_start, datetime!(2024-03-01 00:00 UTC)));
    assert_eq!(lines[0].invoice_at, paid_start);
    assert_eq!(per_unit_amount(&lines[0]), dec!(49));
}

// ============================================================================
// Usage based
// ============================================================================

#[tokio::test]
async fn test_phase_inserted_mid_period_stays_contiguous() {
    let env = env(datetime!(2024-01-03 00:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let unit = || {
        Some(Price::Unit(UnitPrice {
            amount: dec!(10),
            minimum_amount: None,
            maximum_amount: None,
        }))
    };

    let mut sub = view(
        &env,
        vec![phase("default", start, vec![item("api", start, unit(), Some(Cadence::days(1)))])],
    );
    let id = sub.subscription.id;
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(env.store.subscription_lines(id).await.len(), 2);

    let upgrade_at = datetime!(2024-01-02 12:00 UTC);
    sub.phases
        .push(phase("upgrade", upgrade_at, vec![item("api", upgrade_at, unit(), Some(Cadence::days(1)))]));
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let lines = live(env.store.subscription_lines(id).await);
    let periods: Vec<Period> = lines.iter().map(|l| l.period).collect();
    assert_eq!(
        periods,
        vec![
            Period::new(start, datetime!(2024-01-02 00:00 UTC)),
            Period::new(datetime!(2024-01-02 00:00 UTC), upgrade_at),
            Period::new(upgrade_at, datetime!(2024-01-03 12:00 UTC)),
        ]
    );
    for line in &lines {
        assert_eq!(line.invoice_at, line.period.end);
        assert!(matches!(line.pricing, LinePricing::UsageBased(ref u) if u.feature_key == "api_calls"));
    }
}

#[tokio::test]
async fn test_tiered_price_produces_usage_line() {
    let env = env(datetime!(2024-01-01 10:15:30 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let tiered = Price::Tiered(TieredPrice {
        mode: TieredPriceMode::Graduated,
        tiers: vec![
            PriceTier {
                up_to_amount: Some(dec!(1000)),
                flat_price: None,
                unit_price: Some(dec!(0.01)),
            },
            PriceTier {
                up_to_amount: None,
                flat_price: None,
                unit_price: Some(dec!(0.005)),
            },
        ],
    });
    let mut sub = view(
        &env,
        vec![phase("default", start, vec![item("api", start, Some(tiered.clone()), Some(Cadence::days(1)))])],
    );
    sub.subscription.active_to = Some(env.clock.now());

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let lines = env.store.subscription_lines(sub.subscription.id).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].period, Period::new(start, datetime!(2024-01-01 10:15 UTC)));
    assert_eq!(lines[0].invoice_at, lines[0].period.end);
    match &lines[0].pricing {
        LinePricing::UsageBased(usage) => {
            assert_eq!(usage.price, tiered);
            assert_eq!(usage.feature_key, "api_calls");
        }
        LinePricing::FlatFee(_) => panic!("expected a usage based line"),
    }
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_duplicate_unique_id_rolls_back() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let later = datetime!(2024-01-03 00:00 UTC);
    let base = |from| vec![item("base", from, flat(dec!(5), PaymentTerm::InArrears), Some(Cadence::days(1)))];
    // Both phases resolve to the same key, so their periods collide
    let sub = view(&env, vec![phase("default", start, base(start)), phase("default", later, base(later))]);

    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::DuplicateUniqueId(_)));
    assert!(err.is_invariant_violation());

    assert!(env.store.subscription_lines(sub.subscription.id).await.is_empty());
    assert!(env.store.invoices().await.is_empty());
}

#[tokio::test]
async fn test_usage_item_without_feature_key_fails() {
    let env = env(datetime!(2024-01-02 12:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let mut api = item(
        "api",
        start,
        Some(Price::Unit(UnitPrice {
            amount: dec!(10),
            minimum_amount: None,
            maximum_amount: None,
        })),
        Some(Cadence::days(1)),
    );
    api.rate_card.feature_key = None;
    let sub = view(&env, vec![phase("default", start, vec![api])]);

    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::MissingFeatureKey { ref item_key } if item_key == "api"));
    assert!(env.store.subscription_lines(sub.subscription.id).await.is_empty());
}

#[tokio::test]
async fn test_dynamic_price_rolls_back_everything() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let start = datetime!(2024-01-01 00:00 UTC);
    let sub = view(
        &env,
        vec![phase(
            "default",
            start,
            vec![
                item("base", start, flat(dec!(5), PaymentTerm::InArrears), Some(Cadence::days(1))),
                item(
                    "compute",
                    start,
                    Some(Price::Dynamic(DynamicPrice { multiplier: dec!(1.2) })),
                    Some(Cadence::days(1)),
                ),
            ],
        )],
    );

    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnsupportedPrice { ref price_type, .. } if price_type == "dynamic"));

    assert!(env.store.subscription_lines(sub.subscription.id).await.is_empty());
    assert!(env.store.invoices().await.is_empty());
}

#[tokio::test]
async fn test_missing_billing_profile() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    sub.subscription.customer_id = CustomerId::new();

    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BillingProfileNotFound { .. }));
    assert!(env.store.subscription_lines(sub.subscription.id).await.is_empty());
}

#[tokio::test]
async fn test_duplicate_persisted_reference_aborts() {
    let env = env(datetime!(2024-01-02 12:00 UTC)).await;
    let sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let mut copy = env.store.subscription_lines(id).await.remove(0);
    copy.id = LineId::new();
    env.store.put_line(copy).await;
    let before = env.store.subscription_lines(id).await;

    env.clock.advance(Duration::days(1));
    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::DuplicateChildReference(_)));
    assert!(err.is_invariant_violation());
    assert_eq!(env.store.subscription_lines(id).await, before);
}

#[tokio::test]
async fn test_detailed_line_in_diff_aborts() {
    let env = env(datetime!(2024-01-02 12:00 UTC)).await;
    let sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let mut detailed = env.store.subscription_lines(id).await.remove(0);
    detailed.status = LineStatus::Detailed;
    env.store.put_line(detailed).await;

    let err = env
        .sync
        .synchronize_subscription(&sub, env.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UnexpectedLineStatus { .. }));
    assert!(err.is_invariant_violation());
}

// ============================================================================
// Progressive billing
// ============================================================================

#[tokio::test]
async fn test_split_line_children_follow_period_end() {
    let env = env(datetime!(2024-01-01 12:00 UTC)).await;
    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;

    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    let parent = env.store.subscription_lines(id).await.remove(0);
    let children = split(
        &env,
        &parent,
        &[datetime!(2024-01-01 06:00 UTC), datetime!(2024-01-01 18:00 UTC)],
    )
    .await;

    // Shrink to 10:00: last child dropped, middle child clipped
    sub.subscription.active_to = Some(datetime!(2024-01-01 10:00 UTC));
    let result = env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();
    assert_eq!(result.deleted, 1);
    assert_eq!(result.updated, 2);

    let parent_now = env.store.line(parent.id).await.unwrap();
    assert_eq!(parent_now.period.end, datetime!(2024-01-01 10:00 UTC));
    assert_eq!(parent_now.invoice_at, datetime!(2024-01-01 10:00 UTC));

    let first = env.store.line(children[0]).await.unwrap();
    let middle = env.store.line(children[1]).await.unwrap();
    let last = env.store.line(children[2]).await.unwrap();
    assert_eq!(first.period.end, datetime!(2024-01-01 06:00 UTC));
    assert_eq!(middle.period.end, datetime!(2024-01-01 10:00 UTC));
    assert_eq!(middle.invoice_at, datetime!(2024-01-01 10:00 UTC));
    assert!(last.is_deleted());
    assert_eq!(first.period.start, parent_now.period.start);
    assert_eq!(first.period.end, middle.period.start);

    // Extend again: the temporally last live child takes the new end
    sub.subscription.active_to = None;
    env.sync.synchronize_subscription(&sub, env.clock.now()).await.unwrap();

    let parent_now = env.store.line(parent.id).await.unwrap();
    let middle = env.store.line(children[1]).await.unwrap();
    assert_eq!(parent_now.period.end, datetime!(2024-01-02 00:00 UTC));
    assert_eq!(middle.period.end, datetime!(2024-01-02 00:00 UTC));
    assert_eq!(middle.invoice_at, datetime!(2024-01-02 00:00 UTC));
    assert!(env.store.line(children[2]).await.unwrap().is_deleted());
}

// ============================================================================
// Reconciler
// ============================================================================

#[tokio::test]
async fn test_reconciler_converges_after_missed_cancel_event() {
    let env = env(datetime!(2024-01-05 12:00 UTC)).await;
    let source = MemorySubscriptionSource::new();
    let reconciler = Reconciler::new(Arc::new(source.clone()), env.sync.clone());

    let mut sub = daily_in_arrears(&env);
    let id = sub.subscription.id;
    source.upsert(sub.clone()).await;

    let input = linesync_billing::ReconcileInput {
        lookback: Duration::days(30),
        namespaces: vec![env.namespace.clone()],
        customers: vec![],
    };
    reconciler.all(&input).await.unwrap();
    assert_eq!(live(env.store.subscription_lines(id).await).len(), 5);

    // The cancel event never arrived; the periodic run picks it up
    sub.subscription.active_to = Some(datetime!(2024-01-03 00:00 UTC));
    source.upsert(sub).await;
    env.clock.advance(Duration::hours(1));
    reconciler.all(&input).await.unwrap();

    let remaining = live(env.store.subscription_lines(id).await);
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|l| l.period.end <= datetime!(2024-01-03 00:00 UTC)));
    assert!(remaining
        .iter()
        .all(|l| l.subscription.is_some_and(|r| r.subscription_id == id)));
}
