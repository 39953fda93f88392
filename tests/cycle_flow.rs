//! End-to-end cycle flow through the live runtime: quotes in, orders
//! out, trade updates back, cycle state persisted.
//!
//! Covered here:
//!   1. Base buy happy path        -- flat cycle buys at the ask
//!   2. Safety buy + weighted avg  -- deviation trigger and averaging
//!   3. Take-profit and rollover   -- sell, complete, fresh cycle
//!   4. Trailing take-profit       -- arm, ratchet, retrace, sell
//!   5. Cooldown gating            -- blocked, then preempted by a drop
//!   6. Orphan and duplicate trade updates are harmless

mod common;

use common::*;
use rust_decimal_macros::dec;

use dcafx::adapter::types::{Side, TradeEventKind};
use dcafx::state::CycleStatus;

// ===========================================================================
// 1. Base buy happy path
// ===========================================================================

#[tokio::test]
async fn base_buy_places_order_and_fill_lands() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;

    let placed = broker.last_placed().expect("buy order placed");
    assert_eq!(placed.side, Side::Buy);
    assert_eq!(placed.limit_price, Some(dec!(50000)));

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Buying);
    assert_eq!(cycle.latest_order_id.as_deref(), Some(placed.id.as_str()));
    assert!(cycle.latest_order_created_at.is_some());

    rt.handle_trade_update(fill_event(&placed.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000)))
        .await;

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert_eq!(cycle.quantity, dec!(0.0004));
    assert_eq!(cycle.average_purchase_price, dec!(50000));
    assert_eq!(cycle.last_order_fill_price, Some(dec!(50000)));
    assert_eq!(cycle.safety_orders, 0);
    assert!(cycle.latest_order_id.is_none());
}

#[tokio::test]
async fn quotes_for_unknown_or_disabled_assets_do_nothing() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let mut disabled = btc_asset();
    disabled.enabled = false;
    store.insert_asset(&disabled).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    rt.handle_quote(quote("ETH/USD", dec!(2999), dec!(3000))).await;

    assert_eq!(broker.placed_count(), 0);
}

// ===========================================================================
// 2. Safety buy and weighted average
// ===========================================================================

#[tokio::test]
async fn safety_buy_triggers_at_deviation_and_averages_down() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    // base buy and fill at 50000
    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000)))
        .await;

    // 0.9% down: no trigger
    rt.handle_quote(quote("BTC/USD", dec!(49549), dec!(49550))).await;
    assert_eq!(broker.placed_count(), 1);

    // exactly 1% down: trigger (ties fire)
    rt.handle_quote(quote("BTC/USD", dec!(49499), dec!(49500))).await;
    assert_eq!(broker.placed_count(), 2);
    let safety = broker.last_placed().unwrap();
    assert_eq!(safety.limit_price, Some(dec!(49500)));

    rt.handle_trade_update(fill_event(&safety.id, "BTC/USD", Side::Buy, dec!(0.000808), dec!(49500)))
        .await;

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert_eq!(cycle.quantity, dec!(0.001208));
    assert_eq!(cycle.safety_orders, 1);
    assert_eq!(cycle.last_order_fill_price, Some(dec!(49500)));
    // (0.0004*50000 + 0.000808*49500) / 0.001208, at storage precision
    let expected = ((dec!(0.0004) * dec!(50000) + dec!(0.000808) * dec!(49500)) / dec!(0.001208))
        .round_dp(10)
        .normalize();
    assert_eq!(cycle.average_purchase_price, expected);
}

#[tokio::test]
async fn safety_budget_is_exhaustible() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let mut params = btc_asset();
    params.max_safety_orders = 1;
    let asset = store.insert_asset(&params).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000)))
        .await;

    rt.handle_quote(quote("BTC/USD", dec!(49499), dec!(49500))).await;
    let safety = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&safety.id, "BTC/USD", Side::Buy, dec!(0.0008), dec!(49500)))
        .await;

    // far below the next deviation, but the budget is spent
    rt.handle_quote(quote("BTC/USD", dec!(48000), dec!(48001))).await;
    assert_eq!(broker.placed_count(), 2);
    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.safety_orders, 1);
}

// ===========================================================================
// 3. Take-profit and rollover
// ===========================================================================

#[tokio::test]
async fn take_profit_sells_and_rolls_over() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    let first_cycle = store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000)))
        .await;

    // 1.5% take-profit on avg 50000 -> trigger 50750
    rt.handle_quote(quote("BTC/USD", dec!(50749), dec!(50750))).await;
    assert_eq!(broker.placed_count(), 1, "below trigger must not sell");

    rt.handle_quote(quote("BTC/USD", dec!(50750), dec!(50751))).await;
    let sell = broker.last_placed().unwrap();
    assert_eq!(sell.side, Side::Sell);
    assert_eq!(sell.qty, Some(dec!(0.0004)));

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Selling);

    rt.handle_trade_update(fill_event(&sell.id, "BTC/USD", Side::Sell, dec!(0.0004), dec!(50800)))
        .await;

    let closed = store.get_latest_terminal_cycle(asset.id).unwrap().unwrap();
    assert_eq!(closed.id, first_cycle.id);
    assert_eq!(closed.status, CycleStatus::Complete);
    assert_eq!(closed.sell_price, Some(dec!(50800)));
    assert!(closed.completed_at.is_some());

    let fresh = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_ne!(fresh.id, closed.id);
    assert_eq!(fresh.status, CycleStatus::Watching);
    assert!(fresh.is_flat());

    let asset = store.get_asset("BTC/USD").unwrap().unwrap();
    assert_eq!(asset.last_sell_price, Some(dec!(50800)));
}

// ===========================================================================
// 4. Trailing take-profit
// ===========================================================================

#[tokio::test]
async fn trailing_take_profit_arms_ratchets_and_sells_on_retrace() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let mut params = btc_asset();
    params.ttp_enabled = true;
    params.ttp_deviation_percent = dec!(0.5);
    params.take_profit_percent = dec!(1.0);
    let asset = store.insert_asset(&params).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.001), dec!(50000)))
        .await;

    // trigger at 50500: arms the trail, no sell yet
    rt.handle_quote(quote("BTC/USD", dec!(50500), dec!(50501))).await;
    assert_eq!(broker.placed_count(), 1);
    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Trailing);
    assert_eq!(cycle.highest_trailing_price, Some(dec!(50500)));

    // rising bid ratchets the peak
    rt.handle_quote(quote("BTC/USD", dec!(50800), dec!(50801))).await;
    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.highest_trailing_price, Some(dec!(50800)));

    // inside the band: nothing
    rt.handle_quote(quote("BTC/USD", dec!(50547), dec!(50548))).await;
    assert_eq!(broker.placed_count(), 1);

    // retrace through the floor (50800 * 0.995 = 50546): sell
    rt.handle_quote(quote("BTC/USD", dec!(50540), dec!(50541))).await;
    let sell = broker.last_placed().unwrap();
    assert_eq!(sell.side, Side::Sell);
    assert_eq!(sell.qty, Some(dec!(0.001)));
    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Selling);
}

// ===========================================================================
// 5. Cooldown gating
// ===========================================================================

#[tokio::test]
async fn cooldown_blocks_restart_until_deep_discount() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    // run one full cycle to get a terminal sell at 50000
    rt.handle_quote(quote("BTC/USD", dec!(48999), dec!(49000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(49000)))
        .await;
    rt.handle_quote(quote("BTC/USD", dec!(49800), dec!(49801))).await;
    let sell = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&sell.id, "BTC/USD", Side::Sell, dec!(0.0004), dec!(50000)))
        .await;
    assert_eq!(broker.placed_count(), 2);

    // cooldown is 600s: a normal quote does not restart
    rt.handle_quote(quote("BTC/USD", dec!(49499), dec!(49500))).await;
    assert_eq!(broker.placed_count(), 2);

    // a >2% drop below the 50000 exit does: 48999 < 49000
    rt.handle_quote(quote("BTC/USD", dec!(48998), dec!(48999))).await;
    assert_eq!(broker.placed_count(), 3);
    let restart = broker.last_placed().unwrap();
    assert_eq!(restart.side, Side::Buy);
    assert_eq!(restart.limit_price, Some(dec!(48999)));
}

// ===========================================================================
// 6. Orphans and duplicates
// ===========================================================================

#[tokio::test]
async fn orphan_trade_updates_mutate_nothing() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    let cycle = store.create_initial_cycle(asset.id).unwrap();

    rt.handle_trade_update(fill_event("never-seen", "BTC/USD", Side::Buy, dec!(1), dec!(50000)))
        .await;

    let after = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(after.id, cycle.id);
    assert!(after.is_flat());
    assert_eq!(after.status, CycleStatus::Watching);
}

#[tokio::test]
async fn duplicate_sell_fill_rolls_over_once() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    rt.handle_trade_update(fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000)))
        .await;
    rt.handle_quote(quote("BTC/USD", dec!(50750), dec!(50751))).await;
    let sell = broker.last_placed().unwrap();

    let fill = fill_event(&sell.id, "BTC/USD", Side::Sell, dec!(0.0004), dec!(50800));
    rt.handle_trade_update(fill.clone()).await;
    rt.handle_trade_update(fill).await;

    // one terminal, one active
    let terminal = store.get_latest_terminal_cycle(asset.id).unwrap().unwrap();
    assert_eq!(terminal.sell_price, Some(dec!(50800)));
    assert_eq!(store.list_active_cycles().unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_buy_fill_does_not_double_count() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();
    let fill = fill_event(&base.id, "BTC/USD", Side::Buy, dec!(0.0004), dec!(50000));
    rt.handle_trade_update(fill.clone()).await;
    rt.handle_trade_update(fill).await;

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.quantity, dec!(0.0004));
    assert_eq!(cycle.safety_orders, 0);
}

// ===========================================================================
// Buy cancel recovery
// ===========================================================================

#[tokio::test]
async fn canceled_buy_returns_cycle_to_watching() {
    let broker = MockBroker::new();
    let (rt, store) = test_runtime(broker.clone());
    let asset = store.insert_asset(&btc_asset()).unwrap();
    store.create_initial_cycle(asset.id).unwrap();

    rt.handle_quote(quote("BTC/USD", dec!(49999), dec!(50000))).await;
    let base = broker.last_placed().unwrap();

    rt.handle_trade_update(terminal_event(
        TradeEventKind::Canceled,
        &base.id,
        "BTC/USD",
        Side::Buy,
        None,
    ))
    .await;

    let cycle = store.get_active_cycle(asset.id).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Watching);
    assert!(cycle.latest_order_id.is_none());
    assert!(cycle.is_flat());
}
