// Strategy decision rules for the DCA cycle.
//
// Everything here is pure: given the asset config, the current cycle
// snapshot, and a market snapshot, each entry point returns an intent or
// None. The runtime applies intents; nothing in this module touches the
// broker or the store.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::state::{Asset, Cycle, CycleStatus};

/// Top-of-book snapshot handed to the decider per quote event.
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_trade_price: Option<Decimal>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyKind {
    Base,
    Safety,
}

impl BuyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuyKind::Base => "base",
            BuyKind::Safety => "safety",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellKind {
    TakeProfit,
    TrailingTakeProfit,
}

impl SellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellKind::TakeProfit => "take_profit",
            SellKind::TrailingTakeProfit => "trailing_take_profit",
        }
    }
}

/// What the decider wants done. At most one intent fires per quote. The
/// runtime mints the client order id at placement time so these stay
/// value types.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionIntent {
    PlaceBuy { kind: BuyKind, symbol: String, limit_price: Decimal, quote_amount: Decimal },
    PlaceSell { kind: SellKind, symbol: String, quantity: Decimal },
    EnterTrailing { new_peak: Decimal },
    UpdateTrailingPeak { new_peak: Decimal },
}

fn pct(p: Decimal) -> Decimal {
    p / Decimal::ONE_HUNDRED
}

/// Base buy: only for a flat, watching cycle on an enabled asset, and
/// only once the cooldown gate passes. A deep-enough discount to the
/// prior cycle's sell price preempts the cooldown.
pub fn decide_base_order_action(
    asset: &Asset,
    cycle: &Cycle,
    prior_terminal: Option<&Cycle>,
    market: &MarketSnapshot,
) -> Option<ActionIntent> {
    if !asset.enabled || cycle.status != CycleStatus::Watching || !cycle.is_flat() {
        return None;
    }
    if !cooldown_gate_passes(asset, prior_terminal, market) {
        return None;
    }
    Some(ActionIntent::PlaceBuy {
        kind: BuyKind::Base,
        symbol: asset.symbol.clone(),
        limit_price: market.ask,
        quote_amount: asset.base_order_amount,
    })
}

fn cooldown_gate_passes(
    asset: &Asset,
    prior_terminal: Option<&Cycle>,
    market: &MarketSnapshot,
) -> bool {
    let Some(prior) = prior_terminal else {
        return true;
    };
    let Some(completed_at) = prior.completed_at else {
        // Terminal cycles always carry completed_at; a missing one means
        // the row predates this engine, so only the time gate can pass.
        return false;
    };
    if market.now >= completed_at + Duration::seconds(asset.cooldown_period_seconds) {
        return true;
    }
    // Early restart: the market fell hard below the last exit.
    match prior.sell_price {
        Some(sell_price) => {
            market.ask < sell_price * (Decimal::ONE - pct(asset.buy_order_price_deviation_percent))
        }
        None => false,
    }
}

/// Safety buy: price dropped `safety_order_deviation_percent` below the
/// last buy fill and the safety budget is not exhausted.
pub fn decide_safety_order_action(
    asset: &Asset,
    cycle: &Cycle,
    market: &MarketSnapshot,
) -> Option<ActionIntent> {
    if cycle.status != CycleStatus::Watching || cycle.is_flat() {
        return None;
    }
    if cycle.safety_orders >= asset.max_safety_orders {
        return None;
    }
    let last_fill = cycle.last_order_fill_price?;
    let trigger = last_fill * (Decimal::ONE - pct(asset.safety_order_deviation_percent));
    if market.ask > trigger {
        return None;
    }
    Some(ActionIntent::PlaceBuy {
        kind: BuyKind::Safety,
        symbol: asset.symbol.clone(),
        limit_price: market.ask,
        quote_amount: asset.safety_order_amount,
    })
}

/// Take-profit: sell the whole position once the bid clears the weighted
/// average cost by `take_profit_percent`. With trailing enabled the first
/// crossing arms the trail, rising bids ratchet the peak, and a
/// retracement of `ttp_deviation_percent` from the peak fires the sell.
pub fn decide_take_profit_action(
    asset: &Asset,
    cycle: &Cycle,
    market: &MarketSnapshot,
) -> Option<ActionIntent> {
    if !matches!(cycle.status, CycleStatus::Watching | CycleStatus::Trailing) || cycle.is_flat() {
        return None;
    }
    let tp_trigger =
        cycle.average_purchase_price * (Decimal::ONE + pct(asset.take_profit_percent));

    if !asset.ttp_enabled {
        if market.bid >= tp_trigger {
            return Some(ActionIntent::PlaceSell {
                kind: SellKind::TakeProfit,
                symbol: asset.symbol.clone(),
                quantity: cycle.quantity,
            });
        }
        return None;
    }

    match cycle.status {
        CycleStatus::Watching => {
            if market.bid >= tp_trigger {
                return Some(ActionIntent::EnterTrailing { new_peak: market.bid });
            }
            None
        }
        CycleStatus::Trailing => {
            let peak = cycle.highest_trailing_price?;
            if market.bid > peak {
                return Some(ActionIntent::UpdateTrailingPeak { new_peak: market.bid });
            }
            let floor = peak * (Decimal::ONE - pct(asset.ttp_deviation_percent));
            if market.bid <= floor {
                return Some(ActionIntent::PlaceSell {
                    kind: SellKind::TrailingTakeProfit,
                    symbol: asset.symbol.clone(),
                    quantity: cycle.quantity,
                });
            }
            None
        }
        _ => None,
    }
}

/// Fixed evaluation order for one quote: a flat cycle is only eligible
/// for a base buy; a holding cycle checks safety first, then take-profit.
/// Never more than one intent per quote.
pub fn decide(
    asset: &Asset,
    cycle: &Cycle,
    prior_terminal: Option<&Cycle>,
    market: &MarketSnapshot,
) -> Option<ActionIntent> {
    if cycle.is_flat() {
        return decide_base_order_action(asset, cycle, prior_terminal, market);
    }
    if let Some(intent) = decide_safety_order_action(asset, cycle, market) {
        return Some(intent);
    }
    decide_take_profit_action(asset, cycle, market)
}

/// Weighted-average cost after a buy fill lands on a cycle holding
/// `quantity` at `average`. Pure so the fill handler and its tests share
/// one definition.
pub fn weighted_average(
    quantity: Decimal,
    average: Decimal,
    fill_qty: Decimal,
    fill_price: Decimal,
) -> (Decimal, Decimal) {
    let new_qty = quantity + fill_qty;
    if new_qty.is_zero() {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let new_avg = (quantity * average + fill_qty * fill_price) / new_qty;
    (new_qty, new_avg)
}
