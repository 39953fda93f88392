//! Live runtime: dispatches quote and trade-update events to the
//! strategy decider and applies the resulting intents against the broker
//! and the cycle store.
//!
//! All per-asset work happens under the asset's lock. Quotes coalesce
//! (newest wins, extras dropped); trade updates queue behind the lock
//! and are never dropped. Every order submission carries a fresh client
//! order id, and a per-asset cooldown suppresses duplicate submissions
//! from quote bursts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Duration;
use uuid::Uuid;

use crate::adapter::types::{Quote, Side, TradeEvent, TradeEventKind};
use crate::adapter::Broker;
use crate::locks::LockTable;
use crate::logging::{json_log, log, obj, v_dec, v_int, v_str, Domain, Level};
use crate::state::{Asset, Config, Cycle, CycleStatus};
use crate::storage::{CyclePatch, CycleStore};
use crate::strategy::{self, ActionIntent, BuyKind, MarketSnapshot, SellKind};

/// Bounded memory of processed `(order_id, event)` pairs so duplicate
/// trade-update deliveries are no-ops.
struct SeenEvents {
    set: HashSet<(String, TradeEventKind)>,
    order: VecDeque<(String, TradeEventKind)>,
    cap: usize,
}

impl SeenEvents {
    fn new(cap: usize) -> Self {
        Self { set: HashSet::new(), order: VecDeque::new(), cap }
    }

    fn contains(&self, order_id: &str, kind: TradeEventKind) -> bool {
        self.set.contains(&(order_id.to_string(), kind))
    }

    fn insert(&mut self, order_id: String, kind: TradeEventKind) {
        let key = (order_id, kind);
        if self.set.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

/// Explicit dependency context threaded through every task; no globals.
pub struct Runtime {
    pub cfg: Config,
    pub store: Arc<CycleStore>,
    pub broker: Arc<dyn Broker>,
    pub locks: LockTable,
    pending_quotes: StdMutex<HashMap<i64, Quote>>,
    last_submission: StdMutex<HashMap<(i64, &'static str), Instant>>,
    seen_events: StdMutex<SeenEvents>,
}

impl Runtime {
    pub fn new(cfg: Config, store: Arc<CycleStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            cfg,
            store,
            broker,
            locks: LockTable::new(),
            pending_quotes: StdMutex::new(HashMap::new()),
            last_submission: StdMutex::new(HashMap::new()),
            seen_events: StdMutex::new(SeenEvents::new(4096)),
        }
    }

    fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.lock_wait_secs)
    }

    // ------------------------------------------------------------------
    // Dispatch loops
    // ------------------------------------------------------------------

    /// Pull quotes off the feed and fan out per asset, bounded by
    /// `permits` concurrent handlers. Returns when the channel closes.
    pub async fn run_quote_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Quote>,
        permits: usize,
    ) {
        let pool = Arc::new(Semaphore::new(permits.max(1)));
        while let Some(quote) = rx.recv().await {
            let Ok(permit) = pool.clone().acquire_owned().await else {
                return;
            };
            let rt = self.clone();
            tokio::spawn(async move {
                rt.handle_quote(quote).await;
                drop(permit);
            });
        }
    }

    /// Trade updates are processed in arrival order, one at a time.
    pub async fn run_trade_dispatcher(self: Arc<Self>, mut rx: mpsc::Receiver<TradeEvent>) {
        while let Some(ev) = rx.recv().await {
            self.handle_trade_update(ev).await;
        }
    }

    // ------------------------------------------------------------------
    // Quote path
    // ------------------------------------------------------------------

    pub async fn handle_quote(&self, quote: Quote) {
        if quote.bid_price <= Decimal::ZERO || quote.ask_price <= Decimal::ZERO {
            return;
        }
        let asset = match self.store.get_asset(&quote.symbol) {
            Ok(Some(asset)) if asset.enabled => asset,
            Ok(_) => return,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Market,
                    "asset_load_failed",
                    obj(&[("symbol", v_str(&quote.symbol)), ("error", v_str(&err.to_string()))]),
                );
                return;
            }
        };

        self.stash_quote(asset.id, quote);
        loop {
            // Skip on contention: the holder drains the pending slot.
            let Some(guard) = self.locks.try_acquire(asset.id) else {
                return;
            };
            while let Some(q) = self.take_pending(asset.id) {
                if let Err(err) = self.process_quote(&asset, &q).await {
                    log(
                        Level::Error,
                        Domain::Strategy,
                        "quote_processing_failed",
                        obj(&[
                            ("symbol", v_str(&asset.symbol)),
                            ("error", v_str(&format!("{:#}", err))),
                        ]),
                    );
                }
            }
            drop(guard);
            // A quote stashed between the drain and the release would
            // otherwise sit until the next event arrives.
            if !self.has_pending(asset.id) {
                return;
            }
        }
    }

    fn stash_quote(&self, asset_id: i64, quote: Quote) {
        let mut map = self.pending_quotes.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(asset_id, quote);
    }

    fn take_pending(&self, asset_id: i64) -> Option<Quote> {
        let mut map = self.pending_quotes.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&asset_id)
    }

    fn has_pending(&self, asset_id: i64) -> bool {
        let map = self.pending_quotes.lock().unwrap_or_else(|p| p.into_inner());
        map.contains_key(&asset_id)
    }

    async fn process_quote(&self, asset: &Asset, quote: &Quote) -> Result<()> {
        let Some(cycle) = self.store.get_active_cycle(asset.id)? else {
            return Ok(());
        };
        let market = MarketSnapshot {
            bid: quote.bid_price,
            ask: quote.ask_price,
            last_trade_price: None,
            now: Utc::now(),
        };
        let prior_terminal = if cycle.is_flat() {
            self.store.get_latest_terminal_cycle(asset.id)?
        } else {
            None
        };
        let Some(intent) = strategy::decide(asset, &cycle, prior_terminal.as_ref(), &market)
        else {
            return Ok(());
        };
        self.apply_intent(asset, &cycle, intent, &market).await
    }

    async fn apply_intent(
        &self,
        asset: &Asset,
        cycle: &Cycle,
        intent: ActionIntent,
        market: &MarketSnapshot,
    ) -> Result<()> {
        match intent {
            ActionIntent::PlaceBuy { kind, symbol, limit_price, quote_amount } => {
                self.place_buy(asset, cycle, kind, &symbol, limit_price, quote_amount).await
            }
            ActionIntent::PlaceSell { kind, symbol, quantity } => {
                self.place_sell(asset, cycle, kind, &symbol, quantity).await
            }
            ActionIntent::EnterTrailing { new_peak } => {
                self.store.update_cycle(
                    cycle.id,
                    &CyclePatch {
                        status: Some(CycleStatus::Trailing),
                        highest_trailing_price: Some(Some(new_peak)),
                        ..Default::default()
                    },
                )?;
                json_log(
                    Domain::Cycle,
                    "trailing_armed",
                    obj(&[
                        ("symbol", v_str(&asset.symbol)),
                        ("cycle_id", v_int(cycle.id)),
                        ("peak", v_dec(new_peak)),
                        ("bid", v_dec(market.bid)),
                    ]),
                );
                Ok(())
            }
            ActionIntent::UpdateTrailingPeak { new_peak } => {
                self.store.update_cycle(
                    cycle.id,
                    &CyclePatch {
                        highest_trailing_price: Some(Some(new_peak)),
                        ..Default::default()
                    },
                )?;
                log(
                    Level::Debug,
                    Domain::Cycle,
                    "trailing_peak_raised",
                    obj(&[
                        ("symbol", v_str(&asset.symbol)),
                        ("cycle_id", v_int(cycle.id)),
                        ("peak", v_dec(new_peak)),
                    ]),
                );
                Ok(())
            }
        }
    }

    async fn place_buy(
        &self,
        asset: &Asset,
        cycle: &Cycle,
        kind: BuyKind,
        symbol: &str,
        limit_price: Decimal,
        quote_amount: Decimal,
    ) -> Result<()> {
        if !self.submission_allowed(asset.id, kind.as_str()) {
            return Ok(());
        }
        let client_order_id = Uuid::new_v4().to_string();
        let order = self
            .broker
            .place_limit_buy(symbol, quote_amount, limit_price, &client_order_id)
            .await
            .with_context(|| format!("{} buy for {}", kind.as_str(), symbol))?;
        self.note_submission(asset.id, kind.as_str());
        self.store.update_cycle(
            cycle.id,
            &CyclePatch {
                status: Some(CycleStatus::Buying),
                latest_order: Some(Some((order.id.clone(), Utc::now()))),
                ..Default::default()
            },
        )?;
        json_log(
            Domain::Exec,
            "buy_submitted",
            obj(&[
                ("symbol", v_str(symbol)),
                ("cycle_id", v_int(cycle.id)),
                ("order_id", v_str(&order.id)),
                ("client_order_id", v_str(&client_order_id)),
                ("kind", v_str(kind.as_str())),
                ("limit_price", v_dec(limit_price)),
                ("quote_amount", v_dec(quote_amount)),
            ]),
        );
        Ok(())
    }

    async fn place_sell(
        &self,
        asset: &Asset,
        cycle: &Cycle,
        kind: SellKind,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<()> {
        if !self.submission_allowed(asset.id, kind.as_str()) {
            return Ok(());
        }
        let client_order_id = Uuid::new_v4().to_string();
        let order = self
            .broker
            .place_market_sell(symbol, quantity, &client_order_id)
            .await
            .with_context(|| format!("{} sell for {}", kind.as_str(), symbol))?;
        self.note_submission(asset.id, kind.as_str());
        self.store.update_cycle(
            cycle.id,
            &CyclePatch {
                status: Some(CycleStatus::Selling),
                latest_order: Some(Some((order.id.clone(), Utc::now()))),
                ..Default::default()
            },
        )?;
        json_log(
            Domain::Exec,
            "sell_submitted",
            obj(&[
                ("symbol", v_str(symbol)),
                ("cycle_id", v_int(cycle.id)),
                ("order_id", v_str(&order.id)),
                ("client_order_id", v_str(&client_order_id)),
                ("kind", v_str(kind.as_str())),
                ("quantity", v_dec(quantity)),
            ]),
        );
        Ok(())
    }

    fn submission_allowed(&self, asset_id: i64, kind: &'static str) -> bool {
        let map = self.last_submission.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(&(asset_id, kind)) {
            Some(prev) => {
                prev.elapsed() >= Duration::from_secs(self.cfg.order_cooldown_secs)
            }
            None => true,
        }
    }

    fn note_submission(&self, asset_id: i64, kind: &'static str) {
        let mut map = self.last_submission.lock().unwrap_or_else(|p| p.into_inner());
        map.insert((asset_id, kind), Instant::now());
    }

    // ------------------------------------------------------------------
    // Trade-update path
    // ------------------------------------------------------------------

    pub async fn handle_trade_update(&self, ev: TradeEvent) {
        {
            let seen = self.seen_events.lock().unwrap_or_else(|p| p.into_inner());
            if seen.contains(&ev.order.id, ev.kind) {
                log(
                    Level::Debug,
                    Domain::Fill,
                    "duplicate_trade_update",
                    obj(&[("order_id", v_str(&ev.order.id)), ("event", v_str(ev.kind.as_str()))]),
                );
                return;
            }
        }

        if matches!(ev.kind, TradeEventKind::New | TradeEventKind::PartialFill) {
            // Partial fills wait for the terminal event to mutate state.
            json_log(
                Domain::Fill,
                "order_progress",
                obj(&[
                    ("order_id", v_str(&ev.order.id)),
                    ("symbol", v_str(&ev.order.symbol)),
                    ("event", v_str(ev.kind.as_str())),
                    ("filled_qty", v_dec(ev.order.filled_qty)),
                ]),
            );
            self.mark_seen(&ev);
            return;
        }

        let cycle = match self.store.find_cycle_by_order_id(&ev.order.id) {
            Ok(Some(cycle)) => cycle,
            Ok(None) => {
                // Orphan events never mutate cycles.
                log(
                    Level::Warn,
                    Domain::Fill,
                    "orphan_trade_update",
                    obj(&[
                        ("order_id", v_str(&ev.order.id)),
                        ("symbol", v_str(&ev.order.symbol)),
                        ("event", v_str(ev.kind.as_str())),
                    ]),
                );
                self.mark_seen(&ev);
                return;
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Fill,
                    "cycle_lookup_failed",
                    obj(&[("order_id", v_str(&ev.order.id)), ("error", v_str(&err.to_string()))]),
                );
                return;
            }
        };

        let Some(guard) = self.locks.acquire(cycle.asset_id, self.lock_wait()).await else {
            log(
                Level::Error,
                Domain::Fill,
                "asset_lock_timeout",
                obj(&[("order_id", v_str(&ev.order.id)), ("cycle_id", v_int(cycle.id))]),
            );
            return;
        };
        // Re-read under the lock; the quote path may have moved the cycle.
        let cycle = match self.store.find_cycle_by_order_id(&ev.order.id) {
            Ok(Some(cycle)) => cycle,
            Ok(None) => {
                self.mark_seen(&ev);
                return;
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Fill,
                    "cycle_lookup_failed",
                    obj(&[("order_id", v_str(&ev.order.id)), ("error", v_str(&err.to_string()))]),
                );
                return;
            }
        };

        let result = match (ev.kind, ev.order.side) {
            (TradeEventKind::Fill, Side::Buy) => self.apply_buy_fill(&cycle, &ev),
            (TradeEventKind::Fill, Side::Sell) => self.apply_sell_fill(&cycle, &ev),
            (_, Side::Buy) => self.apply_buy_terminal(&cycle, &ev),
            (_, Side::Sell) => self.apply_sell_terminal(&cycle, &ev).await,
        };
        drop(guard);

        match result {
            Ok(()) => self.mark_seen(&ev),
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Fill,
                    "trade_update_failed",
                    obj(&[
                        ("order_id", v_str(&ev.order.id)),
                        ("cycle_id", v_int(cycle.id)),
                        ("event", v_str(ev.kind.as_str())),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
            }
        }
    }

    fn mark_seen(&self, ev: &TradeEvent) {
        let mut seen = self.seen_events.lock().unwrap_or_else(|p| p.into_inner());
        seen.insert(ev.order.id.clone(), ev.kind);
    }

    fn apply_buy_fill(&self, cycle: &Cycle, ev: &TradeEvent) -> Result<()> {
        let fill_qty = ev.order.filled_qty;
        if fill_qty <= Decimal::ZERO {
            return Err(anyhow!("buy fill for order {} has no filled quantity", ev.order.id));
        }
        let fill_price = ev
            .order
            .filled_avg_price
            .ok_or_else(|| anyhow!("buy fill for order {} has no average price", ev.order.id))?;
        let was_safety = !cycle.is_flat();
        let (new_qty, new_avg) =
            strategy::weighted_average(cycle.quantity, cycle.average_purchase_price, fill_qty, fill_price);
        self.store.update_cycle(
            cycle.id,
            &CyclePatch {
                status: Some(CycleStatus::Watching),
                quantity: Some(new_qty),
                average_purchase_price: Some(new_avg),
                safety_orders: Some(cycle.safety_orders + u32::from(was_safety)),
                latest_order: Some(None),
                last_order_fill_price: Some(Some(fill_price)),
                ..Default::default()
            },
        )?;
        json_log(
            Domain::Fill,
            "buy_filled",
            obj(&[
                ("symbol", v_str(&ev.order.symbol)),
                ("cycle_id", v_int(cycle.id)),
                ("order_id", v_str(&ev.order.id)),
                ("kind", v_str(if was_safety { "safety" } else { "base" })),
                ("fill_qty", v_dec(fill_qty)),
                ("fill_price", v_dec(fill_price)),
                ("quantity", v_dec(new_qty)),
                ("average_purchase_price", v_dec(new_avg)),
            ]),
        );
        Ok(())
    }

    fn apply_sell_fill(&self, cycle: &Cycle, ev: &TradeEvent) -> Result<()> {
        let Some(sell_price) = ev.order.filled_avg_price else {
            // Zero-quantity fills arrive with no price; leave the cycle
            // for the consistency sweep rather than roll over on garbage.
            return Err(anyhow!("sell fill for order {} has no average price", ev.order.id));
        };
        let (closed, fresh) =
            self.store.complete_and_rollover(cycle.id, CycleStatus::Complete, Some(sell_price))?;
        self.store.set_asset_last_sell_price(cycle.asset_id, sell_price)?;
        json_log(
            Domain::Cycle,
            "cycle_complete",
            obj(&[
                ("symbol", v_str(&ev.order.symbol)),
                ("cycle_id", v_int(closed.id)),
                ("next_cycle_id", v_int(fresh.id)),
                ("order_id", v_str(&ev.order.id)),
                ("sell_price", v_dec(sell_price)),
                ("quantity", v_dec(closed.quantity)),
                ("average_purchase_price", v_dec(closed.average_purchase_price)),
                ("safety_orders", v_int(closed.safety_orders as i64)),
            ]),
        );
        Ok(())
    }

    fn apply_buy_terminal(&self, cycle: &Cycle, ev: &TradeEvent) -> Result<()> {
        if cycle.status != CycleStatus::Buying {
            log(
                Level::Warn,
                Domain::Fill,
                "buy_terminal_out_of_band",
                obj(&[
                    ("order_id", v_str(&ev.order.id)),
                    ("cycle_id", v_int(cycle.id)),
                    ("status", v_str(cycle.status.as_str())),
                ]),
            );
            return Ok(());
        }
        self.store.update_cycle(
            cycle.id,
            &CyclePatch {
                status: Some(CycleStatus::Watching),
                latest_order: Some(None),
                ..Default::default()
            },
        )?;
        json_log(
            Domain::Cycle,
            "buy_order_closed",
            obj(&[
                ("symbol", v_str(&ev.order.symbol)),
                ("cycle_id", v_int(cycle.id)),
                ("order_id", v_str(&ev.order.id)),
                ("event", v_str(ev.kind.as_str())),
            ]),
        );
        Ok(())
    }

    /// A sell that reports canceled/rejected/expired may still have
    /// filled; the broker position decides which way the cycle goes.
    async fn apply_sell_terminal(&self, cycle: &Cycle, ev: &TradeEvent) -> Result<()> {
        let position = self
            .broker
            .get_position(&ev.order.symbol)
            .await
            .with_context(|| format!("position check for {}", ev.order.symbol))?;
        let pos_qty = position.as_ref().map(|p| p.qty).unwrap_or(Decimal::ZERO);
        if pos_qty > Decimal::ZERO {
            // Still holding: back to watching with the broker's quantity.
            let avg_resync = position.as_ref().and_then(|p| p.avg_entry_price);
            self.store.update_cycle(
                cycle.id,
                &CyclePatch {
                    status: Some(CycleStatus::Watching),
                    quantity: Some(pos_qty),
                    average_purchase_price: avg_resync,
                    latest_order: Some(None),
                    ..Default::default()
                },
            )?;
            json_log(
                Domain::Cycle,
                "sell_order_closed",
                obj(&[
                    ("symbol", v_str(&ev.order.symbol)),
                    ("cycle_id", v_int(cycle.id)),
                    ("order_id", v_str(&ev.order.id)),
                    ("event", v_str(ev.kind.as_str())),
                    ("position_qty", v_dec(pos_qty)),
                ]),
            );
            return Ok(());
        }
        // Position gone: the sell actually filled before the cancel.
        let (closed, fresh) = self.store.complete_and_rollover(
            cycle.id,
            CycleStatus::Complete,
            ev.order.filled_avg_price,
        )?;
        if let Some(price) = ev.order.filled_avg_price {
            self.store.set_asset_last_sell_price(cycle.asset_id, price)?;
        }
        json_log(
            Domain::Cycle,
            "cycle_complete",
            obj(&[
                ("symbol", v_str(&ev.order.symbol)),
                ("cycle_id", v_int(closed.id)),
                ("next_cycle_id", v_int(fresh.id)),
                ("order_id", v_str(&ev.order.id)),
                ("event", v_str(ev.kind.as_str())),
                ("msg", v_str("sell filled despite cancel event")),
            ]),
        );
        Ok(())
    }
}
