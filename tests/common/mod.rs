//! Shared fixtures: a scripted in-memory broker and store/runtime
//! builders used across the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use dcafx::adapter::types::{
    OrderSnapshot, OrderStatus, OrderType, Position, Quote, Side, TradeEvent, TradeEventKind,
};
use dcafx::adapter::{Broker, BrokerError};
use dcafx::runtime::Runtime;
use dcafx::state::{Config, NewAsset};
use dcafx::storage::CycleStore;

/// Broker double: records placements and cancels, serves scripted
/// orders and positions.
#[derive(Default)]
pub struct MockBroker {
    seq: AtomicU64,
    pub placed: Mutex<Vec<OrderSnapshot>>,
    pub canceled: Mutex<Vec<String>>,
    pub orders: Mutex<HashMap<String, OrderSnapshot>>,
    pub open_orders: Mutex<Vec<OrderSnapshot>>,
    pub positions: Mutex<HashMap<String, Position>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_position(&self, symbol: &str, qty: Decimal, avg: Option<Decimal>) {
        self.positions.lock().unwrap().insert(
            symbol.to_string(),
            Position { symbol: symbol.to_string(), qty, avg_entry_price: avg },
        );
    }

    pub fn clear_position(&self, symbol: &str) {
        self.positions.lock().unwrap().remove(symbol);
    }

    pub fn script_order(&self, order: OrderSnapshot) {
        self.orders.lock().unwrap().insert(order.id.clone(), order);
    }

    pub fn add_open_order(&self, order: OrderSnapshot) {
        self.open_orders.lock().unwrap().push(order);
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }

    pub fn last_placed(&self) -> Option<OrderSnapshot> {
        self.placed.lock().unwrap().last().cloned()
    }

    pub fn canceled_ids(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    fn next_id(&self) -> String {
        format!("mock-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn place_limit_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        limit_price: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        let order = OrderSnapshot {
            id: self.next_id(),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: Some(quote_amount / limit_price),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            limit_price: Some(limit_price),
            status: OrderStatus::Accepted,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.placed.lock().unwrap().push(order.clone());
        self.orders.lock().unwrap().insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        let order = OrderSnapshot {
            id: self.next_id(),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Sell,
            order_type: OrderType::Market,
            qty: Some(qty),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            limit_price: None,
            status: OrderStatus::Accepted,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.placed.lock().unwrap().push(order.clone());
        self.orders.lock().unwrap().insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.canceled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, BrokerError> {
        Ok(self.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        Ok(self.positions.lock().unwrap().get(symbol).cloned())
    }
}

/// Config with deterministic values, never read from the environment.
pub fn test_config(sqlite_path: &str) -> Config {
    Config {
        broker_key: None,
        broker_secret: None,
        broker_api_base: "http://localhost:0".to_string(),
        broker_data_ws: "ws://localhost:0".to_string(),
        broker_trade_ws: "ws://localhost:0".to_string(),
        sqlite_path: sqlite_path.to_string(),
        dry_run: false,
        testing_mode: false,
        order_cooldown_secs: 0,
        stale_order_threshold_mins: 5,
        stuck_sell_timeout_secs: 75,
        stale_sweep_secs: 60,
        consistency_sweep_secs: 300,
        bootstrap_sweep_secs: 900,
        quote_channel_capacity: 64,
        trade_channel_capacity: 64,
        drain_deadline_secs: 1,
        lock_wait_secs: 2,
        pid_file: "/tmp/dcafx-test.pid".to_string(),
    }
}

pub fn open_store(path: &str) -> Arc<CycleStore> {
    let store = CycleStore::open(path).expect("open store");
    store.init().expect("init store");
    Arc::new(store)
}

pub fn test_runtime(broker: Arc<MockBroker>) -> (Arc<Runtime>, Arc<CycleStore>) {
    let store = open_store(":memory:");
    let rt = Arc::new(Runtime::new(test_config(":memory:"), store.clone(), broker));
    (rt, store)
}

pub fn btc_asset() -> NewAsset {
    NewAsset {
        symbol: "BTC/USD".to_string(),
        enabled: true,
        base_order_amount: dec!(20),
        safety_order_amount: dec!(40),
        max_safety_orders: 3,
        safety_order_deviation_percent: dec!(1.0),
        take_profit_percent: dec!(1.5),
        ttp_enabled: false,
        ttp_deviation_percent: dec!(0.5),
        cooldown_period_seconds: 600,
        buy_order_price_deviation_percent: dec!(2.0),
    }
}

pub fn quote(symbol: &str, bid: Decimal, ask: Decimal) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        bid_price: bid,
        bid_size: dec!(1),
        ask_price: ask,
        ask_size: dec!(1),
        ts: Utc::now(),
    }
}

pub fn order_snapshot(
    id: &str,
    symbol: &str,
    side: Side,
    status: OrderStatus,
    created_at: DateTime<Utc>,
) -> OrderSnapshot {
    OrderSnapshot {
        id: id.to_string(),
        client_order_id: format!("cid-{}", id),
        symbol: symbol.to_string(),
        side,
        order_type: if side == Side::Buy { OrderType::Limit } else { OrderType::Market },
        qty: None,
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        limit_price: None,
        status,
        created_at,
        updated_at: None,
    }
}

pub fn fill_event(
    order_id: &str,
    symbol: &str,
    side: Side,
    filled_qty: Decimal,
    filled_avg_price: Decimal,
) -> TradeEvent {
    let mut order = order_snapshot(order_id, symbol, side, OrderStatus::Filled, Utc::now());
    order.filled_qty = filled_qty;
    order.filled_avg_price = Some(filled_avg_price);
    TradeEvent { kind: TradeEventKind::Fill, order }
}

pub fn terminal_event(
    kind: TradeEventKind,
    order_id: &str,
    symbol: &str,
    side: Side,
    filled_avg_price: Option<Decimal>,
) -> TradeEvent {
    let mut order = order_snapshot(order_id, symbol, side, OrderStatus::Canceled, Utc::now());
    order.filled_avg_price = filled_avg_price;
    TradeEvent { kind, order }
}

pub fn minutes_ago(mins: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(mins)
}

pub fn seconds_ago(secs: i64) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(secs)
}
