use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fractional digits kept for prices at storage and broker boundaries.
pub const PRICE_SCALE: u32 = 10;
/// Fractional digits kept for quantities at storage and broker boundaries.
pub const QTY_SCALE: u32 = 15;

#[derive(Clone, Debug)]
pub struct Config {
    pub broker_key: Option<String>,
    pub broker_secret: Option<String>,
    pub broker_api_base: String,
    pub broker_data_ws: String,
    pub broker_trade_ws: String,
    pub sqlite_path: String,
    pub dry_run: bool,
    pub testing_mode: bool,
    pub order_cooldown_secs: u64,
    pub stale_order_threshold_mins: i64,
    pub stuck_sell_timeout_secs: i64,
    pub stale_sweep_secs: u64,
    pub consistency_sweep_secs: u64,
    pub bootstrap_sweep_secs: u64,
    pub quote_channel_capacity: usize,
    pub trade_channel_capacity: usize,
    pub drain_deadline_secs: u64,
    pub lock_wait_secs: u64,
    pub pid_file: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            broker_key: std::env::var("BROKER_KEY").ok(),
            broker_secret: std::env::var("BROKER_SECRET").ok(),
            broker_api_base: std::env::var("BROKER_API_BASE")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string()),
            broker_data_ws: std::env::var("BROKER_DATA_WS")
                .unwrap_or_else(|_| "wss://stream.data.alpaca.markets/v1beta3/crypto/us".to_string()),
            broker_trade_ws: std::env::var("BROKER_TRADE_WS")
                .unwrap_or_else(|_| "wss://paper-api.alpaca.markets/stream".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./dcafx.sqlite".to_string()),
            dry_run: flag_env("DRY_RUN", false),
            testing_mode: flag_env("TESTING_MODE", false),
            order_cooldown_secs: num_env("ORDER_COOLDOWN_SECS", 5),
            stale_order_threshold_mins: num_env("STALE_ORDER_THRESHOLD_MINS", 5),
            stuck_sell_timeout_secs: num_env("STUCK_SELL_TIMEOUT_SECS", 75),
            stale_sweep_secs: num_env("STALE_SWEEP_SECS", 60),
            consistency_sweep_secs: num_env("CONSISTENCY_SWEEP_SECS", 300),
            bootstrap_sweep_secs: num_env("BOOTSTRAP_SWEEP_SECS", 900),
            quote_channel_capacity: num_env("QUOTE_CHANNEL_CAP", 1024),
            trade_channel_capacity: num_env("TRADE_CHANNEL_CAP", 256),
            drain_deadline_secs: num_env("DRAIN_DEADLINE_SECS", 15),
            lock_wait_secs: num_env("LOCK_WAIT_SECS", 10),
            pid_file: std::env::var("PID_FILE").unwrap_or_else(|_| "./dcafx.pid".to_string()),
        }
    }
}

fn num_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn flag_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

pub fn now_ts() -> u64 {
    Utc::now().timestamp() as u64
}

/// One tradable symbol and its DCA parameters. Rows live in the `assets`
/// table; administrators add them out of band and the bootstrap sweep
/// picks them up.
#[derive(Clone, Debug, PartialEq)]
pub struct Asset {
    pub id: i64,
    pub symbol: String,
    pub enabled: bool,
    pub base_order_amount: Decimal,
    pub safety_order_amount: Decimal,
    pub max_safety_orders: u32,
    pub safety_order_deviation_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub ttp_enabled: bool,
    pub ttp_deviation_percent: Decimal,
    pub cooldown_period_seconds: i64,
    pub buy_order_price_deviation_percent: Decimal,
    pub last_sell_price: Option<Decimal>,
}

/// Field set for inserting a new asset row (id assigned by the store).
#[derive(Clone, Debug)]
pub struct NewAsset {
    pub symbol: String,
    pub enabled: bool,
    pub base_order_amount: Decimal,
    pub safety_order_amount: Decimal,
    pub max_safety_orders: u32,
    pub safety_order_deviation_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub ttp_enabled: bool,
    pub ttp_deviation_percent: Decimal,
    pub cooldown_period_seconds: i64,
    pub buy_order_price_deviation_percent: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Watching,
    Buying,
    Selling,
    Trailing,
    Complete,
    Error,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Watching => "watching",
            CycleStatus::Buying => "buying",
            CycleStatus::Selling => "selling",
            CycleStatus::Trailing => "trailing",
            CycleStatus::Complete => "complete",
            CycleStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "watching" => Some(CycleStatus::Watching),
            "buying" => Some(CycleStatus::Buying),
            "selling" => Some(CycleStatus::Selling),
            "trailing" => Some(CycleStatus::Trailing),
            "complete" => Some(CycleStatus::Complete),
            "error" => Some(CycleStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Complete | CycleStatus::Error)
    }
}

/// One end-to-end run of the strategy for one asset: base buy, optional
/// safety buys, one sell. Exactly one non-terminal cycle exists per
/// enabled asset; terminal cycles are history and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Cycle {
    pub id: i64,
    pub asset_id: i64,
    pub status: CycleStatus,
    pub quantity: Decimal,
    pub average_purchase_price: Decimal,
    pub safety_orders: u32,
    pub latest_order_id: Option<String>,
    pub latest_order_created_at: Option<DateTime<Utc>>,
    pub last_order_fill_price: Option<Decimal>,
    pub highest_trailing_price: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cycle {
    /// A flat cycle holds nothing and is waiting for a base order.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            CycleStatus::Watching,
            CycleStatus::Buying,
            CycleStatus::Selling,
            CycleStatus::Trailing,
            CycleStatus::Complete,
            CycleStatus::Error,
        ] {
            assert_eq!(CycleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CycleStatus::parse("cooldown"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(CycleStatus::Complete.is_terminal());
        assert!(CycleStatus::Error.is_terminal());
        assert!(!CycleStatus::Watching.is_terminal());
        assert!(!CycleStatus::Buying.is_terminal());
        assert!(!CycleStatus::Selling.is_terminal());
        assert!(!CycleStatus::Trailing.is_terminal());
    }
}
