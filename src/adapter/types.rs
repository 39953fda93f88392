use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// Broker-side order lifecycle states, as reported over REST and the
/// trade-update stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    DoneForDay,
    Replaced,
    Other(String),
}

impl OrderStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "new" => OrderStatus::New,
            "accepted" => OrderStatus::Accepted,
            "pending_new" => OrderStatus::PendingNew,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            "done_for_day" => OrderStatus::DoneForDay,
            "replaced" => OrderStatus::Replaced,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::DoneForDay => "done_for_day",
            OrderStatus::Replaced => "replaced",
            OrderStatus::Other(s) => s,
        }
    }

    /// States in which the order can still trade; anything else counts as
    /// terminal for reconciliation purposes.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::Accepted
                | OrderStatus::PendingNew
                | OrderStatus::PartiallyFilled
        )
    }
}

/// A value-type snapshot of one broker order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Option<Decimal>,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeEventKind {
    New,
    PartialFill,
    Fill,
    Canceled,
    Rejected,
    Expired,
}

impl TradeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeEventKind::New => "new",
            TradeEventKind::PartialFill => "partial_fill",
            TradeEventKind::Fill => "fill",
            TradeEventKind::Canceled => "canceled",
            TradeEventKind::Rejected => "rejected",
            TradeEventKind::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(TradeEventKind::New),
            "partial_fill" => Some(TradeEventKind::PartialFill),
            "fill" => Some(TradeEventKind::Fill),
            "canceled" => Some(TradeEventKind::Canceled),
            "rejected" => Some(TradeEventKind::Rejected),
            "expired" => Some(TradeEventKind::Expired),
            _ => None,
        }
    }

    /// Terminal events settle the order one way or the other.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeEventKind::Fill
                | TradeEventKind::Canceled
                | TradeEventKind::Rejected
                | TradeEventKind::Expired
        )
    }
}

/// One order-lifecycle event off the account trade-update stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub kind: TradeEventKind,
    pub order: OrderSnapshot,
}

/// Top-of-book quote off the market-data stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub ts: DateTime<Utc>,
}

/// Broker-reported holding for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Option<Decimal>,
}
