use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{OrderSnapshot, Position};

/// Broker failures, split so callers can tell what is worth retrying.
/// Transport problems, rate limits, server errors, and timeouts are
/// transient; auth and validation failures need an operator.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited")]
    RateLimited,

    #[error("broker returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("undecodable broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Map a non-success HTTP status to the right variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => BrokerError::Auth(body),
            429 => BrokerError::RateLimited,
            400 | 404 | 422 => BrokerError::InvalidRequest(body),
            _ => BrokerError::Http { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Transport(_) | BrokerError::Timeout(_) | BrokerError::RateLimited => true,
            BrokerError::Http { status, .. } => matches!(status, 408 | 500 | 502 | 503 | 504),
            BrokerError::Auth(_) | BrokerError::InvalidRequest(_) | BrokerError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout(0)
        } else if err.is_decode() {
            BrokerError::Decode(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

/// Narrow capability interface to the external broker. Implementations
/// must be safe for concurrent use; callers multiplex one instance.
/// Order placement carries a caller-supplied `client_order_id` so a
/// retried submission cannot double-place.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Limit buy sized in quote currency (notional).
    async fn place_limit_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        limit_price: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError>;

    /// Market sell of an exact base quantity.
    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError>;

    /// Request cancellation. Succeeds if the order is already gone.
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// None when the broker does not know the order.
    async fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, BrokerError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError>;

    /// None when the broker holds no position for the symbol.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError>;
}
