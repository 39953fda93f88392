//! REST client for the Alpaca-style trading API.
//!
//! Requests authenticate with plain key/secret headers. All monetary
//! values cross the wire as strings; they are parsed into decimals here
//! and never as floats. Transient failures are retried with bounded
//! backoff; auth and validation failures surface to the caller at once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use url::Url;

use crate::state::{Config, PRICE_SCALE};

use super::broker::{Broker, BrokerError};
use super::retry::{retry_broker, RetryConfig};
use super::types::{OrderSnapshot, OrderStatus, OrderType, Position, Side};

// Per-call deadlines. Placement and cancellation get a wider window than
// the read paths.
const ORDER_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

// The venue accepts at most 9 fractional digits on crypto quantities.
const VENUE_QTY_SCALE: u32 = 9;

pub struct AlpacaBroker {
    client: Client,
    base: Url,
    key: String,
    secret: String,
    testing_mode: bool,
    retry: RetryConfig,
}

impl AlpacaBroker {
    pub fn new(cfg: &Config, key: String, secret: String) -> Result<Self, BrokerError> {
        let base = Url::parse(&cfg.broker_api_base).map_err(|e| {
            BrokerError::InvalidRequest(format!(
                "broker api base {:?}: {}",
                cfg.broker_api_base, e
            ))
        })?;
        Ok(Self {
            client: Client::new(),
            base,
            key,
            secret,
            testing_mode: cfg.testing_mode,
            retry: RetryConfig::default(),
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
    ) -> Result<RequestBuilder, BrokerError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| BrokerError::InvalidRequest(format!("endpoint {:?}: {}", path, e)))?;
        Ok(self
            .client
            .request(method, url)
            .header("APCA-API-KEY-ID", &self.key)
            .header("APCA-API-SECRET-KEY", &self.secret)
            .timeout(timeout))
    }

    async fn read_error(resp: Response) -> BrokerError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        BrokerError::from_status(status, body)
    }
}

/// Wire shape of one order, shared by the REST responses and the
/// trade-update stream payloads.
#[derive(Debug, Deserialize)]
pub struct ApiOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type", alias = "order_type")]
    pub order_type: String,
    pub qty: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
    pub limit_price: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl ApiOrder {
    pub fn into_snapshot(self) -> Result<OrderSnapshot, BrokerError> {
        let side = Side::parse(&self.side)
            .ok_or_else(|| BrokerError::Decode(format!("unknown order side {:?}", self.side)))?;
        let order_type = match self.order_type.as_str() {
            "limit" => OrderType::Limit,
            "market" => OrderType::Market,
            other => return Err(BrokerError::Decode(format!("unknown order type {:?}", other))),
        };
        Ok(OrderSnapshot {
            side,
            order_type,
            qty: parse_opt_dec("qty", self.qty)?,
            filled_qty: parse_opt_dec("filled_qty", self.filled_qty)?.unwrap_or(Decimal::ZERO),
            filled_avg_price: parse_opt_dec("filled_avg_price", self.filled_avg_price)?,
            limit_price: parse_opt_dec("limit_price", self.limit_price)?,
            status: OrderStatus::parse(&self.status),
            created_at: parse_rfc3339("created_at", &self.created_at)?,
            updated_at: self
                .updated_at
                .as_deref()
                .map(|t| parse_rfc3339("updated_at", t))
                .transpose()?,
            id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
        })
    }
}

pub fn parse_opt_dec(field: &str, value: Option<String>) -> Result<Option<Decimal>, BrokerError> {
    value
        .map(|text| {
            text.parse::<Decimal>()
                .map_err(|e| BrokerError::Decode(format!("{}: {:?}: {}", field, text, e)))
        })
        .transpose()
}

pub fn parse_rfc3339(field: &str, text: &str) -> Result<DateTime<Utc>, BrokerError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BrokerError::Decode(format!("{}: {:?}: {}", field, text, e)))
}

/// The positions endpoint addresses crypto symbols without the slash.
fn position_path_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

#[derive(Debug, Deserialize)]
struct ApiPosition {
    symbol: String,
    qty: String,
    avg_entry_price: Option<String>,
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn place_limit_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        limit_price: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        if limit_price <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "non-positive limit price {}",
                limit_price
            )));
        }
        // Testing mode pads the limit upward so paper fills land at once.
        let effective_limit = if self.testing_mode {
            limit_price * Decimal::new(105, 2)
        } else {
            limit_price
        };
        let qty = (quote_amount / effective_limit).round_dp(VENUE_QTY_SCALE);
        if qty <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "order quantity rounds to zero for amount {}",
                quote_amount
            )));
        }
        let body = json!({
            "symbol": symbol,
            "side": "buy",
            "type": "limit",
            "time_in_force": "gtc",
            "qty": qty.to_string(),
            "limit_price": effective_limit.round_dp(PRICE_SCALE).normalize().to_string(),
            "client_order_id": client_order_id,
        });
        retry_broker(&self.retry, "place_limit_buy", || async {
            let resp = self
                .request(Method::POST, "/v2/orders", ORDER_TIMEOUT)?
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::read_error(resp).await);
            }
            let order: ApiOrder = resp.json().await?;
            order.into_snapshot()
        })
        .await
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        let qty = qty.round_dp(VENUE_QTY_SCALE);
        if qty <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!("non-positive sell qty {}", qty)));
        }
        let body = json!({
            "symbol": symbol,
            "side": "sell",
            "type": "market",
            "time_in_force": "gtc",
            "qty": qty.to_string(),
            "client_order_id": client_order_id,
        });
        retry_broker(&self.retry, "place_market_sell", || async {
            let resp = self
                .request(Method::POST, "/v2/orders", ORDER_TIMEOUT)?
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::read_error(resp).await);
            }
            let order: ApiOrder = resp.json().await?;
            order.into_snapshot()
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/v2/orders/{}", order_id);
        retry_broker(&self.retry, "cancel_order", || async {
            let resp = self.request(Method::DELETE, &path, ORDER_TIMEOUT)?.send().await?;
            match resp.status() {
                s if s.is_success() => Ok(()),
                // Gone or already terminal: cancellation is moot.
                StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => Ok(()),
                _ => Err(Self::read_error(resp).await),
            }
        })
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderSnapshot>, BrokerError> {
        let path = format!("/v2/orders/{}", order_id);
        retry_broker(&self.retry, "get_order", || async {
            let resp = self.request(Method::GET, &path, READ_TIMEOUT)?.send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                return Err(Self::read_error(resp).await);
            }
            let order: ApiOrder = resp.json().await?;
            order.into_snapshot().map(Some)
        })
        .await
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        retry_broker(&self.retry, "get_open_orders", || async {
            let resp = self
                .request(Method::GET, "/v2/orders?status=open&limit=500", READ_TIMEOUT)?
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::read_error(resp).await);
            }
            let orders: Vec<ApiOrder> = resp.json().await?;
            orders.into_iter().map(ApiOrder::into_snapshot).collect()
        })
        .await
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        let path = format!("/v2/positions/{}", position_path_symbol(symbol));
        retry_broker(&self.retry, "get_position", || async {
            let resp = self.request(Method::GET, &path, READ_TIMEOUT)?.send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                return Err(Self::read_error(resp).await);
            }
            let pos: ApiPosition = resp.json().await?;
            Ok(Some(Position {
                qty: pos
                    .qty
                    .parse::<Decimal>()
                    .map_err(|e| BrokerError::Decode(format!("position qty: {}", e)))?,
                avg_entry_price: parse_opt_dec("avg_entry_price", pos.avg_entry_price)?,
                symbol: pos.symbol,
            }))
        })
        .await
    }
}
