use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use super::broker::{Broker, BrokerError};
use super::types::{OrderSnapshot, OrderStatus, OrderType, Position, Side};

// Stub implementation to make integration explicit. Selected for dry
// runs and when credentials are absent: orders are acknowledged locally
// and nothing reaches a venue, so no fills ever come back.
pub struct NullBroker;

#[async_trait]
impl Broker for NullBroker {
    async fn place_limit_buy(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        limit_price: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        Ok(OrderSnapshot {
            id: format!("stub-{}", client_order_id),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: Some(quote_amount / limit_price),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            limit_price: Some(limit_price),
            status: OrderStatus::New,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        Ok(OrderSnapshot {
            id: format!("stub-{}", client_order_id),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Sell,
            order_type: OrderType::Market,
            qty: Some(qty),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            limit_price: None,
            status: OrderStatus::New,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn get_order(&self, _order_id: &str) -> Result<Option<OrderSnapshot>, BrokerError> {
        Ok(None)
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(Vec::new())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<Position>, BrokerError> {
        Ok(None)
    }
}
