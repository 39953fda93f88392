//! Market-data stream: authenticate, subscribe to the configured
//! symbols, and forward top-of-book quotes to the runtime.
//!
//! Quotes are forwarded with `try_send`: the runtime coalesces per asset
//! anyway, so under backpressure the freshest quotes win and stale ones
//! are dropped on the floor.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::types::Quote;
use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::state::Config;

use super::{backoff_delay, IDLE_TIMEOUT};

#[derive(Debug, Deserialize)]
struct WsQuote {
    #[serde(rename = "T")]
    kind: String,
    #[serde(rename = "S")]
    symbol: String,
    #[serde(rename = "bp")]
    bid_price: Decimal,
    #[serde(rename = "bs")]
    bid_size: Decimal,
    #[serde(rename = "ap")]
    ask_price: Decimal,
    #[serde(rename = "as")]
    ask_size: Decimal,
    #[serde(rename = "t")]
    ts: String,
}

pub async fn run_quote_stream(
    cfg: Config,
    symbols: Vec<String>,
    tx: mpsc::Sender<Quote>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match connect_and_stream(&cfg, &symbols, &tx).await {
            Ok(()) => {
                // Clean close; reconnect from a cold backoff.
                attempt = 0;
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Market,
                    "quote_stream_disconnect",
                    obj(&[
                        ("error", v_str(&err.to_string())),
                        ("attempt", v_int(attempt as i64)),
                    ]),
                );
            }
        }
        if tx.is_closed() {
            return Ok(());
        }
        sleep(backoff_delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn connect_and_stream(
    cfg: &Config,
    symbols: &[String],
    tx: &mpsc::Sender<Quote>,
) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(cfg.broker_data_ws.as_str()).await?;
    let (mut write, mut read) = ws.split();

    let auth = json!({
        "action": "auth",
        "key": cfg.broker_key.clone().unwrap_or_default(),
        "secret": cfg.broker_secret.clone().unwrap_or_default(),
    });
    write.send(Message::Text(auth.to_string())).await?;

    let subscribe = json!({ "action": "subscribe", "quotes": symbols });
    write.send(Message::Text(subscribe.to_string())).await?;
    json_log(
        Domain::Market,
        "quote_stream_subscribed",
        obj(&[("symbols", v_int(symbols.len() as i64))]),
    );

    loop {
        let msg = match timeout(IDLE_TIMEOUT, read.next()).await {
            Ok(Some(msg)) => msg?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(anyhow!("quote stream idle past {:?}", IDLE_TIMEOUT)),
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(()),
            _ => continue,
        };
        // Data frames arrive as arrays of tagged objects; anything that
        // is not a quote ("q") is control chatter and skipped.
        let Ok(frames) = serde_json::from_str::<Vec<serde_json::Value>>(&text) else {
            continue;
        };
        for frame in frames {
            let Ok(ws_quote) = serde_json::from_value::<WsQuote>(frame) else {
                continue;
            };
            if ws_quote.kind != "q" {
                continue;
            }
            let ts = parse_ts(&ws_quote.ts);
            let quote = Quote {
                symbol: ws_quote.symbol,
                bid_price: ws_quote.bid_price,
                bid_size: ws_quote.bid_size,
                ask_price: ws_quote.ask_price,
                ask_size: ws_quote.ask_size,
                ts,
            };
            if tx.try_send(quote).is_err() && tx.is_closed() {
                return Ok(());
            }
        }
    }
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
