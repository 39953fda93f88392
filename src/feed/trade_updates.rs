//! Account trade-update stream: order lifecycle events for every symbol
//! the account touches.
//!
//! Unlike quotes, these events are never dropped. Forwarding uses
//! `send().await` so a slow consumer backpressures the socket instead of
//! losing a fill.

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::alpaca::ApiOrder;
use crate::adapter::types::{TradeEvent, TradeEventKind};
use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::state::Config;

use super::{backoff_delay, IDLE_TIMEOUT};

#[derive(Debug, Deserialize)]
struct StreamFrame {
    stream: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TradeUpdatePayload {
    event: String,
    order: ApiOrder,
}

pub async fn run_trade_update_stream(cfg: Config, tx: mpsc::Sender<TradeEvent>) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match connect_and_stream(&cfg, &tx).await {
            Ok(()) => {
                attempt = 0;
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Fill,
                    "trade_stream_disconnect",
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

async fn connect_and_stream(cfg: &Config, tx: &mpsc::Sender<TradeEvent>) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(cfg.broker_trade_ws.as_str()).await?;
    let (mut write, mut read) = ws.split();

    let auth = json!({
        "action": "auth",
        "key": cfg.broker_key.clone().unwrap_or_default(),
        "secret": cfg.broker_secret.clone().unwrap_or_default(),
    });
    write.send(Message::Text(auth.to_string())).await?;

    let listen = json!({ "action": "listen", "data": { "streams": ["trade_updates"] } });
    write.send(Message::Text(listen.to_string())).await?;
    json_log(Domain::Fill, "trade_stream_subscribed", obj(&[]));

    loop {
        let msg = match timeout(IDLE_TIMEOUT, read.next()).await {
            Ok(Some(msg)) => msg?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(anyhow!("trade stream idle past {:?}", IDLE_TIMEOUT)),
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(()),
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<StreamFrame>(&text) else {
            continue;
        };
        if frame.stream.as_deref() != Some("trade_updates") {
            continue;
        }
        let Some(data) = frame.data else { continue };
        let payload: TradeUpdatePayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Fill,
                    "trade_update_undecodable",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                continue;
            }
        };
        let Some(kind) = TradeEventKind::parse(&payload.event) else {
            // Replaced/pending events carry no state we act on.
            log(
                Level::Debug,
                Domain::Fill,
                "trade_update_ignored",
                obj(&[("event", v_str(&payload.event))]),
            );
            continue;
        };
        let order = match payload.order.into_snapshot() {
            Ok(order) => order,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Fill,
                    "trade_update_undecodable",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                continue;
            }
        };
        if tx.send(TradeEvent { kind, order }).await.is_err() {
            // Consumer is gone; shut the stream down with it.
            return Ok(());
        }
    }
}
