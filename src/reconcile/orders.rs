//! Order-age sweeps: stale limit buys, orphan orders, and stuck sells.
//!
//! These sweeps only request cancellation; the state change lands when
//! the broker's cancel event comes back through the trade-update stream,
//! so the live path stays the single writer for order outcomes.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};

use crate::adapter::types::Side;
use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::runtime::Runtime;
use crate::state::CycleStatus;

/// Cancel every broker-open limit buy past the stale threshold, and any
/// open order past the threshold that no active cycle references.
pub async fn stale_and_orphan_sweep(rt: Arc<Runtime>) -> Result<()> {
    let open_orders = rt.broker.get_open_orders().await.context("list open orders")?;
    if open_orders.is_empty() {
        return Ok(());
    }
    let active = rt.store.list_active_cycles().context("list active cycles")?;
    let referenced: HashSet<&str> =
        active.iter().filter_map(|c| c.latest_order_id.as_deref()).collect();
    let threshold = Utc::now() - Duration::minutes(rt.cfg.stale_order_threshold_mins);

    for order in &open_orders {
        if order.created_at > threshold {
            continue;
        }
        let orphan = !referenced.contains(order.id.as_str());
        let reason = if order.side == Side::Buy {
            "stale_buy"
        } else if orphan {
            "orphan"
        } else {
            // Referenced sells age out under the stuck-sell sweep's
            // tighter timeout instead.
            continue;
        };
        match rt.broker.cancel_order(&order.id).await {
            Ok(()) => {
                json_log(
                    Domain::Reconcile,
                    "order_cancel_requested",
                    obj(&[
                        ("order_id", v_str(&order.id)),
                        ("symbol", v_str(&order.symbol)),
                        ("reason", v_str(reason)),
                        ("side", v_str(order.side.as_str())),
                    ]),
                );
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "order_cancel_failed",
                    obj(&[
                        ("order_id", v_str(&order.id)),
                        ("reason", v_str(reason)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }
    Ok(())
}

/// Cancel sell orders that have sat in `selling` past the stuck timeout
/// and are still active at the broker.
pub async fn stuck_sell_sweep(rt: Arc<Runtime>) -> Result<()> {
    let cycles = rt.store.list_cycles_in_status(CycleStatus::Selling).context("list selling")?;
    let threshold = Utc::now() - Duration::seconds(rt.cfg.stuck_sell_timeout_secs);

    for cycle in &cycles {
        let (Some(order_id), Some(created_at)) =
            (cycle.latest_order_id.as_deref(), cycle.latest_order_created_at)
        else {
            continue;
        };
        if created_at > threshold {
            continue;
        }
        let order = match rt.broker.get_order(order_id).await {
            Ok(order) => order,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "stuck_sell_lookup_failed",
                    obj(&[
                        ("order_id", v_str(order_id)),
                        ("cycle_id", v_int(cycle.id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                continue;
            }
        };
        match order {
            Some(order) if order.status.is_active() => {
                match rt.broker.cancel_order(&order.id).await {
                    Ok(()) => {
                        json_log(
                            Domain::Reconcile,
                            "order_cancel_requested",
                            obj(&[
                                ("order_id", v_str(&order.id)),
                                ("cycle_id", v_int(cycle.id)),
                                ("reason", v_str("stuck_sell")),
                            ]),
                        );
                    }
                    Err(err) => {
                        log(
                            Level::Warn,
                            Domain::Reconcile,
                            "order_cancel_failed",
                            obj(&[
                                ("order_id", v_str(&order.id)),
                                ("cycle_id", v_int(cycle.id)),
                                ("reason", v_str("stuck_sell")),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            }
            // Missing or already terminal: the consistency sweep owns it.
            _ => {}
        }
    }
    Ok(())
}
