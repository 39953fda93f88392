//! State/broker consistency checks and cycle bootstrapping.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::time::Duration;

use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::runtime::Runtime;
use crate::state::CycleStatus;
use crate::storage::CyclePatch;

/// Two sweeps. First: cycles claiming an in-flight order whose broker
/// order is missing or terminal drop back to `watching`. Second: cycles
/// claiming a holding the broker does not have are marked `error` and
/// replaced with a fresh watching cycle.
pub async fn consistency_sweep(rt: Arc<Runtime>) -> Result<()> {
    sweep_order_references(&rt).await?;
    sweep_positions(&rt).await?;
    Ok(())
}

async fn sweep_order_references(rt: &Runtime) -> Result<()> {
    let lock_wait = Duration::from_secs(rt.cfg.lock_wait_secs);
    for status in [CycleStatus::Buying, CycleStatus::Selling] {
        let cycles = rt.store.list_cycles_in_status(status).context("list cycles")?;
        for cycle in &cycles {
            let Some(order_id) = cycle.latest_order_id.clone() else {
                continue;
            };
            let order = match rt.broker.get_order(&order_id).await {
                Ok(order) => order,
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Reconcile,
                        "order_lookup_failed",
                        obj(&[
                            ("order_id", v_str(&order_id)),
                            ("cycle_id", v_int(cycle.id)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    continue;
                }
            };
            let dangling = match &order {
                None => true,
                Some(order) => !order.status.is_active(),
            };
            if !dangling {
                continue;
            }
            let Some(_guard) = rt.locks.acquire(cycle.asset_id, lock_wait).await else {
                continue;
            };
            // The live path may have settled the order while we looked.
            let Some(current) = rt.store.get_cycle(cycle.id)? else { continue };
            if current.status != status || current.latest_order_id.as_deref() != Some(order_id.as_str()) {
                continue;
            }
            rt.store.update_cycle(
                cycle.id,
                &CyclePatch {
                    status: Some(CycleStatus::Watching),
                    latest_order: Some(None),
                    ..Default::default()
                },
            )?;
            log(
                Level::Warn,
                Domain::Reconcile,
                "dangling_order_reference_cleared",
                obj(&[
                    ("cycle_id", v_int(cycle.id)),
                    ("order_id", v_str(&order_id)),
                    ("was_status", v_str(status.as_str())),
                    (
                        "broker_status",
                        v_str(order.as_ref().map(|o| o.status.as_str()).unwrap_or("missing")),
                    ),
                ]),
            );
        }
    }
    Ok(())
}

async fn sweep_positions(rt: &Runtime) -> Result<()> {
    let lock_wait = Duration::from_secs(rt.cfg.lock_wait_secs);
    let cycles = rt.store.list_cycles_in_status(CycleStatus::Watching).context("list watching")?;
    for cycle in &cycles {
        if cycle.is_flat() {
            continue;
        }
        let Some(asset) = rt.store.get_asset_by_id(cycle.asset_id)? else {
            continue;
        };
        let position = match rt.broker.get_position(&asset.symbol).await {
            Ok(position) => position,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "position_lookup_failed",
                    obj(&[
                        ("symbol", v_str(&asset.symbol)),
                        ("cycle_id", v_int(cycle.id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                continue;
            }
        };
        let pos_qty = position.map(|p| p.qty).unwrap_or(Decimal::ZERO);
        if pos_qty > Decimal::ZERO {
            continue;
        }
        let Some(_guard) = rt.locks.acquire(cycle.asset_id, lock_wait).await else {
            continue;
        };
        let Some(current) = rt.store.get_cycle(cycle.id)? else { continue };
        if current.status != CycleStatus::Watching || current.is_flat() {
            continue;
        }
        let (errored, fresh) =
            rt.store.complete_and_rollover(cycle.id, CycleStatus::Error, None)?;
        log(
            Level::Error,
            Domain::Audit,
            "cycle_position_missing",
            obj(&[
                ("symbol", v_str(&asset.symbol)),
                ("cycle_id", v_int(errored.id)),
                ("next_cycle_id", v_int(fresh.id)),
                ("msg", v_str("cycle claims a holding the broker does not report")),
            ]),
        );
    }
    Ok(())
}

/// Every enabled asset gets a watching cycle if it has none. Runs at
/// startup and on its own ticker so newly added assets start trading.
pub async fn bootstrap_sweep(rt: Arc<Runtime>) -> Result<()> {
    let assets = rt.store.list_enabled_assets().context("list enabled assets")?;
    for asset in &assets {
        match rt.store.get_active_cycle(asset.id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                let cycle = rt.store.create_initial_cycle(asset.id)?;
                json_log(
                    Domain::Reconcile,
                    "cycle_bootstrapped",
                    obj(&[("symbol", v_str(&asset.symbol)), ("cycle_id", v_int(cycle.id))]),
                );
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "bootstrap_check_failed",
                    obj(&[("symbol", v_str(&asset.symbol)), ("error", v_str(&err.to_string()))]),
                );
            }
        }
    }
    Ok(())
}
