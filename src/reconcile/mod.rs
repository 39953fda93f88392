//! Periodic reconciliation: the healing path that converges engine state
//! with broker truth.
//!
//! Each worker runs on its own ticker. An iteration gets a deadline equal
//! to the worker period; overruns are canceled and logged. Per-item
//! failures inside a sweep are logged and skipped so one bad asset cannot
//! starve the rest.

pub mod consistency;
pub mod orders;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::runtime::Runtime;

pub fn spawn_workers(rt: &Arc<Runtime>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_worker(
            "stale_and_orphan_orders",
            rt.cfg.stale_sweep_secs,
            rt.clone(),
            orders::stale_and_orphan_sweep,
        )),
        tokio::spawn(run_worker(
            "stuck_sells",
            rt.cfg.stale_sweep_secs,
            rt.clone(),
            orders::stuck_sell_sweep,
        )),
        tokio::spawn(run_worker(
            "consistency",
            rt.cfg.consistency_sweep_secs,
            rt.clone(),
            consistency::consistency_sweep,
        )),
        tokio::spawn(run_worker(
            "bootstrap",
            rt.cfg.bootstrap_sweep_secs,
            rt.clone(),
            consistency::bootstrap_sweep,
        )),
    ]
}

async fn run_worker<F, Fut>(name: &'static str, period_secs: u64, rt: Arc<Runtime>, iteration: F)
where
    F: Fn(Arc<Runtime>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let period = Duration::from_secs(period_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match timeout(period, iteration(rt.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "worker_iteration_failed",
                    obj(&[("worker", v_str(name)), ("error", v_str(&format!("{:#}", err)))]),
                );
            }
            Err(_) => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "worker_overrun",
                    obj(&[
                        ("worker", v_str(name)),
                        ("period_secs", v_int(period.as_secs() as i64)),
                    ]),
                );
            }
        }
    }
}
