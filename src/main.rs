use std::future::Future;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use dcafx::adapter::alpaca::AlpacaBroker;
use dcafx::adapter::null::NullBroker;
use dcafx::adapter::Broker;
use dcafx::feed;
use dcafx::logging::{json_log, log, obj, v_bool, v_int, v_str, Domain, Level};
use dcafx::reconcile;
use dcafx::runtime::Runtime;
use dcafx::state::Config;
use dcafx::storage::CycleStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("dry_run", v_bool(cfg.dry_run)),
        ]),
    );

    let store = Arc::new(CycleStore::open(&cfg.sqlite_path).context("open cycle store")?);
    store.init().context("init cycle store schema")?;

    std::fs::write(&cfg.pid_file, process::id().to_string())
        .with_context(|| format!("write pid file {}", cfg.pid_file))?;

    let creds = match (&cfg.broker_key, &cfg.broker_secret) {
        (Some(key), Some(secret)) => Some((key.clone(), secret.clone())),
        _ => None,
    };
    // Stub broker unless credentials are present and dry-run is off.
    let broker: Arc<dyn Broker> = match (&creds, cfg.dry_run) {
        (Some((key, secret)), false) => {
            json_log(Domain::System, "broker", obj(&[("mode", v_str("live"))]));
            Arc::new(
                AlpacaBroker::new(&cfg, key.clone(), secret.clone())
                    .context("configure broker client")?,
            )
        }
        _ => {
            json_log(Domain::System, "broker", obj(&[("mode", v_str("stub"))]));
            Arc::new(NullBroker)
        }
    };

    let rt = Arc::new(Runtime::new(cfg.clone(), store.clone(), broker));

    // Make sure every enabled asset has a cycle before the first quote.
    reconcile::consistency::bootstrap_sweep(rt.clone())
        .await
        .context("startup bootstrap sweep")?;

    let symbols: Vec<String> =
        store.list_enabled_assets()?.into_iter().map(|a| a.symbol).collect();
    if symbols.is_empty() {
        log(
            Level::Warn,
            Domain::System,
            "no_enabled_assets",
            obj(&[("msg", v_str("nothing to trade until assets are added"))]),
        );
    }

    let (quote_tx, quote_rx) = mpsc::channel(cfg.quote_channel_capacity);
    let (trade_tx, trade_rx) = mpsc::channel(cfg.trade_channel_capacity);

    let dispatch_permits = symbols.len().max(8);
    let mut quote_dispatch = tokio::spawn(rt.clone().run_quote_dispatcher(quote_rx, dispatch_permits));
    let mut trade_dispatch = tokio::spawn(rt.clone().run_trade_dispatcher(trade_rx));

    let mut feed_handles: Vec<JoinHandle<()>> = Vec::new();
    if creds.is_some() && !symbols.is_empty() {
        feed_handles.push(supervise("quote_stream", {
            let cfg = cfg.clone();
            let symbols = symbols.clone();
            let tx = quote_tx.clone();
            move || feed::quotes::run_quote_stream(cfg.clone(), symbols.clone(), tx.clone())
        }));
        feed_handles.push(supervise("trade_update_stream", {
            let cfg = cfg.clone();
            let tx = trade_tx.clone();
            move || feed::trade_updates::run_trade_update_stream(cfg.clone(), tx.clone())
        }));
    } else {
        json_log(
            Domain::System,
            "streams_disabled",
            obj(&[("msg", v_str("no credentials or no assets; running reconcile-only"))]),
        );
    }
    // The feed tasks own their sender clones; dropping ours lets the
    // dispatchers drain to completion once the feeds stop.
    drop(quote_tx);
    drop(trade_tx);

    let worker_handles = reconcile::spawn_workers(&rt);

    wait_for_shutdown().await;
    json_log(Domain::System, "shutdown_begin", obj(&[]));

    // Stop accepting stream events, then drain in-flight per-asset work.
    for handle in &feed_handles {
        handle.abort();
    }
    let drained = timeout(Duration::from_secs(cfg.drain_deadline_secs), async {
        let _ = (&mut quote_dispatch).await;
        let _ = (&mut trade_dispatch).await;
    })
    .await;
    if drained.is_err() {
        log(
            Level::Warn,
            Domain::System,
            "drain_deadline_exceeded",
            obj(&[("deadline_secs", v_int(cfg.drain_deadline_secs as i64))]),
        );
        quote_dispatch.abort();
        trade_dispatch.abort();
    }
    for handle in &worker_handles {
        handle.abort();
    }

    let _ = std::fs::remove_file(&cfg.pid_file);
    json_log(Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}

/// Ties a child task's lifetime to its supervisor: aborting the
/// supervisor drops this guard, which aborts the child with it.
struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keep a long-lived task alive: a clean exit ends it, an error or panic
/// restarts it after a beat.
fn supervise<F, Fut>(name: &'static str, mut factory: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut child = AbortOnDrop(tokio::spawn(factory()));
            match (&mut child.0).await {
                Ok(Ok(())) => {
                    json_log(Domain::System, "task_exited", obj(&[("task", v_str(name))]));
                    return;
                }
                Ok(Err(err)) => {
                    log(
                        Level::Error,
                        Domain::System,
                        "task_failed",
                        obj(&[("task", v_str(name)), ("error", v_str(&format!("{:#}", err)))]),
                    );
                }
                Err(err) if err.is_panic() => {
                    log(
                        Level::Fatal,
                        Domain::System,
                        "task_panicked",
                        obj(&[("task", v_str(name))]),
                    );
                }
                // Cancellation means shutdown is in progress.
                Err(_) => return,
            }
            sleep(Duration::from_secs(1)).await;
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
