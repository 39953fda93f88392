//! Durable cycle state in SQLite.
//!
//! The store owns every Asset and Cycle row. Components load value copies
//! and commit through the named operations here; each operation is a
//! single transaction. A partial unique index keeps at most one
//! non-terminal cycle per asset even under concurrent rollover attempts.
//!
//! Decimals are persisted as TEXT (prices at 10 fractional digits,
//! quantities at 15) so no precision is lost crossing the storage
//! boundary. Timestamps are epoch seconds.

use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::state::{Asset, Cycle, CycleStatus, NewAsset, PRICE_SCALE, QTY_SCALE};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decimal field {0} is corrupt: {1}")]
    Decimal(&'static str, String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Whitelisted field patch for `update_cycle`. Plain fields use `Option`
/// (None = leave untouched). Nullable columns use `Option<Option<_>>` so a
/// patch can explicitly SET NULL. The broker order reference is patched as
/// a pair: id and created-at are only ever set or cleared together.
#[derive(Clone, Debug, Default)]
pub struct CyclePatch {
    pub status: Option<CycleStatus>,
    pub quantity: Option<Decimal>,
    pub average_purchase_price: Option<Decimal>,
    pub safety_orders: Option<u32>,
    pub latest_order: Option<Option<(String, DateTime<Utc>)>>,
    pub last_order_fill_price: Option<Option<Decimal>>,
    pub highest_trailing_price: Option<Option<Decimal>>,
}

pub struct CycleStore {
    conn: Mutex<Connection>,
}

impl CycleStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn init(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL,
                base_order_amount TEXT NOT NULL,
                safety_order_amount TEXT NOT NULL,
                max_safety_orders INTEGER NOT NULL,
                safety_order_deviation_percent TEXT NOT NULL,
                take_profit_percent TEXT NOT NULL,
                ttp_enabled INTEGER NOT NULL,
                ttp_deviation_percent TEXT NOT NULL,
                cooldown_period_seconds INTEGER NOT NULL,
                buy_order_price_deviation_percent TEXT NOT NULL,
                last_sell_price TEXT
            );
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY,
                asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                average_purchase_price TEXT NOT NULL,
                safety_orders INTEGER NOT NULL,
                latest_order_id TEXT,
                latest_order_created_at INTEGER,
                last_order_fill_price TEXT,
                highest_trailing_price TEXT,
                sell_price TEXT,
                completed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_cycle
                ON cycles(asset_id) WHERE status NOT IN ('complete','error');
            CREATE INDEX IF NOT EXISTS idx_cycles_latest_order
                ON cycles(latest_order_id);
            COMMIT;",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    pub fn insert_asset(&self, asset: &NewAsset) -> StoreResult<Asset> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO assets (symbol, enabled, base_order_amount, safety_order_amount,
                max_safety_orders, safety_order_deviation_percent, take_profit_percent,
                ttp_enabled, ttp_deviation_percent, cooldown_period_seconds,
                buy_order_price_deviation_percent, last_sell_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
            params![
                asset.symbol,
                asset.enabled as i64,
                price_text(asset.base_order_amount),
                price_text(asset.safety_order_amount),
                asset.max_safety_orders as i64,
                price_text(asset.safety_order_deviation_percent),
                price_text(asset.take_profit_percent),
                asset.ttp_enabled as i64,
                price_text(asset.ttp_deviation_percent),
                asset.cooldown_period_seconds,
                price_text(asset.buy_order_price_deviation_percent),
            ],
        )?;
        let id = conn.last_insert_rowid();
        query_asset(&conn, "id = ?1", params![id])?
            .ok_or_else(|| StoreError::NotFound(format!("asset {}", id)))
    }

    pub fn get_asset(&self, symbol: &str) -> StoreResult<Option<Asset>> {
        let conn = self.lock();
        query_asset(&conn, "symbol = ?1", params![symbol])
    }

    pub fn get_asset_by_id(&self, id: i64) -> StoreResult<Option<Asset>> {
        let conn = self.lock();
        query_asset(&conn, "id = ?1", params![id])
    }

    pub fn list_enabled_assets(&self) -> StoreResult<Vec<Asset>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE enabled = 1 ORDER BY id", ASSET_SELECT))?;
        let rows = stmt.query_map([], row_to_asset)?;
        collect_rows(rows)
    }

    pub fn set_asset_last_sell_price(&self, asset_id: i64, price: Decimal) -> StoreResult<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE assets SET last_sell_price = ?1 WHERE id = ?2",
            params![price_text(price), asset_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("asset {}", asset_id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    /// Insert a `watching`, zero-quantity cycle unless the asset already
    /// has an active one. Returns the active cycle either way.
    pub fn create_initial_cycle(&self, asset_id: i64) -> StoreResult<Cycle> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if let Some(existing) = query_active_cycle(&tx, asset_id)? {
            tx.commit()?;
            return Ok(existing);
        }
        let cycle = match insert_watching_cycle(&tx, asset_id) {
            Ok(cycle) => cycle,
            // A concurrent creator winning the unique index race is success.
            Err(StoreError::Sqlite(e)) if is_unique_violation(&e) => {
                query_active_cycle(&tx, asset_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("active cycle for asset {}", asset_id)))?
            }
            Err(e) => return Err(e),
        };
        tx.commit()?;
        Ok(cycle)
    }

    pub fn get_cycle(&self, id: i64) -> StoreResult<Option<Cycle>> {
        let conn = self.lock();
        query_cycle(&conn, "id = ?1", params![id])
    }

    /// The unique non-terminal cycle for the asset, if any.
    pub fn get_active_cycle(&self, asset_id: i64) -> StoreResult<Option<Cycle>> {
        let conn = self.lock();
        query_cycle(
            &conn,
            "asset_id = ?1 AND status NOT IN ('complete','error')",
            params![asset_id],
        )
    }

    /// The most recently completed terminal cycle for the asset, if any.
    pub fn get_latest_terminal_cycle(&self, asset_id: i64) -> StoreResult<Option<Cycle>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE asset_id = ?1 AND status IN ('complete','error')
             ORDER BY completed_at DESC, id DESC LIMIT 1",
            CYCLE_SELECT
        ))?;
        stmt.query_row(params![asset_id], row_to_cycle).optional().map_err(Into::into)
    }

    /// Locate the active cycle referencing a broker order id. Terminal
    /// cycles are excluded so replayed events for old orders stay orphans.
    pub fn find_cycle_by_order_id(&self, order_id: &str) -> StoreResult<Option<Cycle>> {
        let conn = self.lock();
        query_cycle(
            &conn,
            "latest_order_id = ?1 AND status NOT IN ('complete','error')",
            params![order_id],
        )
    }

    pub fn list_cycles_in_status(&self, status: CycleStatus) -> StoreResult<Vec<Cycle>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("{} WHERE status = ?1 ORDER BY id", CYCLE_SELECT))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_cycle)?;
        collect_rows(rows)
    }

    pub fn list_active_cycles(&self) -> StoreResult<Vec<Cycle>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status NOT IN ('complete','error') ORDER BY id",
            CYCLE_SELECT
        ))?;
        let rows = stmt.query_map([], row_to_cycle)?;
        collect_rows(rows)
    }

    /// Apply a whitelisted patch to a non-terminal cycle, bump
    /// `updated_at`, and re-check the cycle invariants before commit.
    pub fn update_cycle(&self, id: i64, patch: &CyclePatch) -> StoreResult<Cycle> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut cycle = query_cycle_tx(&tx, id)?
            .ok_or_else(|| StoreError::NotFound(format!("cycle {}", id)))?;
        if cycle.status.is_terminal() {
            return Err(StoreError::Invariant(format!(
                "cycle {} is terminal and cannot be patched",
                id
            )));
        }
        if let Some(status) = patch.status {
            if status.is_terminal() {
                return Err(StoreError::Invariant(
                    "terminal status is only reachable through complete_and_rollover".to_string(),
                ));
            }
            cycle.status = status;
        }
        if let Some(q) = patch.quantity {
            cycle.quantity = q.round_dp(QTY_SCALE).normalize();
        }
        if let Some(avg) = patch.average_purchase_price {
            cycle.average_purchase_price = avg.round_dp(PRICE_SCALE).normalize();
        }
        if let Some(n) = patch.safety_orders {
            cycle.safety_orders = n;
        }
        if let Some(ref latest) = patch.latest_order {
            match latest {
                Some((order_id, created_at)) => {
                    cycle.latest_order_id = Some(order_id.clone());
                    cycle.latest_order_created_at = Some(*created_at);
                }
                None => {
                    cycle.latest_order_id = None;
                    cycle.latest_order_created_at = None;
                }
            }
        }
        if let Some(ref p) = patch.last_order_fill_price {
            cycle.last_order_fill_price = p.map(|d| d.round_dp(PRICE_SCALE).normalize());
        }
        if let Some(ref p) = patch.highest_trailing_price {
            cycle.highest_trailing_price = p.map(|d| d.round_dp(PRICE_SCALE).normalize());
        }
        cycle.updated_at = Utc::now();

        check_cycle_invariants(&tx, &cycle)?;

        tx.execute(
            "UPDATE cycles SET status = ?1, quantity = ?2, average_purchase_price = ?3,
                safety_orders = ?4, latest_order_id = ?5, latest_order_created_at = ?6,
                last_order_fill_price = ?7, highest_trailing_price = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                cycle.status.as_str(),
                qty_text(cycle.quantity),
                price_text(cycle.average_purchase_price),
                cycle.safety_orders as i64,
                cycle.latest_order_id,
                cycle.latest_order_created_at.map(|t| t.timestamp()),
                cycle.last_order_fill_price.map(price_text),
                cycle.highest_trailing_price.map(price_text),
                cycle.updated_at.timestamp(),
                cycle.id,
            ],
        )?;
        tx.commit()?;
        Ok(cycle)
    }

    /// Atomically mark the old cycle terminal and insert a fresh
    /// `watching` cycle for the same asset.
    ///
    /// Idempotent: if the old cycle is already terminal the call returns
    /// the recorded terminal row and the asset's active cycle (creating
    /// one only if missing), so a duplicate fill event cannot spawn a
    /// second watching cycle.
    pub fn complete_and_rollover(
        &self,
        old_cycle_id: i64,
        outcome: CycleStatus,
        sell_price: Option<Decimal>,
    ) -> StoreResult<(Cycle, Cycle)> {
        if !outcome.is_terminal() {
            return Err(StoreError::Invariant(format!(
                "rollover outcome must be terminal, got {}",
                outcome.as_str()
            )));
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let old = query_cycle_tx(&tx, old_cycle_id)?
            .ok_or_else(|| StoreError::NotFound(format!("cycle {}", old_cycle_id)))?;

        if old.status.is_terminal() {
            let active = match query_active_cycle(&tx, old.asset_id)? {
                Some(active) => active,
                None => insert_watching_cycle(&tx, old.asset_id)?,
            };
            tx.commit()?;
            return Ok((old, active));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE cycles SET status = ?1, sell_price = ?2, completed_at = ?3,
                latest_order_id = NULL, latest_order_created_at = NULL, updated_at = ?3
             WHERE id = ?4",
            params![outcome.as_str(), sell_price.map(price_text), now.timestamp(), old.id],
        )?;
        let fresh = match insert_watching_cycle(&tx, old.asset_id) {
            Ok(cycle) => cycle,
            Err(StoreError::Sqlite(e)) if is_unique_violation(&e) => {
                // Another task completed the rollover between our update
                // and insert; their watching cycle wins.
                query_active_cycle(&tx, old.asset_id)?.ok_or_else(|| {
                    StoreError::Invariant(format!(
                        "asset {} has no active cycle after rollover race",
                        old.asset_id
                    ))
                })?
            }
            Err(e) => return Err(e),
        };
        let closed = query_cycle_tx(&tx, old.id)?
            .ok_or_else(|| StoreError::NotFound(format!("cycle {}", old.id)))?;
        tx.commit()?;
        Ok((closed, fresh))
    }
}

// ----------------------------------------------------------------------
// Row mapping and invariant checks
// ----------------------------------------------------------------------

const ASSET_SELECT: &str = "SELECT id, symbol, enabled, base_order_amount, safety_order_amount,
    max_safety_orders, safety_order_deviation_percent, take_profit_percent, ttp_enabled,
    ttp_deviation_percent, cooldown_period_seconds, buy_order_price_deviation_percent,
    last_sell_price FROM assets";

const CYCLE_SELECT: &str = "SELECT id, asset_id, status, quantity, average_purchase_price,
    safety_orders, latest_order_id, latest_order_created_at, last_order_fill_price,
    highest_trailing_price, sell_price, completed_at, created_at, updated_at FROM cycles";

fn price_text(d: Decimal) -> String {
    d.round_dp(PRICE_SCALE).normalize().to_string()
}

fn qty_text(d: Decimal) -> String {
    d.round_dp(QTY_SCALE).normalize().to_string()
}

fn parse_dec(field: &'static str, text: String) -> StoreResult<Decimal> {
    Decimal::from_str(&text).map_err(|e| StoreError::Decimal(field, e.to_string()))
}

fn parse_opt_dec(field: &'static str, text: Option<String>) -> StoreResult<Option<Decimal>> {
    text.map(|t| parse_dec(field, t)).transpose()
}

fn epoch_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<Asset> {
    // Decimal parse failures surface as FromSql conversion errors so the
    // rusqlite mapping signature stays usable with query_map.
    let dec = |idx: usize| -> rusqlite::Result<Decimal> {
        let text: String = row.get(idx)?;
        Decimal::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    };
    let last_sell: Option<String> = row.get(12)?;
    Ok(Asset {
        id: row.get(0)?,
        symbol: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        base_order_amount: dec(3)?,
        safety_order_amount: dec(4)?,
        max_safety_orders: row.get::<_, i64>(5)? as u32,
        safety_order_deviation_percent: dec(6)?,
        take_profit_percent: dec(7)?,
        ttp_enabled: row.get::<_, i64>(8)? != 0,
        ttp_deviation_percent: dec(9)?,
        cooldown_period_seconds: row.get(10)?,
        buy_order_price_deviation_percent: dec(11)?,
        last_sell_price: last_sell
            .map(|t| {
                Decimal::from_str(&t).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        12,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })
            .transpose()?,
    })
}

fn row_to_cycle(row: &Row<'_>) -> rusqlite::Result<Cycle> {
    let dec = |idx: usize| -> rusqlite::Result<Decimal> {
        let text: String = row.get(idx)?;
        Decimal::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    };
    let opt_dec = |idx: usize| -> rusqlite::Result<Option<Decimal>> {
        let text: Option<String> = row.get(idx)?;
        text.map(|t| {
            Decimal::from_str(&t).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()
    };
    let status_text: String = row.get(2)?;
    let status = CycleStatus::parse(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown cycle status {:?}", status_text).into(),
        )
    })?;
    Ok(Cycle {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        status,
        quantity: dec(3)?,
        average_purchase_price: dec(4)?,
        safety_orders: row.get::<_, i64>(5)? as u32,
        latest_order_id: row.get(6)?,
        latest_order_created_at: row.get::<_, Option<i64>>(7)?.map(epoch_to_utc),
        last_order_fill_price: opt_dec(8)?,
        highest_trailing_price: opt_dec(9)?,
        sell_price: opt_dec(10)?,
        completed_at: row.get::<_, Option<i64>>(11)?.map(epoch_to_utc),
        created_at: epoch_to_utc(row.get(12)?),
        updated_at: epoch_to_utc(row.get(13)?),
    })
}

fn query_asset(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Option<Asset>> {
    let mut stmt = conn.prepare(&format!("{} WHERE {}", ASSET_SELECT, where_clause))?;
    stmt.query_row(params, row_to_asset).optional().map_err(Into::into)
}

fn query_cycle(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Option<Cycle>> {
    let mut stmt = conn.prepare(&format!("{} WHERE {}", CYCLE_SELECT, where_clause))?;
    stmt.query_row(params, row_to_cycle).optional().map_err(Into::into)
}

fn query_cycle_tx(tx: &Transaction<'_>, id: i64) -> StoreResult<Option<Cycle>> {
    let mut stmt = tx.prepare(&format!("{} WHERE id = ?1", CYCLE_SELECT))?;
    stmt.query_row(params![id], row_to_cycle).optional().map_err(Into::into)
}

fn query_active_cycle(tx: &Transaction<'_>, asset_id: i64) -> StoreResult<Option<Cycle>> {
    let mut stmt = tx.prepare(&format!(
        "{} WHERE asset_id = ?1 AND status NOT IN ('complete','error')",
        CYCLE_SELECT
    ))?;
    stmt.query_row(params![asset_id], row_to_cycle).optional().map_err(Into::into)
}

fn insert_watching_cycle(tx: &Transaction<'_>, asset_id: i64) -> StoreResult<Cycle> {
    let now = Utc::now().timestamp();
    tx.execute(
        "INSERT INTO cycles (asset_id, status, quantity, average_purchase_price, safety_orders,
            latest_order_id, latest_order_created_at, last_order_fill_price,
            highest_trailing_price, sell_price, completed_at, created_at, updated_at)
         VALUES (?1, 'watching', '0', '0', 0, NULL, NULL, NULL, NULL, NULL, NULL, ?2, ?2)",
        params![asset_id, now],
    )?;
    let id = tx.last_insert_rowid();
    query_cycle_tx(tx, id)?.ok_or_else(|| StoreError::NotFound(format!("cycle {}", id)))
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn check_cycle_invariants(tx: &Transaction<'_>, cycle: &Cycle) -> StoreResult<()> {
    let asset = {
        let mut stmt = tx.prepare(&format!("{} WHERE id = ?1", ASSET_SELECT))?;
        stmt.query_row(params![cycle.asset_id], row_to_asset)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("asset {}", cycle.asset_id)))?
    };

    if cycle.safety_orders > asset.max_safety_orders {
        return Err(StoreError::Invariant(format!(
            "cycle {}: safety_orders {} exceeds max {}",
            cycle.id, cycle.safety_orders, asset.max_safety_orders
        )));
    }
    if cycle.quantity < Decimal::ZERO {
        return Err(StoreError::Invariant(format!("cycle {}: negative quantity", cycle.id)));
    }
    if cycle.quantity.is_zero()
        && (!cycle.average_purchase_price.is_zero()
            || cycle.safety_orders != 0
            || cycle.last_order_fill_price.is_some())
    {
        return Err(StoreError::Invariant(format!(
            "cycle {}: zero quantity with residual purchase state",
            cycle.id
        )));
    }
    match cycle.status {
        CycleStatus::Buying | CycleStatus::Selling => {
            if cycle.latest_order_id.is_none() || cycle.latest_order_created_at.is_none() {
                return Err(StoreError::Invariant(format!(
                    "cycle {}: status {} without an order reference",
                    cycle.id,
                    cycle.status.as_str()
                )));
            }
        }
        CycleStatus::Watching | CycleStatus::Trailing => {
            if cycle.latest_order_id.is_some() {
                return Err(StoreError::Invariant(format!(
                    "cycle {}: status {} with a dangling order reference",
                    cycle.id,
                    cycle.status.as_str()
                )));
            }
        }
        CycleStatus::Complete | CycleStatus::Error => {}
    }
    if cycle.status == CycleStatus::Trailing {
        if !asset.ttp_enabled {
            return Err(StoreError::Invariant(format!(
                "cycle {}: trailing but asset {} has trailing disabled",
                cycle.id, asset.symbol
            )));
        }
        let hundred = Decimal::ONE_HUNDRED;
        let floor = cycle.average_purchase_price
            * (Decimal::ONE + asset.take_profit_percent / hundred);
        match cycle.highest_trailing_price {
            Some(peak) if peak >= floor => {}
            Some(peak) => {
                return Err(StoreError::Invariant(format!(
                    "cycle {}: trailing peak {} below take-profit floor {}",
                    cycle.id, peak, floor
                )));
            }
            None => {
                return Err(StoreError::Invariant(format!(
                    "cycle {}: trailing without a recorded peak",
                    cycle.id
                )));
            }
        }
    }
    Ok(())
}
