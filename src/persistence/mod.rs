//! SQLite persistence for scheduling and reconciliation state.
//!
//! The store is the only shared mutable state between the scheduler, the
//! bracket manager and the reconciliation engine. Every status change is a
//! conditional update (`... WHERE status = expected`), so when two writers
//! race for the same transition exactly one wins and the other is a no-op.
//!
//! Tables:
//! - `strategy_executions`: one row per scheduling run
//! - `scheduled_orders`: one row per exchange order intent
//! - `bracket_links`: entry ↔ take-profit ↔ stop-loss grouping
//! - `strategy_leases`: per-strategy trigger gate with TTL
//! - `engine_events`: structured audit journal

use crate::engine::{
    BracketLink, BracketSpec, BracketStatus, ExecutionStatus, NewScheduledOrder, OrderLeg,
    OrderStatus, ScheduledOrder, StrategyExecution,
};
use crate::exchange::{OrderKind, OrderSide};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const ORDER_COLUMNS: &str = r#"
    id, client_order_id, exchange_order_id, execution_id, strategy_id, sequence, leg,
    symbol, side, kind, requested_qty, adjusted_qty, executed_qty, price, trigger_price,
    avg_fill_price, leverage, intended_margin, effective_margin, reduce_only, tp_percent,
    sl_percent, parent_order_id, status, last_error, created_at, updated_at
"#;

const BRACKET_COLUMNS: &str = r#"
    id, execution_id, symbol, entry_client_id, tp_client_id, sl_client_id, status,
    realized_pnl, created_at, updated_at
"#;

const EXECUTION_COLUMNS: &str = r#"
    id, strategy_id, status, orders_total, orders_filled, orders_rejected, decision_failures,
    realized_pnl, error, started_at, finished_at
"#;

/// Fields written alongside a conditional order status transition.
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    pub exchange_order_id: Option<String>,
    pub executed_qty: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub last_error: Option<String>,
}

/// Journaled event row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub symbol: Option<String>,
    pub payload: String,
}

/// SQLite-backed order store.
pub struct OrderStore {
    conn: Mutex<Connection>,
}

impl OrderStore {
    /// Open (or create) the store, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Order store initialized at {:?}", path);
        Ok(store)
    }

    /// Private in-memory store (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("order store connection mutex poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS strategy_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                status TEXT NOT NULL,
                orders_total INTEGER NOT NULL DEFAULT 0,
                orders_filled INTEGER NOT NULL DEFAULT 0,
                orders_rejected INTEGER NOT NULL DEFAULT 0,
                decision_failures INTEGER NOT NULL DEFAULT 0,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_exec_strategy ON strategy_executions(strategy_id);

            CREATE TABLE IF NOT EXISTS scheduled_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT,
                execution_id INTEGER NOT NULL,
                strategy_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                leg TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                requested_qty TEXT NOT NULL,
                adjusted_qty TEXT,
                executed_qty TEXT NOT NULL DEFAULT '0',
                price TEXT,
                trigger_price TEXT,
                avg_fill_price TEXT,
                leverage INTEGER NOT NULL,
                intended_margin TEXT,
                effective_margin TEXT,
                reduce_only INTEGER NOT NULL,
                tp_percent TEXT,
                sl_percent TEXT,
                parent_order_id INTEGER,
                status TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON scheduled_orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_execution ON scheduled_orders(execution_id);

            CREATE TABLE IF NOT EXISTS bracket_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                entry_client_id TEXT NOT NULL UNIQUE,
                tp_client_id TEXT NOT NULL,
                sl_client_id TEXT NOT NULL,
                status TEXT NOT NULL,
                realized_pnl TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            -- At most one bracket per symbol with a possibly live leg
            DROP INDEX IF EXISTS idx_bracket_open_symbol;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bracket_live_symbol
                ON bracket_links(symbol) WHERE status IN ('created', 'active', 'orphaned');
            CREATE INDEX IF NOT EXISTS idx_bracket_status ON bracket_links(status);

            CREATE TABLE IF NOT EXISTS strategy_leases (
                strategy_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                execution_id INTEGER,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS engine_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON engine_events(kind);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ==================== Strategy executions ====================

    /// Create a `pending` execution row for a strategy.
    pub fn create_execution(&self, strategy_id: &str) -> Result<StrategyExecution> {
        let id = {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO strategy_executions (strategy_id, status, started_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![
                    strategy_id,
                    ExecutionStatus::Pending.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_execution(id)?
            .ok_or_else(|| anyhow!("execution {id} vanished after insert"))
    }

    /// Move an execution from `expected` to `next`. Returns false if the row
    /// was no longer in `expected`.
    pub fn transition_execution(
        &self,
        id: i64,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let finished_at = matches!(next, ExecutionStatus::Completed | ExecutionStatus::Failed)
            .then(|| Utc::now().to_rfc3339());
        let changed = self.conn()?.execute(
            r#"
            UPDATE strategy_executions
            SET status = ?1, error = COALESCE(?2, error), finished_at = COALESCE(?3, finished_at)
            WHERE id = ?4 AND status = ?5
            "#,
            params![next.as_str(), error, finished_at, id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Count a decision that failed before producing an order row.
    pub fn record_decision_failure(&self, execution_id: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE strategy_executions SET decision_failures = decision_failures + 1 WHERE id = ?1",
            params![execution_id],
        )?;
        Ok(())
    }

    /// Recompute order counters from the execution's order rows.
    pub fn refresh_execution_counters(&self, execution_id: i64) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE strategy_executions SET
                orders_total = (SELECT COUNT(*) FROM scheduled_orders WHERE execution_id = ?1),
                orders_filled = (SELECT COUNT(*) FROM scheduled_orders
                                 WHERE execution_id = ?1 AND status = 'filled'),
                orders_rejected = (SELECT COUNT(*) FROM scheduled_orders
                                   WHERE execution_id = ?1 AND status = 'rejected')
            WHERE id = ?1
            "#,
            params![execution_id],
        )?;
        Ok(())
    }

    /// Add realized PnL from a closed bracket.
    pub fn add_realized_pnl(&self, execution_id: i64, pnl: Decimal) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let current: String = tx.query_row(
            "SELECT realized_pnl FROM strategy_executions WHERE id = ?1",
            params![execution_id],
            |row| row.get(0),
        )?;
        let total = Decimal::from_str(&current)
            .with_context(|| format!("Corrupt realized_pnl {current:?} on execution {execution_id}"))?
            + pnl;
        tx.execute(
            "UPDATE strategy_executions SET realized_pnl = ?1 WHERE id = ?2",
            params![total.to_string(), execution_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<StrategyExecution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM strategy_executions WHERE id = ?1");
        Ok(self
            .conn()?
            .query_row(&sql, params![id], execution_from_row)
            .optional()?)
    }

    pub fn recent_executions(&self, limit: usize) -> Result<Vec<StrategyExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM strategy_executions ORDER BY id DESC LIMIT ?1"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ==================== Scheduled orders ====================

    /// Insert an order, or return the existing row with the same client
    /// order id. The flag is true when a new row was created.
    pub fn insert_order(&self, order: &NewScheduledOrder) -> Result<(ScheduledOrder, bool)> {
        let now = Utc::now().to_rfc3339();
        let created = self.conn()?.execute(
            r#"
            INSERT INTO scheduled_orders (
                client_order_id, execution_id, strategy_id, sequence, leg, symbol, side, kind,
                requested_qty, price, trigger_price, leverage, intended_margin, reduce_only,
                tp_percent, sl_percent, parent_order_id, status, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19)
            ON CONFLICT(client_order_id) DO NOTHING
            "#,
            params![
                order.client_order_id,
                order.execution_id,
                order.strategy_id,
                order.sequence as i64,
                order.leg.suffix(),
                order.symbol,
                order.side.as_str(),
                order.kind.as_str(),
                order.requested_qty.to_string(),
                order.price.map(|p| p.to_string()),
                order.trigger_price.map(|p| p.to_string()),
                order.leverage,
                order.intended_margin.map(|m| m.to_string()),
                order.reduce_only,
                order.bracket.map(|b| b.tp_percent.to_string()),
                order.bracket.map(|b| b.sl_percent.to_string()),
                order.parent_order_id,
                OrderStatus::Pending.as_str(),
                now,
            ],
        )? == 1;

        let stored = self
            .get_order_by_client_id(&order.client_order_id)?
            .ok_or_else(|| anyhow!("order {} missing after insert", order.client_order_id))?;

        if created {
            debug!(
                client_order_id = %stored.client_order_id,
                symbol = %stored.symbol,
                leg = ?stored.leg,
                "Scheduled order created"
            );
        }
        Ok((stored, created))
    }

    pub fn get_order(&self, id: i64) -> Result<Option<ScheduledOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM scheduled_orders WHERE id = ?1");
        Ok(self
            .conn()?
            .query_row(&sql, params![id], order_from_row)
            .optional()?)
    }

    pub fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<ScheduledOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM scheduled_orders WHERE client_order_id = ?1");
        Ok(self
            .conn()?
            .query_row(&sql, params![client_order_id], order_from_row)
            .optional()?)
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<ScheduledOrder>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM scheduled_orders WHERE status = ?1 ORDER BY id"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str()], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All order rows, oldest first (status views and tests).
    pub fn all_orders(&self) -> Result<Vec<ScheduledOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM scheduled_orders ORDER BY id");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Conditionally move an order from `expected` to `next`.
    ///
    /// Returns true only for the single writer that performed the transition.
    pub fn transition_order(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
        update: &OrderUpdate,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE scheduled_orders SET
                status = ?1,
                exchange_order_id = COALESCE(?2, exchange_order_id),
                executed_qty = COALESCE(?3, executed_qty),
                avg_fill_price = COALESCE(?4, avg_fill_price),
                last_error = COALESCE(?5, last_error),
                updated_at = ?6
            WHERE id = ?7 AND status = ?8
            "#,
            params![
                next.as_str(),
                update.exchange_order_id,
                update.executed_qty.map(|q| q.to_string()),
                update.avg_fill_price.map(|p| p.to_string()),
                update.last_error,
                Utc::now().to_rfc3339(),
                id,
                expected.as_str(),
            ],
        )?;

        if changed == 1 {
            debug!(order_id = id, from = %expected, to = %next, "Order transitioned");
        }
        Ok(changed == 1)
    }

    /// Persist filter-normalized quantity and the resulting effective margin.
    /// Only applies while the order is still pending.
    pub fn record_normalization(
        &self,
        id: i64,
        adjusted_qty: Decimal,
        effective_margin: Option<Decimal>,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE scheduled_orders
            SET adjusted_qty = ?1, effective_margin = ?2, updated_at = ?3
            WHERE id = ?4 AND status = 'pending'
            "#,
            params![
                adjusted_qty.to_string(),
                effective_margin.map(|m| m.to_string()),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record an error message on an order without changing its status.
    pub fn note_order_error(&self, id: i64, error: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE scheduled_orders SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    // ==================== Bracket links ====================

    /// Create a bracket for an entry order.
    ///
    /// Idempotent per entry. Returns `None` when another open bracket already
    /// exists for the symbol.
    pub fn insert_bracket(
        &self,
        execution_id: i64,
        symbol: &str,
        entry_client_id: &str,
        tp_client_id: &str,
        sl_client_id: &str,
    ) -> Result<Option<BracketLink>> {
        if let Some(existing) = self.bracket_by_entry(entry_client_id)? {
            return Ok(Some(existing));
        }

        let now = Utc::now().to_rfc3339();
        let insert = self.conn()?.execute(
            r#"
            INSERT INTO bracket_links (execution_id, symbol, entry_client_id, tp_client_id,
                                       sl_client_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                execution_id,
                symbol,
                entry_client_id,
                tp_client_id,
                sl_client_id,
                BracketStatus::Created.as_str(),
                now
            ],
        );

        match insert {
            Ok(_) => self.bracket_by_entry(entry_client_id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // Lost a race for the same entry, or the symbol already has an open bracket
                if let Some(existing) = self.bracket_by_entry(entry_client_id)? {
                    return Ok(Some(existing));
                }
                warn!(%symbol, entry = %entry_client_id, "Open bracket already exists for symbol");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conditionally move a bracket from any of `expected` to `next`.
    pub fn transition_bracket(
        &self,
        id: i64,
        expected: &[BracketStatus],
        next: BracketStatus,
        realized_pnl: Option<Decimal>,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let allowed = expected
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE bracket_links
            SET status = ?1, realized_pnl = COALESCE(?2, realized_pnl), updated_at = ?3
            WHERE id = ?4 AND status IN ({allowed})
            "#
        );
        let changed = self.conn()?.execute(
            &sql,
            params![
                next.as_str(),
                realized_pnl.map(|p| p.to_string()),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;

        if changed == 1 {
            debug!(bracket_id = id, to = %next, "Bracket transitioned");
        }
        Ok(changed == 1)
    }

    pub fn get_bracket(&self, id: i64) -> Result<Option<BracketLink>> {
        let sql = format!("SELECT {BRACKET_COLUMNS} FROM bracket_links WHERE id = ?1");
        Ok(self
            .conn()?
            .query_row(&sql, params![id], bracket_from_row)
            .optional()?)
    }

    pub fn bracket_by_entry(&self, entry_client_id: &str) -> Result<Option<BracketLink>> {
        let sql = format!("SELECT {BRACKET_COLUMNS} FROM bracket_links WHERE entry_client_id = ?1");
        Ok(self
            .conn()?
            .query_row(&sql, params![entry_client_id], bracket_from_row)
            .optional()?)
    }

    /// Bracket that owns a TP or SL leg.
    pub fn bracket_for_leg(&self, leg_client_id: &str) -> Result<Option<BracketLink>> {
        let sql = format!(
            "SELECT {BRACKET_COLUMNS} FROM bracket_links WHERE tp_client_id = ?1 OR sl_client_id = ?1"
        );
        Ok(self
            .conn()?
            .query_row(&sql, params![leg_client_id], bracket_from_row)
            .optional()?)
    }

    pub fn brackets_with_status(&self, status: BracketStatus) -> Result<Vec<BracketLink>> {
        let sql = format!(
            "SELECT {BRACKET_COLUMNS} FROM bracket_links WHERE status = ?1 ORDER BY id"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str()], bracket_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The `created` or `active` bracket for a symbol, if any.
    pub fn open_bracket_for_symbol(&self, symbol: &str) -> Result<Option<BracketLink>> {
        let sql = format!(
            "SELECT {BRACKET_COLUMNS} FROM bracket_links WHERE symbol = ?1 AND status IN ('created', 'active', 'orphaned')"
        );
        Ok(self
            .conn()?
            .query_row(&sql, params![symbol], bracket_from_row)
            .optional()?)
    }

    // ==================== Strategy leases ====================

    /// Try to take the trigger lease for a strategy.
    ///
    /// A single conditional upsert: succeeds if no lease exists, the existing
    /// lease has expired, or `holder` already owns it.
    pub fn try_acquire_lease(&self, strategy_id: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;
        let changed = self.conn()?.execute(
            r#"
            INSERT INTO strategy_leases (strategy_id, holder, execution_id, expires_at_ms)
            VALUES (?1, ?2, NULL, ?3)
            ON CONFLICT(strategy_id) DO UPDATE SET
                holder = excluded.holder,
                execution_id = NULL,
                expires_at_ms = excluded.expires_at_ms
            WHERE strategy_leases.expires_at_ms <= ?4 OR strategy_leases.holder = excluded.holder
            "#,
            params![strategy_id, holder, expires_at_ms, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Tie the held lease to the execution it guards.
    pub fn attach_lease_execution(
        &self,
        strategy_id: &str,
        holder: &str,
        execution_id: i64,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE strategy_leases SET execution_id = ?1 WHERE strategy_id = ?2 AND holder = ?3",
            params![execution_id, strategy_id, holder],
        )?;
        Ok(changed == 1)
    }

    /// Release a lease. Only the holder can release it.
    pub fn release_lease(&self, strategy_id: &str, holder: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "DELETE FROM strategy_leases WHERE strategy_id = ?1 AND holder = ?2",
            params![strategy_id, holder],
        )?;
        Ok(changed == 1)
    }

    /// Current lease holder and expiry (ms since epoch), if any.
    pub fn lease_holder(&self, strategy_id: &str) -> Result<Option<(String, i64)>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT holder, expires_at_ms FROM strategy_leases WHERE strategy_id = ?1",
                params![strategy_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    // ==================== Event journal ====================

    pub fn record_event(&self, kind: &str, symbol: Option<&str>, payload: &str) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO engine_events (timestamp, kind, symbol, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![Utc::now().to_rfc3339(), kind, symbol, payload],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, kind, symbol, payload
            FROM engine_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    timestamp: parse_time(row, 1)?,
                    kind: row.get(2)?,
                    symbol: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_events(&self, kind: &str) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM engine_events WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ==================== Row mapping ====================

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, format!("{raw}: {e}")))
}

fn parse_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn parse_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e.to_string()))
    })
    .transpose()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledOrder> {
    let leg_raw: String = row.get(6)?;
    let leg = OrderLeg::from_suffix(&leg_raw)
        .ok_or_else(|| conversion_error(6, format!("unknown leg {leg_raw}")))?;

    let tp_percent = parse_opt_decimal(row, 20)?;
    let sl_percent = parse_opt_decimal(row, 21)?;
    let bracket = match (tp_percent, sl_percent) {
        (Some(tp_percent), Some(sl_percent)) => Some(BracketSpec {
            tp_percent,
            sl_percent,
        }),
        _ => None,
    };

    Ok(ScheduledOrder {
        id: row.get(0)?,
        client_order_id: row.get(1)?,
        exchange_order_id: row.get(2)?,
        execution_id: row.get(3)?,
        strategy_id: row.get(4)?,
        sequence: row.get::<_, i64>(5)? as u64,
        leg,
        symbol: row.get(7)?,
        side: parse_text::<OrderSide>(row, 8)?,
        kind: parse_text::<OrderKind>(row, 9)?,
        requested_qty: parse_text::<Decimal>(row, 10)?,
        adjusted_qty: parse_opt_decimal(row, 11)?,
        executed_qty: parse_text::<Decimal>(row, 12)?,
        price: parse_opt_decimal(row, 13)?,
        trigger_price: parse_opt_decimal(row, 14)?,
        avg_fill_price: parse_opt_decimal(row, 15)?,
        leverage: row.get(16)?,
        intended_margin: parse_opt_decimal(row, 17)?,
        effective_margin: parse_opt_decimal(row, 18)?,
        reduce_only: row.get(19)?,
        bracket,
        parent_order_id: row.get(22)?,
        status: parse_text::<OrderStatus>(row, 23)?,
        last_error: row.get(24)?,
        created_at: parse_time(row, 25)?,
        updated_at: parse_time(row, 26)?,
    })
}

fn bracket_from_row(row: &Row<'_>) -> rusqlite::Result<BracketLink> {
    Ok(BracketLink {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        symbol: row.get(2)?,
        entry_client_id: row.get(3)?,
        tp_client_id: row.get(4)?,
        sl_client_id: row.get(5)?,
        status: parse_text::<BracketStatus>(row, 6)?,
        realized_pnl: parse_opt_decimal(row, 7)?,
        created_at: parse_time(row, 8)?,
        updated_at: parse_time(row, 9)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<StrategyExecution> {
    let rejected: u32 = row.get(5)?;
    let decision_failures: u32 = row.get(6)?;
    Ok(StrategyExecution {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        status: parse_text::<ExecutionStatus>(row, 2)?,
        orders_total: row.get(3)?,
        orders_filled: row.get(4)?,
        orders_failed: rejected + decision_failures,
        realized_pnl: parse_text::<Decimal>(row, 7)?,
        error: row.get(8)?,
        started_at: parse_time(row, 9)?,
        finished_at: parse_opt_time(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client_order_id;
    use rust_decimal_macros::dec;

    fn new_order(execution_id: i64, sequence: u64, leg: OrderLeg) -> NewScheduledOrder {
        NewScheduledOrder {
            client_order_id: client_order_id("alpha", sequence, leg),
            execution_id,
            strategy_id: "alpha".to_string(),
            sequence,
            leg,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            requested_qty: dec!(0.01),
            price: Some(dec!(50000)),
            trigger_price: None,
            leverage: 5,
            intended_margin: Some(dec!(100)),
            reduce_only: false,
            bracket: Some(BracketSpec {
                tp_percent: dec!(2),
                sl_percent: dec!(1),
            }),
            parent_order_id: None,
        }
    }

    #[test]
    fn test_insert_order_is_idempotent_by_client_id() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();

        let (first, created) = store
            .insert_order(&new_order(execution.id, 1, OrderLeg::Entry))
            .unwrap();
        assert!(created);
        assert_eq!(first.status, OrderStatus::Pending);
        assert_eq!(first.bracket.unwrap().tp_percent, dec!(2));

        let (second, created) = store
            .insert_order(&new_order(execution.id, 1, OrderLeg::Entry))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.all_orders().unwrap().len(), 1);
    }

    #[test]
    fn test_conditional_transition_single_winner() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();
        let (order, _) = store
            .insert_order(&new_order(execution.id, 1, OrderLeg::Entry))
            .unwrap();

        let update = OrderUpdate {
            exchange_order_id: Some("1001".to_string()),
            ..Default::default()
        };
        assert!(store
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Submitted, &update)
            .unwrap());
        // Second writer expecting the old status loses
        assert!(!store
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Rejected, &OrderUpdate::default())
            .unwrap());

        let stored = store.get_order(order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Submitted);
        assert_eq!(stored.exchange_order_id.as_deref(), Some("1001"));
    }

    #[test]
    fn test_normalization_only_while_pending() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();
        let (order, _) = store
            .insert_order(&new_order(execution.id, 1, OrderLeg::Entry))
            .unwrap();

        assert!(store
            .record_normalization(order.id, dec!(0.002), Some(dec!(20)))
            .unwrap());
        store
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Submitted, &OrderUpdate::default())
            .unwrap();
        assert!(!store
            .record_normalization(order.id, dec!(0.5), None)
            .unwrap());

        let stored = store.get_order(order.id).unwrap().unwrap();
        assert_eq!(stored.adjusted_qty, Some(dec!(0.002)));
        assert_eq!(stored.effective_margin, Some(dec!(20)));
    }

    #[test]
    fn test_one_open_bracket_per_symbol() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();

        let first = store
            .insert_bracket(execution.id, "BTCUSDT", "e1", "tp1", "sl1")
            .unwrap()
            .unwrap();
        // Same entry: idempotent
        let again = store
            .insert_bracket(execution.id, "BTCUSDT", "e1", "tp1", "sl1")
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);

        // Different entry, same symbol, while first is open
        assert!(store
            .insert_bracket(execution.id, "BTCUSDT", "e2", "tp2", "sl2")
            .unwrap()
            .is_none());

        store
            .transition_bracket(first.id, &[BracketStatus::Created], BracketStatus::Aborted, None)
            .unwrap();
        assert!(store
            .insert_bracket(execution.id, "BTCUSDT", "e2", "tp2", "sl2")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_orphaned_bracket_still_holds_symbol() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();
        let link = store
            .insert_bracket(execution.id, "ETHUSDT", "e1", "tp1", "sl1")
            .unwrap()
            .unwrap();
        store
            .transition_bracket(link.id, &[BracketStatus::Created], BracketStatus::Active, None)
            .unwrap();
        store
            .transition_bracket(link.id, &[BracketStatus::Active], BracketStatus::Orphaned, None)
            .unwrap();

        // A leg may still be live on the venue
        assert_eq!(
            store.open_bracket_for_symbol("ETHUSDT").unwrap().unwrap().id,
            link.id
        );
        assert!(store
            .insert_bracket(execution.id, "ETHUSDT", "e2", "tp2", "sl2")
            .unwrap()
            .is_none());

        store
            .transition_bracket(link.id, &[BracketStatus::Orphaned], BracketStatus::Closed, None)
            .unwrap();
        assert!(store.open_bracket_for_symbol("ETHUSDT").unwrap().is_none());
        assert!(store
            .insert_bracket(execution.id, "ETHUSDT", "e2", "tp2", "sl2")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_lease_is_exclusive_until_released() {
        let store = OrderStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("alpha", "worker-a", ttl).unwrap());
        assert!(!store.try_acquire_lease("alpha", "worker-b", ttl).unwrap());
        // Other strategies are independent
        assert!(store.try_acquire_lease("beta", "worker-b", ttl).unwrap());

        assert!(!store.release_lease("alpha", "worker-b").unwrap());
        assert!(store.release_lease("alpha", "worker-a").unwrap());
        assert!(store.try_acquire_lease("alpha", "worker-b", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = OrderStore::in_memory().unwrap();
        assert!(store
            .try_acquire_lease("alpha", "worker-a", Duration::ZERO)
            .unwrap());
        assert!(store
            .try_acquire_lease("alpha", "worker-b", Duration::from_secs(60))
            .unwrap());
        let (holder, _) = store.lease_holder("alpha").unwrap().unwrap();
        assert_eq!(holder, "worker-b");
    }

    #[test]
    fn test_execution_counters_and_pnl() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();
        let (order, _) = store
            .insert_order(&new_order(execution.id, 1, OrderLeg::Entry))
            .unwrap();
        store
            .insert_order(&new_order(execution.id, 2, OrderLeg::Entry))
            .unwrap();
        store
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Filled, &OrderUpdate::default())
            .unwrap();
        store.record_decision_failure(execution.id).unwrap();
        store.refresh_execution_counters(execution.id).unwrap();
        store.add_realized_pnl(execution.id, dec!(12.5)).unwrap();
        store.add_realized_pnl(execution.id, dec!(-2.5)).unwrap();

        let loaded = store.get_execution(execution.id).unwrap().unwrap();
        assert_eq!(loaded.orders_total, 2);
        assert_eq!(loaded.orders_filled, 1);
        assert_eq!(loaded.orders_failed, 1);
        assert_eq!(loaded.realized_pnl, dec!(10));
    }

    #[test]
    fn test_corrupt_realized_pnl_is_an_error() {
        let store = OrderStore::in_memory().unwrap();
        let execution = store.create_execution("alpha").unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE strategy_executions SET realized_pnl = 'n/a' WHERE id = ?1",
                params![execution.id],
            )
            .unwrap();

        assert!(store.add_realized_pnl(execution.id, dec!(1)).is_err());
        let raw: String = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT realized_pnl FROM strategy_executions WHERE id = ?1",
                params![execution.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, "n/a");
    }
}
