//! Database persistence for full session state management.
//!
//! Stores everything needed to resume a session after restart:
//! - Balance, realized P&L and safety-controller state
//! - Open positions and resting take-profit orders
//! - The append-only trade journal
//! - Quarantined rows that failed to deserialize
//!
//! All money amounts are stored as TEXT so Decimal values round-trip
//! exactly. Every table is keyed by session id; sessions never see each
//! other's rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{error, warn};

use crate::models::{Position, RestingOrder, TradeRecord};
use crate::risk::safety::SafetyState;

/// Database connection pool with full state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Everything a session persists between runs.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub balance: Decimal,
    pub realized_pnl: Decimal,
    pub peak_equity: Decimal,
    pub safety_state: SafetyState,
    pub positions: Vec<Position>,
    pub resting_orders: Vec<RestingOrder>,
}

/// Raw session row; decimals stay TEXT until parsed.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    pub balance: String,
    pub realized_pnl: String,
    pub peak_equity: String,
    pub safety_state: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    pub symbol: String,
    pub quantity: String,
    pub avg_price: String,
    pub entry_time: String,
    pub take_profit_price: String,
    pub stop_loss_price: String,
    pub signal_strength: f64,
    pub peak_price: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RestingOrderRow {
    pub symbol: String,
    pub order_id: String,
    pub target_price: String,
    pub quantity: String,
    pub created_at: String,
    pub last_checked: String,
}

/// Journal row as stored, for the CLI's journal view.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JournalEntry {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub price: String,
    pub notional: String,
    pub pnl: String,
    pub signal: Option<String>,
    pub confidence: f64,
    pub execution_mode: String,
    pub broker_order_id: Option<String>,
    pub commission: String,
    pub reason_code: String,
    pub detail: Option<String>,
    pub timestamp: String,
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Ephemeral in-memory database.
    ///
    /// Pinned to a single connection: each new `:memory:` connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Session state table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                session_id TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                peak_equity TEXT NOT NULL DEFAULT '0',
                safety_state TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Open positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                take_profit_price TEXT NOT NULL,
                stop_loss_price TEXT NOT NULL,
                signal_strength REAL NOT NULL DEFAULT 0,
                peak_price TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(session_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Resting take-profit orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resting_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                order_id TEXT NOT NULL,
                target_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_checked TEXT NOT NULL,
                UNIQUE(session_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trade journal, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_journal (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                notional TEXT NOT NULL,
                pnl TEXT NOT NULL,
                pnl_percent TEXT NOT NULL,
                signal TEXT,
                confidence REAL NOT NULL DEFAULT 0,
                execution_mode TEXT NOT NULL,
                broker_order_id TEXT,
                commission TEXT NOT NULL DEFAULT '0',
                reason_code TEXT NOT NULL,
                detail TEXT,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Rows that failed to deserialize; kept, never deleted
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quarantined_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                source_table TEXT NOT NULL,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                quarantined_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_session ON trade_journal(session_id, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_session ON positions(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_reason ON trade_journal(reason_code)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Session State ====================

    /// Persist the full session snapshot in one transaction.
    pub async fn save_session(&self, session_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        let safety_json = serde_json::to_string(&snapshot.safety_state)
            .context("Failed to serialize safety state")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO session_state (session_id, balance, realized_pnl, peak_equity, safety_state, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(session_id) DO UPDATE SET
                balance = excluded.balance,
                realized_pnl = excluded.realized_pnl,
                peak_equity = excluded.peak_equity,
                safety_state = excluded.safety_state,
                updated_at = datetime('now')
            "#,
        )
        .bind(session_id)
        .bind(snapshot.balance.to_string())
        .bind(snapshot.realized_pnl.to_string())
        .bind(snapshot.peak_equity.to_string())
        .bind(&safety_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM positions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for pos in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO positions (
                    session_id, symbol, quantity, avg_price, entry_time,
                    take_profit_price, stop_loss_price, signal_strength, peak_price
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(&pos.symbol)
            .bind(pos.quantity.to_string())
            .bind(pos.avg_price.to_string())
            .bind(pos.entry_time.to_rfc3339())
            .bind(pos.take_profit_price.to_string())
            .bind(pos.stop_loss_price.to_string())
            .bind(pos.signal_strength)
            .bind(pos.peak_price.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM resting_orders WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for order in &snapshot.resting_orders {
            sqlx::query(
                r#"
                INSERT INTO resting_orders (
                    session_id, symbol, order_id, target_price, quantity, created_at, last_checked
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(&order.symbol)
            .bind(&order.order_id)
            .bind(order.target_price.to_string())
            .bind(order.quantity.to_string())
            .bind(order.created_at.to_rfc3339())
            .bind(order.last_checked.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load a session snapshot, or `None` for a fresh session.
    ///
    /// A corrupt session row is quarantined and treated as absent; corrupt
    /// position or order rows are quarantined individually and skipped.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT balance, realized_pnl, peak_equity, safety_state FROM session_state WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let parsed = (|| -> Result<(Decimal, Decimal, Decimal, SafetyState)> {
            let balance = parse_decimal(&row.balance)?;
            let realized = parse_decimal(&row.realized_pnl)?;
            let peak = parse_decimal(&row.peak_equity)?;
            let safety: SafetyState = serde_json::from_str(&row.safety_state)
                .context("safety state JSON")?;
            Ok((balance, realized, peak, safety))
        })();

        let (balance, realized_pnl, peak_equity, safety_state) = match parsed {
            Ok(v) => v,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "session row corrupt, quarantined");
                self.quarantine(session_id, "session_state", &format!("{row:?}"), &e.to_string())
                    .await?;
                return Ok(None);
            }
        };

        let position_rows: Vec<PositionRow> = sqlx::query_as(
            r#"
            SELECT symbol, quantity, avg_price, entry_time, take_profit_price,
                   stop_loss_price, signal_strength, peak_price
            FROM positions WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::new();
        for row in position_rows {
            match parse_position(&row) {
                Ok(pos) => positions.push(pos),
                Err(e) => {
                    warn!(session_id = %session_id, symbol = %row.symbol, error = %e, "position row corrupt, quarantined");
                    self.quarantine(session_id, "positions", &format!("{row:?}"), &e.to_string())
                        .await?;
                }
            }
        }

        let order_rows: Vec<RestingOrderRow> = sqlx::query_as(
            r#"
            SELECT symbol, order_id, target_price, quantity, created_at, last_checked
            FROM resting_orders WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut resting_orders = Vec::new();
        for row in order_rows {
            match parse_resting_order(&row) {
                Ok(order) => resting_orders.push(order),
                Err(e) => {
                    warn!(session_id = %session_id, symbol = %row.symbol, error = %e, "resting order row corrupt, quarantined");
                    self.quarantine(session_id, "resting_orders", &format!("{row:?}"), &e.to_string())
                        .await?;
                }
            }
        }

        Ok(Some(SessionSnapshot {
            balance,
            realized_pnl,
            peak_equity,
            safety_state,
            positions,
            resting_orders,
        }))
    }

    async fn quarantine(
        &self,
        session_id: &str,
        source_table: &str,
        payload: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO quarantined_rows (session_id, source_table, payload, error) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(source_table)
        .bind(payload)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of quarantined rows for a session.
    pub async fn quarantined_count(&self, session_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM quarantined_rows WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ==================== Trade Journal ====================

    /// Append one journal record. Rows are never updated or deleted.
    pub async fn record_trade(&self, session_id: &str, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_journal (
                id, session_id, symbol, side, quantity, price, notional,
                pnl, pnl_percent, signal, confidence, execution_mode,
                broker_order_id, commission, reason_code, detail, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(session_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.quantity.to_string())
        .bind(record.price.to_string())
        .bind(record.notional.to_string())
        .bind(record.pnl.to_string())
        .bind(record.pnl_percent.to_string())
        .bind(record.signal.map(|s| s.as_str()))
        .bind(record.confidence)
        .bind(record.execution_mode.as_str())
        .bind(record.broker_order_id.as_deref())
        .bind(record.commission.to_string())
        .bind(record.reason_code.as_str())
        .bind(record.detail.as_deref())
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent journal entries, newest first.
    pub async fn recent_trades(&self, session_id: &str, limit: i64) -> Result<Vec<JournalEntry>> {
        sqlx::query_as::<_, JournalEntry>(
            r#"
            SELECT id, symbol, side, quantity, price, notional, pnl, signal,
                   confidence, execution_mode, broker_order_id, commission,
                   reason_code, detail, timestamp
            FROM trade_journal WHERE session_id = ?
            ORDER BY timestamp DESC LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch journal")
    }

    /// Journal counts by fill/rejection, for the status view.
    pub async fn journal_stats(&self, session_id: &str) -> Result<(i64, i64)> {
        let fills = "('filled','take_profit','stop_fixed','stop_atr','stop_trailing','stop_time','stop_volatility','emergency_liquidation')";

        let (filled,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM trade_journal WHERE session_id = ? AND reason_code IN {fills}"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        let (rejected,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM trade_journal WHERE session_id = ? AND reason_code NOT IN {fills}"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((filled, rejected))
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .with_context(|| format!("invalid decimal: {raw}"))
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {raw}"))
}

fn parse_position(row: &PositionRow) -> Result<Position> {
    Ok(Position {
        symbol: row.symbol.clone(),
        quantity: parse_decimal(&row.quantity)?,
        avg_price: parse_decimal(&row.avg_price)?,
        entry_time: parse_datetime(&row.entry_time)?,
        take_profit_price: parse_decimal(&row.take_profit_price)?,
        stop_loss_price: parse_decimal(&row.stop_loss_price)?,
        signal_strength: row.signal_strength,
        peak_price: parse_decimal(&row.peak_price)?,
    })
}

fn parse_resting_order(row: &RestingOrderRow) -> Result<RestingOrder> {
    Ok(RestingOrder {
        symbol: row.symbol.clone(),
        order_id: row.order_id.clone(),
        target_price: parse_decimal(&row.target_price)?,
        quantity: parse_decimal(&row.quantity)?,
        created_at: parse_datetime(&row.created_at)?,
        last_checked: parse_datetime(&row.last_checked)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{ExecutionMode, ReasonCode, TradeSide};
    use crate::risk::safety::SafetyController;
    use rust_decimal_macros::dec;

    async fn make_db() -> Database {
        Database::in_memory().await.unwrap()
    }

    fn make_snapshot() -> SessionSnapshot {
        let safety_state = SafetyController::new(EngineConfig::default()).snapshot_state();
        SessionSnapshot {
            balance: dec!(987.654321),
            realized_pnl: dec!(-12.5),
            peak_equity: dec!(1050.01),
            safety_state,
            positions: vec![Position::new(
                "BTCUSDT".to_string(),
                dec!(0.12345678),
                dec!(43210.99),
                dec!(44507.3197),
                dec!(41050.4405),
                0.82,
            )],
            resting_orders: vec![RestingOrder::new(
                "BTCUSDT".to_string(),
                "ord-7".to_string(),
                dec!(44507.3197),
                dec!(0.12345678),
            )],
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip_exact() {
        let db = make_db().await;
        let snapshot = make_snapshot();
        db.save_session("s1", &snapshot).await.unwrap();

        let loaded = db.load_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, snapshot.balance);
        assert_eq!(loaded.realized_pnl, snapshot.realized_pnl);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].quantity, dec!(0.12345678));
        assert_eq!(loaded.positions[0].avg_price, dec!(43210.99));
        assert_eq!(loaded.resting_orders[0].target_price, dec!(44507.3197));
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let db = make_db().await;
        assert!(db.load_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let db = make_db().await;
        let mut a = make_snapshot();
        a.balance = dec!(111);
        let mut b = make_snapshot();
        b.balance = dec!(222);
        b.positions.clear();

        db.save_session("a", &a).await.unwrap();
        db.save_session("b", &b).await.unwrap();

        let loaded_a = db.load_session("a").await.unwrap().unwrap();
        let loaded_b = db.load_session("b").await.unwrap().unwrap();
        assert_eq!(loaded_a.balance, dec!(111));
        assert_eq!(loaded_b.balance, dec!(222));
        assert_eq!(loaded_a.positions.len(), 1);
        assert!(loaded_b.positions.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_session_row_quarantined() {
        let db = make_db().await;
        db.save_session("s1", &make_snapshot()).await.unwrap();

        sqlx::query("UPDATE session_state SET safety_state = 'not json' WHERE session_id = 's1'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db.load_session("s1").await.unwrap().is_none());
        assert_eq!(db.quarantined_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_position_row_skipped_not_fatal() {
        let db = make_db().await;
        db.save_session("s1", &make_snapshot()).await.unwrap();

        sqlx::query("UPDATE positions SET quantity = 'garbage' WHERE session_id = 's1'")
            .execute(db.pool())
            .await
            .unwrap();

        let loaded = db.load_session("s1").await.unwrap().unwrap();
        assert!(loaded.positions.is_empty());
        assert_eq!(db.quarantined_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_journal_append_and_stats() {
        let db = make_db().await;

        let fill = TradeRecord::fill(
            "BTCUSDT",
            TradeSide::Buy,
            dec!(0.5),
            dec!(100),
            Decimal::ZERO,
            None,
            0.8,
            ExecutionMode::Paper,
            "ord-1".to_string(),
            dec!(0.0005),
            ReasonCode::Filled,
        );
        let rejection = TradeRecord::rejection(
            "BTCUSDT",
            TradeSide::Buy,
            ExecutionMode::Paper,
            ReasonCode::DailyLossLimit,
            "daily loss ceiling",
        );
        db.record_trade("s1", &fill).await.unwrap();
        db.record_trade("s1", &rejection).await.unwrap();

        let entries = db.recent_trades("s1", 10).await.unwrap();
        assert_eq!(entries.len(), 2);

        let (filled, rejected) = db.journal_stats("s1").await.unwrap();
        assert_eq!(filled, 1);
        assert_eq!(rejected, 1);
    }
}
