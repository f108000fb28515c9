//! Database persistence for position state.
//!
//! Stores everything needed to resume after restart:
//! - Open positions (written on open and resize)
//! - Closed position history (moved from open in one transaction)
//! - Balance curve for drawdown reporting

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{ClosedPosition, Position};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored open position record. Decimals are kept as text to round-trip exactly.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub size: String,
    pub leverage: i64,
    pub margin: String,
    pub stop_loss_pct: String,
    pub take_profit_pct: String,
    pub entry_time: String,
}

/// Stored closed position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClosedPosition {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub exit_price: String,
    pub size: String,
    pub leverage: i64,
    pub pnl: String,
    pub reason: String,
    pub duration_seconds: i64,
    pub closed_at: String,
}

/// Balance curve point recorded once per cycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BalancePoint {
    pub timestamp: String,
    pub balance: f64,
    pub committed_margin: f64,
    pub open_positions: i64,
}

impl TryFrom<StoredPosition> for Position {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(Position {
            side: row.side.parse()?,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            size: parse_decimal("size", &row.size)?,
            leverage: u32::try_from(row.leverage).context("leverage out of range")?,
            margin: parse_decimal("margin", &row.margin)?,
            stop_loss_pct: parse_decimal("stop_loss_pct", &row.stop_loss_pct)?,
            take_profit_pct: parse_decimal("take_profit_pct", &row.take_profit_pct)?,
            entry_time: parse_time(&row.entry_time)?,
            id: row.id,
            symbol: row.symbol,
        })
    }
}

impl TryFrom<StoredClosedPosition> for ClosedPosition {
    type Error = anyhow::Error;

    fn try_from(row: StoredClosedPosition) -> Result<Self> {
        Ok(ClosedPosition {
            side: row.side.parse()?,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            exit_price: parse_decimal("exit_price", &row.exit_price)?,
            size: parse_decimal("size", &row.size)?,
            leverage: u32::try_from(row.leverage).context("leverage out of range")?,
            pnl: parse_decimal("pnl", &row.pnl)?,
            reason: row.reason.parse()?,
            duration_seconds: row.duration_seconds,
            closed_at: parse_time(&row.closed_at)?,
            id: row.id,
            symbol: row.symbol,
        })
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    raw.parse()
        .with_context(|| format!("Invalid decimal in {}: {}", field, raw))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", raw))
}

impl Database {
    /// Create a new database connection.
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

    /// Private in-memory database. A single connection that never expires,
    /// since every SQLite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Check out a pooled connection, stalling other queries on a
    /// single-connection pool until it is dropped.
    #[cfg(test)]
    pub(crate) async fn hold_connection(&self) -> sqlx::pool::PoolConnection<sqlx::Sqlite> {
        self.pool.acquire().await.unwrap()
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                margin TEXT NOT NULL,
                stop_loss_pct TEXT NOT NULL,
                take_profit_pct TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                size TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                pnl TEXT NOT NULL,
                reason TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                balance REAL NOT NULL,
                committed_margin REAL NOT NULL DEFAULT 0,
                open_positions INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_open_positions_symbol ON open_positions(symbol)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_closed_positions_symbol ON closed_positions(symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Open Positions ====================

    /// Save a newly opened position.
    pub async fn insert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO open_positions (
                id, symbol, side, entry_price, size, leverage, margin,
                stop_loss_pct, take_profit_pct, entry_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.size.to_string())
        .bind(i64::from(position.leverage))
        .bind(position.margin.to_string())
        .bind(position.stop_loss_pct.to_string())
        .bind(position.take_profit_pct.to_string())
        .bind(position.entry_time.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save position")?;

        Ok(())
    }

    /// Persist a resize. Only size and margin change.
    pub async fn update_position_size(&self, position: &Position) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE open_positions SET
                size = ?,
                margin = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(position.size.to_string())
        .bind(position.margin.to_string())
        .bind(&position.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Position {} is not open in the database", position.id);
        }

        Ok(())
    }

    /// All open positions in the order they were opened.
    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT id, symbol, side, entry_price, size, leverage, margin,
                   stop_loss_pct, take_profit_pct, entry_time
            FROM open_positions ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open positions")?;

        rows.into_iter().map(Position::try_from).collect()
    }

    // ==================== History ====================

    /// Record a close: insert the history row and delete the open row in
    /// one transaction. Nothing is written unless both succeed.
    pub async fn record_close(&self, record: &ClosedPosition) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO closed_positions (
                id, symbol, side, entry_price, exit_price, size, leverage,
                pnl, reason, duration_seconds, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.entry_price.to_string())
        .bind(record.exit_price.to_string())
        .bind(record.size.to_string())
        .bind(i64::from(record.leverage))
        .bind(record.pnl.to_string())
        .bind(record.reason.as_str())
        .bind(record.duration_seconds)
        .bind(record.closed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to append closed position")?;

        let deleted = sqlx::query("DELETE FROM open_positions WHERE id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() != 1 {
            // Dropping the transaction rolls back the insert
            anyhow::bail!("Position {} is not open in the database", record.id);
        }

        tx.commit().await?;
        Ok(())
    }

    /// Closed positions, oldest first.
    pub async fn load_history(&self) -> Result<Vec<ClosedPosition>> {
        let rows = sqlx::query_as::<_, StoredClosedPosition>(
            r#"
            SELECT id, symbol, side, entry_price, exit_price, size, leverage,
                   pnl, reason, duration_seconds, closed_at
            FROM closed_positions ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch history")?;

        rows.into_iter().map(ClosedPosition::try_from).collect()
    }

    // ==================== Balance Curve ====================

    /// Record the balance seen at the start of a cycle.
    pub async fn record_balance_point(
        &self,
        balance: f64,
        committed_margin: f64,
        open_positions: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_curve (balance, committed_margin, open_positions)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(balance)
        .bind(committed_margin)
        .bind(open_positions)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get recent balance curve points, newest first.
    pub async fn get_balance_curve(&self, limit: i64) -> Result<Vec<BalancePoint>> {
        sqlx::query_as::<_, BalancePoint>(
            r#"
            SELECT timestamp, balance, committed_margin, open_positions
            FROM balance_curve
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch balance curve")
    }

    /// Calculate max drawdown from the balance curve.
    pub async fn calculate_max_drawdown(&self) -> Result<f64> {
        let points = self.get_balance_curve(1000).await?;

        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        // Points are in DESC order, reverse for calculation
        for point in points.into_iter().rev() {
            if point.balance > peak {
                peak = point.balance;
            }
            if peak > 0.0 {
                let dd = (peak - point.balance) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        Ok(max_dd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Side};
    use rust_decimal_macros::dec;

    fn make_position() -> Position {
        Position::open(
            "XBTUSDTM".to_string(),
            Side::Short,
            dec!(64123.5),
            dec!(7.29),
            10,
            dec!(5),
            dec!(10),
        )
    }

    #[tokio::test]
    async fn test_position_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let mut position = make_position();
        db.insert_position(&position).await.unwrap();

        position = position.resized(dec!(3.5));
        db.update_position_size(&position).await.unwrap();

        let loaded = db.load_open_positions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, position.id);
        assert_eq!(loaded[0].size, dec!(3.5));
        assert_eq!(loaded[0].margin, position.margin);
        assert_eq!(loaded[0].entry_price, dec!(64123.5));
        assert_eq!(loaded[0].side, Side::Short);
    }

    #[tokio::test]
    async fn test_record_close_moves_row() {
        let db = Database::in_memory().await.unwrap();
        let position = make_position();
        db.insert_position(&position).await.unwrap();

        let record = position
            .close(dec!(63000), CloseReason::TakeProfit, Utc::now())
            .unwrap();
        db.record_close(&record).await.unwrap();

        assert!(db.load_open_positions().await.unwrap().is_empty());
        let history = db.load_history().await.unwrap();
        assert_eq!(history, vec![record.clone()]);

        // Closing again fails and leaves no duplicate behind
        assert!(db.record_close(&record).await.is_err());
        assert_eq!(db.load_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_of_unknown_position_rolls_back() {
        let db = Database::in_memory().await.unwrap();
        let record = make_position()
            .close(dec!(63000), CloseReason::Manual, Utc::now())
            .unwrap();

        assert!(db.record_close(&record).await.is_err());
        assert!(db.load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_drawdown() {
        let db = Database::in_memory().await.unwrap();
        for balance in [1000.0, 1200.0, 900.0, 1100.0] {
            db.record_balance_point(balance, 0.0, 0).await.unwrap();
        }

        let dd = db.calculate_max_drawdown().await.unwrap();
        assert!((dd - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_balance_curve_newest_first() {
        let db = Database::in_memory().await.unwrap();
        db.record_balance_point(10000.0, 0.0, 0).await.unwrap();
        db.record_balance_point(9800.0, 27.0, 1).await.unwrap();

        let curve = db.get_balance_curve(1).await.unwrap();
        assert_eq!(curve.len(), 1);
        assert_eq!(curve[0].balance, 9800.0);
        assert_eq!(curve[0].committed_margin, 27.0);
        assert_eq!(curve[0].open_positions, 1);
        assert!(!curve[0].timestamp.is_empty());
    }
}
