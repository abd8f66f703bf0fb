use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::db::models::SignalRow;
use crate::error::Result;
use crate::types::Signal;

/// Receives emitted signals and persists them to SQLite.
/// Runs as a dedicated background task, off the evaluation path.
pub struct DbWriter {
    pool: sqlx::SqlitePool,
    signal_rx: mpsc::Receiver<Signal>,
}

impl DbWriter {
    pub fn new(pool: sqlx::SqlitePool, signal_rx: mpsc::Receiver<Signal>) -> Self {
        Self { pool, signal_rx }
    }

    pub async fn run(mut self) {
        while let Some(signal) = self.signal_rx.recv().await {
            if let Err(e) = write_signal(&self.pool, &signal).await {
                error!(dedup_key = %signal.dedup_key, "DB write error: {e}");
            }
        }
        debug!("DB writer stopped");
    }
}

pub async fn write_signal(pool: &sqlx::SqlitePool, signal: &Signal) -> Result<()> {
    let row = SignalRow::from_signal(signal)?;
    sqlx::query(
        r#"
        INSERT INTO signals (
            detected_at, direction, variant,
            collection_name, model_name, backdrop_name, dedup_key,
            percent_diff, percent_diff_with_fee,
            buy_market, buy_price, sell_market, reference_price,
            activity_level, payload
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.detected_at)
    .bind(&row.direction)
    .bind(&row.variant)
    .bind(&row.collection_name)
    .bind(&row.model_name)
    .bind(&row.backdrop_name)
    .bind(&row.dedup_key)
    .bind(row.percent_diff)
    .bind(row.percent_diff_with_fee)
    .bind(&row.buy_market)
    .bind(row.buy_price)
    .bind(&row.sell_market)
    .bind(row.reference_price)
    .bind(&row.activity_level)
    .bind(&row.payload)
    .execute(pool)
    .await?;
    Ok(())
}

/// Newest first, optionally restricted to one direction.
pub async fn recent_signals(
    pool: &sqlx::SqlitePool,
    limit: i64,
    direction: Option<&str>,
) -> Result<Vec<SignalRow>> {
    let rows = sqlx::query_as::<_, SignalRow>(
        r#"
        SELECT id, detected_at, direction, variant,
               collection_name, model_name, backdrop_name, dedup_key,
               percent_diff, percent_diff_with_fee,
               buy_market, buy_price, sell_market, reference_price,
               activity_level, payload
        FROM signals
        WHERE ?1 IS NULL OR direction = ?1
        ORDER BY detected_at DESC, id DESC
        LIMIT ?2
        "#,
    )
    .bind(direction)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
