use crate::domain::price::DailyPriceRecord;
use crate::storage::HistoryStore;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: sqlx::PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

type RecordRow = (String, NaiveDate, f64, DateTime<Utc>);

fn record_from_row((item_id, date, price, recorded_at): RecordRow) -> DailyPriceRecord {
    DailyPriceRecord {
        item_id,
        date,
        price,
        recorded_at,
    }
}

#[async_trait::async_trait]
impl HistoryStore for PgHistoryStore {
    async fn upsert(&self, record: &DailyPriceRecord) -> anyhow::Result<bool> {
        // The WHERE clause turns a same-price rerun into a no-op, recorded_at included.
        let res = sqlx::query(
            "INSERT INTO daily_prices (item_id, date, price, recorded_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (item_id, date) DO UPDATE \
               SET price = EXCLUDED.price, recorded_at = EXCLUDED.recorded_at \
               WHERE daily_prices.price IS DISTINCT FROM EXCLUDED.price",
        )
        .persistent(false)
        .bind(&record.item_id)
        .bind(record.date)
        .bind(record.price)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "upsert daily_prices failed (item={}, date={})",
                record.item_id, record.date
            )
        })?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_if_absent(&self, record: &DailyPriceRecord) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "INSERT INTO daily_prices (item_id, date, price, recorded_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (item_id, date) DO NOTHING",
        )
        .persistent(false)
        .bind(&record.item_id)
        .bind(record.date)
        .bind(record.price)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "insert daily_prices failed (item={}, date={})",
                record.item_id, record.date
            )
        })?;
        Ok(res.rows_affected() > 0)
    }

    async fn get(
        &self,
        item_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPriceRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT item_id, date, price, recorded_at FROM daily_prices \
             WHERE item_id = $1 AND date = $2",
        )
        .persistent(false)
        .bind(item_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("select daily_prices failed")?;
        Ok(row.map(record_from_row))
    }

    async fn latest_on_or_before(
        &self,
        item_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPriceRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT item_id, date, price, recorded_at FROM daily_prices \
             WHERE item_id = $1 AND date <= $2 \
             ORDER BY date DESC \
             LIMIT 1",
        )
        .persistent(false)
        .bind(item_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("select latest daily_prices failed")?;
        Ok(row.map(record_from_row))
    }

    async fn delete(&self, item_id: &str, date: NaiveDate) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM daily_prices WHERE item_id = $1 AND date = $2")
            .persistent(false)
            .bind(item_id)
            .bind(date)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete daily_prices failed (item={item_id}, date={date})"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_date(&self, date: NaiveDate) -> anyhow::Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM daily_prices WHERE date = $1 RETURNING item_id",
        )
        .persistent(false)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("delete daily_prices by date failed (date={date})"))?;
        Ok(ids)
    }

    async fn all_records(&self) -> anyhow::Result<Vec<DailyPriceRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT item_id, date, price, recorded_at FROM daily_prices \
             ORDER BY item_id ASC, date ASC",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await
        .context("select all daily_prices failed")?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }
}
