use crate::domain::price::{AccumulatorBucket, BucketValues};
use crate::storage::AccumulatorStore;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct PgAccumulatorStore {
    pool: sqlx::PgPool,
}

impl PgAccumulatorStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

type BucketRow = (String, NaiveDate, Option<f64>, Vec<f64>, DateTime<Utc>);

fn bucket_from_row(row: BucketRow) -> AccumulatorBucket {
    let (item_id, service_day, latest_value, samples, updated_at) = row;
    let values = match latest_value {
        Some(v) if samples.is_empty() => BucketValues::Latest(v),
        _ => BucketValues::Samples(samples),
    };
    AccumulatorBucket {
        item_id,
        service_day,
        values,
        updated_at,
    }
}

#[async_trait::async_trait]
impl AccumulatorStore for PgAccumulatorStore {
    async fn overwrite(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO accumulator_buckets (item_id, service_day, latest_value, samples, updated_at) \
             VALUES ($1, $2, $3, '{}', $4) \
             ON CONFLICT (item_id, service_day) DO UPDATE \
               SET latest_value = EXCLUDED.latest_value, updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(item_id)
        .bind(service_day)
        .bind(value)
        .bind(observed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("overwrite accumulator_buckets failed (item={item_id})"))?;
        Ok(())
    }

    async fn append(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO accumulator_buckets (item_id, service_day, latest_value, samples, updated_at) \
             VALUES ($1, $2, NULL, ARRAY[$3]::DOUBLE PRECISION[], $4) \
             ON CONFLICT (item_id, service_day) DO UPDATE \
               SET samples = array_append(accumulator_buckets.samples, $3), updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(item_id)
        .bind(service_day)
        .bind(value)
        .bind(observed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("append accumulator_buckets failed (item={item_id})"))?;
        Ok(())
    }

    async fn bucket(
        &self,
        item_id: &str,
        service_day: NaiveDate,
    ) -> anyhow::Result<Option<AccumulatorBucket>> {
        let row = sqlx::query_as::<_, BucketRow>(
            "SELECT item_id, service_day, latest_value, samples, updated_at \
             FROM accumulator_buckets \
             WHERE item_id = $1 AND service_day = $2",
        )
        .persistent(false)
        .bind(item_id)
        .bind(service_day)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select accumulator_buckets failed (item={item_id})"))?;

        Ok(row.map(bucket_from_row))
    }

    async fn clear(&self, item_id: &str, service_day: NaiveDate) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "DELETE FROM accumulator_buckets WHERE item_id = $1 AND service_day = $2",
        )
        .persistent(false)
        .bind(item_id)
        .bind(service_day)
        .execute(&self.pool)
        .await
        .with_context(|| format!("delete accumulator_buckets failed (item={item_id})"))?;
        Ok(res.rows_affected() > 0)
    }
}
