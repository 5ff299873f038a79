use crate::domain::catalog::{SourceKind, TrackedItem};
use crate::domain::price::{AccumulatorBucket, DailyPriceRecord, PriceSample};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

pub mod accumulator;
pub mod history;
pub mod memory;
pub mod runs;

pub use accumulator::PgAccumulatorStore;
pub use history::PgHistoryStore;
pub use memory::{MemoryAccumulatorStore, MemoryHistoryStore};

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Per (item, service day) working set. Writes are single statements so overlapping
/// ticks never need a read-modify-write.
#[async_trait::async_trait]
pub trait AccumulatorStore: Send + Sync {
    async fn overwrite(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn append(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn bucket(
        &self,
        item_id: &str,
        service_day: NaiveDate,
    ) -> anyhow::Result<Option<AccumulatorBucket>>;

    async fn clear(&self, item_id: &str, service_day: NaiveDate) -> anyhow::Result<bool>;
}

/// Finalized daily prices, unique per (item_id, date).
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts or replaces; returns false when the stored price was already identical.
    async fn upsert(&self, record: &DailyPriceRecord) -> anyhow::Result<bool>;

    /// Inserts only when no record exists for the key.
    async fn insert_if_absent(&self, record: &DailyPriceRecord) -> anyhow::Result<bool>;

    async fn get(&self, item_id: &str, date: NaiveDate)
        -> anyhow::Result<Option<DailyPriceRecord>>;

    async fn latest_on_or_before(
        &self,
        item_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPriceRecord>>;

    async fn delete(&self, item_id: &str, date: NaiveDate) -> anyhow::Result<bool>;

    /// Removes every record for `date`; returns the affected item ids.
    async fn delete_date(&self, date: NaiveDate) -> anyhow::Result<Vec<String>>;

    /// All records ordered by (item_id, date).
    async fn all_records(&self) -> anyhow::Result<Vec<DailyPriceRecord>>;
}

/// Folds one sample into the item's bucket according to its source kind.
pub async fn apply_sample(
    store: &dyn AccumulatorStore,
    item: &TrackedItem,
    service_day: NaiveDate,
    sample: &PriceSample,
) -> anyhow::Result<()> {
    match item.source_kind() {
        SourceKind::Aggregated => {
            store
                .overwrite(&item.id, service_day, sample.value, sample.observed_at)
                .await
        }
        SourceKind::RawSample => {
            store
                .append(&item.id, service_day, sample.value, sample.observed_at)
                .await
        }
    }
}
