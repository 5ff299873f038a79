//! Process-local stores for dry runs and tests. Same contracts as the Postgres stores.

use crate::domain::price::{AccumulatorBucket, BucketValues, DailyPriceRecord};
use crate::storage::{AccumulatorStore, HistoryStore};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

type Key = (String, NaiveDate);

#[derive(Debug, Default)]
pub struct MemoryAccumulatorStore {
    buckets: Mutex<BTreeMap<Key, AccumulatorBucket>>,
}

impl MemoryAccumulatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[async_trait::async_trait]
impl AccumulatorStore for MemoryAccumulatorStore {
    async fn overwrite(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut guard = self.buckets.lock().await;
        guard.insert(
            (item_id.to_string(), service_day),
            AccumulatorBucket {
                item_id: item_id.to_string(),
                service_day,
                values: BucketValues::Latest(value),
                updated_at: observed_at,
            },
        );
        Ok(())
    }

    async fn append(
        &self,
        item_id: &str,
        service_day: NaiveDate,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut guard = self.buckets.lock().await;
        let bucket = guard
            .entry((item_id.to_string(), service_day))
            .or_insert_with(|| AccumulatorBucket {
                item_id: item_id.to_string(),
                service_day,
                values: BucketValues::Samples(Vec::new()),
                updated_at: observed_at,
            });
        match &mut bucket.values {
            BucketValues::Samples(samples) => samples.push(value),
            other => *other = BucketValues::Samples(vec![value]),
        }
        bucket.updated_at = observed_at;
        Ok(())
    }

    async fn bucket(
        &self,
        item_id: &str,
        service_day: NaiveDate,
    ) -> anyhow::Result<Option<AccumulatorBucket>> {
        let guard = self.buckets.lock().await;
        Ok(guard.get(&(item_id.to_string(), service_day)).cloned())
    }

    async fn clear(&self, item_id: &str, service_day: NaiveDate) -> anyhow::Result<bool> {
        let mut guard = self.buckets.lock().await;
        Ok(guard.remove(&(item_id.to_string(), service_day)).is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<BTreeMap<Key, DailyPriceRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn upsert(&self, record: &DailyPriceRecord) -> anyhow::Result<bool> {
        let mut guard = self.records.lock().await;
        let key = (record.item_id.clone(), record.date);
        if let Some(existing) = guard.get(&key) {
            if existing.price == record.price {
                return Ok(false);
            }
        }
        guard.insert(key, record.clone());
        Ok(true)
    }

    async fn insert_if_absent(&self, record: &DailyPriceRecord) -> anyhow::Result<bool> {
        let mut guard = self.records.lock().await;
        let key = (record.item_id.clone(), record.date);
        if guard.contains_key(&key) {
            return Ok(false);
        }
        guard.insert(key, record.clone());
        Ok(true)
    }

    async fn get(
        &self,
        item_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPriceRecord>> {
        let guard = self.records.lock().await;
        Ok(guard.get(&(item_id.to_string(), date)).cloned())
    }

    async fn latest_on_or_before(
        &self,
        item_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<DailyPriceRecord>> {
        let guard = self.records.lock().await;
        Ok(guard
            .range((item_id.to_string(), NaiveDate::MIN)..=(item_id.to_string(), date))
            .next_back()
            .map(|(_, r)| r.clone()))
    }

    async fn delete(&self, item_id: &str, date: NaiveDate) -> anyhow::Result<bool> {
        let mut guard = self.records.lock().await;
        Ok(guard.remove(&(item_id.to_string(), date)).is_some())
    }

    async fn delete_date(&self, date: NaiveDate) -> anyhow::Result<Vec<String>> {
        let mut guard = self.records.lock().await;
        let keys: Vec<Key> = guard.keys().filter(|(_, d)| *d == date).cloned().collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            guard.remove(&key);
            out.push(key.0);
        }
        Ok(out)
    }

    async fn all_records(&self) -> anyhow::Result<Vec<DailyPriceRecord>> {
        let guard = self.records.lock().await;
        Ok(guard.values().cloned().collect())
    }
}
