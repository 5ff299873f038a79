use crate::domain::catalog::{SourceKind, TrackedItem};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One observation from the upstream. Never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSample {
    pub item_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "values", rename_all = "snake_case")]
pub enum BucketValues {
    /// Aggregated items: the last overwritten value.
    Latest(f64),
    /// RawSample items: every value observed during the day, in arrival order.
    Samples(Vec<f64>),
}

/// Working set of prices for one item and one service day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorBucket {
    pub item_id: String,
    pub service_day: NaiveDate,
    pub values: BucketValues,
    pub updated_at: DateTime<Utc>,
}

impl AccumulatorBucket {
    /// Unrounded day price implied by the bucket contents.
    pub fn derive(&self) -> Option<f64> {
        match &self.values {
            BucketValues::Latest(v) => Some(*v).filter(|v| v.is_finite()),
            BucketValues::Samples(samples) => mean(samples),
        }
    }

    pub fn sample_count(&self) -> usize {
        match &self.values {
            BucketValues::Latest(_) => 1,
            BucketValues::Samples(samples) => samples.len(),
        }
    }
}

/// Immutable, finalized price for one item and one service day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPriceRecord {
    pub item_id: String,
    pub date: NaiveDate,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

impl DailyPriceRecord {
    pub fn new(item: &TrackedItem, date: NaiveDate, raw_price: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            item_id: item.id.clone(),
            date,
            price: item.precision.round(raw_price),
            recorded_at,
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Rounded day price for `item` derived from its bucket.
pub fn bucket_price(item: &TrackedItem, bucket: &AccumulatorBucket) -> Option<f64> {
    let raw = match (item.source_kind(), &bucket.values) {
        (SourceKind::RawSample, BucketValues::Samples(samples)) => mean(samples),
        _ => bucket.derive(),
    }?;
    Some(item.precision.round(raw))
}
