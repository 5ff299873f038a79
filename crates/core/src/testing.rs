//! Fixtures shared by the pipeline tests.

use crate::config::PipelineConfig;
use crate::domain::catalog::{Catalog, FetchParams, Precision, TrackedItem};
use crate::error::PipelineError;
use crate::ingest::types::DailyStat;
use crate::ingest::UpstreamClient;
use crate::pipeline::{Components, Pipeline};
use crate::publish::object_store::MemoryObjectStore;
use crate::publish::CacheCoordinator;
use crate::storage::{MemoryAccumulatorStore, MemoryHistoryStore};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

pub fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
}

/// gold: aggregated/integer, token: aggregated/one decimal, feather: raw sample/integer.
pub fn catalog() -> Catalog {
    Catalog::new(vec![
        TrackedItem {
            id: "gold".to_string(),
            display_name: "Gold".to_string(),
            source: FetchParams::Aggregated {
                upstream_id: "100".to_string(),
            },
            precision: Precision::Integer,
        },
        TrackedItem {
            id: "token".to_string(),
            display_name: "Token".to_string(),
            source: FetchParams::Aggregated {
                upstream_id: "1".to_string(),
            },
            precision: Precision::OneDecimal,
        },
        TrackedItem {
            id: "feather".to_string(),
            display_name: "Feather".to_string(),
            source: FetchParams::RawSample {
                query: "Feather".to_string(),
                category: None,
            },
            precision: Precision::Integer,
        },
    ])
    .unwrap()
}

/// Upstream double with per-item prices, trailing windows and failures.
#[derive(Default)]
pub struct ScriptedUpstream {
    prices: Mutex<HashMap<String, f64>>,
    stats: Mutex<HashMap<String, Vec<DailyStat>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<usize>,
}

impl ScriptedUpstream {
    pub fn set_price(&self, item_id: &str, price: f64) {
        self.prices.lock().unwrap().insert(item_id.to_string(), price);
    }

    pub fn set_stats(&self, item_id: &str, stats: &[(u32, f64)]) {
        let stats = stats
            .iter()
            .map(|(day, average_price)| DailyStat {
                date: d(*day),
                average_price: *average_price,
            })
            .collect();
        self.stats.lock().unwrap().insert(item_id.to_string(), stats);
    }

    pub fn fail(&self, item_id: &str) {
        self.failing.lock().unwrap().insert(item_id.to_string());
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn check(&self, item_id: &str) -> Result<(), PipelineError> {
        *self.calls.lock().unwrap() += 1;
        if self.failing.lock().unwrap().contains(item_id) {
            return Err(PipelineError::UpstreamUnavailable {
                item_id: item_id.to_string(),
                detail: "HTTP 503".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn fetch_price(&self, item: &TrackedItem) -> Result<f64, PipelineError> {
        self.check(&item.id)?;
        self.prices
            .lock()
            .unwrap()
            .get(&item.id)
            .copied()
            .ok_or_else(|| PipelineError::UpstreamDataMissing {
                item_id: item.id.clone(),
                detail: "no price".to_string(),
            })
    }

    async fn fetch_daily_stats(
        &self,
        item: &TrackedItem,
        _days: u32,
    ) -> Result<Vec<DailyStat>, PipelineError> {
        self.check(&item.id)?;
        Ok(self
            .stats
            .lock()
            .unwrap()
            .get(&item.id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub upstream: Arc<ScriptedUpstream>,
    pub acc: Arc<MemoryAccumulatorStore>,
    pub hist: Arc<MemoryHistoryStore>,
    pub objects: Arc<MemoryObjectStore>,
}

impl Harness {
    pub async fn blob(&self, key: &str) -> Option<serde_json::Value> {
        self.objects
            .object(key)
            .await
            .map(|o| serde_json::from_slice(&o.body).unwrap())
    }
}

pub fn harness() -> Harness {
    let upstream = Arc::new(ScriptedUpstream::default());
    let acc = Arc::new(MemoryAccumulatorStore::new());
    let hist = Arc::new(MemoryHistoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());

    let cfg = PipelineConfig {
        request_delay: Duration::ZERO,
        ..PipelineConfig::default()
    };

    let pipeline = Pipeline::new(
        Components {
            catalog: Arc::new(catalog()),
            upstream: upstream.clone(),
            accumulator: acc.clone(),
            history: hist.clone(),
            objects: objects.clone(),
            cache: CacheCoordinator::noop(),
        },
        &cfg,
    );

    Harness {
        pipeline,
        upstream,
        acc,
        hist,
        objects,
    }
}
