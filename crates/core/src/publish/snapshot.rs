use crate::domain::catalog::Catalog;
use crate::domain::price::bucket_price;
use crate::error::PipelineError;
use crate::publish::cache::CacheTag;
use crate::publish::object_store::ObjectStore;
use crate::storage::{AccumulatorStore, HistoryStore};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const META_KEY: &str = "_meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Written,
    /// Source data produced the same document; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub tag: CacheTag,
    pub status: PublishStatus,
    pub bytes: usize,
}

/// Integral prices serialize as JSON integers, everything else as-is.
pub fn price_json(price: f64) -> Value {
    if price.fract() == 0.0 && price.abs() < 9.0e15 {
        json!(price as i64)
    } else {
        json!(price)
    }
}

/// Regenerates the `latest` and `history` blobs wholesale from the stores.
#[derive(Clone)]
pub struct SnapshotBuilder {
    catalog: Arc<Catalog>,
    accumulator: Arc<dyn AccumulatorStore>,
    history: Arc<dyn HistoryStore>,
    objects: Arc<dyn ObjectStore>,
}

impl SnapshotBuilder {
    pub fn new(
        catalog: Arc<Catalog>,
        accumulator: Arc<dyn AccumulatorStore>,
        history: Arc<dyn HistoryStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            catalog,
            accumulator,
            history,
            objects,
        }
    }

    /// Current-day values per item, falling back to the most recent finalized record.
    pub async fn latest_values(&self, as_of: NaiveDate) -> anyhow::Result<BTreeMap<String, f64>> {
        let mut out = BTreeMap::new();
        for item in self.catalog.items() {
            let current = self
                .accumulator
                .bucket(&item.id, as_of)
                .await?
                .and_then(|b| bucket_price(item, &b));

            let value = match current {
                Some(v) => Some(v),
                None => self
                    .history
                    .latest_on_or_before(&item.id, as_of)
                    .await?
                    .map(|r| r.price),
            };

            if let Some(v) = value {
                out.insert(item.id.clone(), v);
            }
        }
        Ok(out)
    }

    pub fn latest_document(
        values: &BTreeMap<String, f64>,
        as_of: NaiveDate,
        generated_at: DateTime<Utc>,
    ) -> Value {
        let mut doc = Map::new();
        for (id, v) in values {
            doc.insert(id.clone(), price_json(*v));
        }
        doc.insert(
            META_KEY.to_string(),
            json!({
                "date": as_of,
                "updatedAt": generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        );
        Value::Object(doc)
    }

    pub async fn history_document(&self) -> anyhow::Result<Value> {
        let mut series: BTreeMap<String, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        for record in self.history.all_records().await? {
            series
                .entry(record.item_id)
                .or_default()
                .insert(record.date, record.price);
        }

        let mut doc = Map::new();
        for (id, points) in series {
            let arr: Vec<Value> = points
                .into_iter()
                .map(|(date, price)| json!({ "date": date, "price": price_json(price) }))
                .collect();
            doc.insert(id, Value::Array(arr));
        }
        Ok(Value::Object(doc))
    }

    pub async fn rebuild_latest(
        &self,
        as_of: NaiveDate,
        generated_at: DateTime<Utc>,
        force: bool,
    ) -> Result<PublishOutcome, PipelineError> {
        let tag = CacheTag::Latest;
        let values = self
            .latest_values(as_of)
            .await
            .map_err(|e| PipelineError::storage("snapshot:latest", &e))?;
        let doc = Self::latest_document(&values, as_of, generated_at);

        if !force {
            if let Some(existing) = self.read_existing(tag).await {
                if strip_updated_at(&existing) == strip_updated_at(&doc) {
                    return Ok(PublishOutcome {
                        tag,
                        status: PublishStatus::Unchanged,
                        bytes: 0,
                    });
                }
            }
        }

        self.write(tag, &doc).await
    }

    pub async fn rebuild_history(&self, force: bool) -> Result<PublishOutcome, PipelineError> {
        let tag = CacheTag::History;
        let doc = self
            .history_document()
            .await
            .map_err(|e| PipelineError::storage("snapshot:history", &e))?;

        if !force {
            if let Some(existing) = self.read_existing(tag).await {
                if existing == doc {
                    return Ok(PublishOutcome {
                        tag,
                        status: PublishStatus::Unchanged,
                        bytes: 0,
                    });
                }
            }
        }

        self.write(tag, &doc).await
    }

    async fn read_existing(&self, tag: CacheTag) -> Option<Value> {
        match self.objects.get(tag.object_key()).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                // Unreadable current blob: fall through and rewrite it.
                tracing::warn!(tag = tag.as_str(), error = %err, "failed to read current snapshot");
                None
            }
        }
    }

    async fn write(&self, tag: CacheTag, doc: &Value) -> Result<PublishOutcome, PipelineError> {
        let target = format!("snapshot:{}", tag.as_str());
        let body = serde_json::to_vec(doc).map_err(|e| PipelineError::StorageWriteFailure {
            target: target.clone(),
            detail: e.to_string(),
        })?;
        let bytes = body.len();

        self.objects
            .put(tag.object_key(), body, tag.cache_control())
            .await
            .map_err(|e| PipelineError::storage(target, &e))?;

        tracing::info!(tag = tag.as_str(), bytes, "snapshot written");
        Ok(PublishOutcome {
            tag,
            status: PublishStatus::Written,
            bytes,
        })
    }
}

fn strip_updated_at(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Some(meta) = doc.get_mut(META_KEY).and_then(Value::as_object_mut) {
        meta.remove("updatedAt");
    }
    doc
}
