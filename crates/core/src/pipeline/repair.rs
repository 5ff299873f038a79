//! Parameterized recovery operations: recompute, delete and backfill history records.

use super::Pipeline;
use crate::domain::catalog::{SourceKind, TrackedItem};
use crate::domain::price::{AccumulatorBucket, DailyPriceRecord, PriceSample};
use crate::domain::report::{BatchReport, ItemResult, ItemStatus};
use crate::error::PipelineError;
use crate::publish::CacheTag;
use crate::storage::apply_sample;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairSource {
    /// Bucket, then upstream statistic, then a supplied value.
    #[default]
    Auto,
    Accumulator,
    Upstream,
    Manual,
}

impl RepairSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairSource::Auto => "auto",
            RepairSource::Accumulator => "accumulator",
            RepairSource::Upstream => "upstream",
            RepairSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairRequest {
    pub date: NaiveDate,
    /// Defaults to the whole catalog, or to the keys of `values` for manual repairs.
    #[serde(default)]
    pub items: Option<Vec<String>>,
    #[serde(default)]
    pub source: RepairSource,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    /// Required to replace a record that already exists.
    #[serde(default)]
    pub confirm: bool,
}

impl Pipeline {
    /// Recomputes the records for one closed service day.
    pub async fn repair_day(&self, req: &RepairRequest, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new("repair", req.date, now);

        let open_day = self.clock.service_day(now);
        if req.date >= open_day {
            report.push_err(&PipelineError::InvalidRequest(format!(
                "{} is not a closed service day (current is {open_day})",
                req.date
            )));
            return report.finish();
        }

        let manual_ids: Vec<String>;
        let requested = match (&req.items, req.source) {
            (Some(ids), _) => Some(ids.as_slice()),
            (None, RepairSource::Manual) => {
                manual_ids = req.values.keys().cloned().collect();
                Some(manual_ids.as_slice())
            }
            (None, _) => None,
        };
        let items = match self.catalog.select(requested) {
            Ok(items) => items,
            Err(err) => {
                report.push_err(&err);
                return report.finish();
            }
        };

        for item in items {
            match self.repair_item(item, req, now).await {
                Ok(result) => report.push_ok(result),
                Err(err) => {
                    tracing::warn!(item_id = %item.id, date = %req.date, error = %err, "repair failed for item");
                    report.push_err(&err);
                }
            }
        }

        tracing::info!(
            date = %req.date,
            source = req.source.as_str(),
            repaired = report.results.len(),
            failures = report.errors.len(),
            "repair done"
        );

        self.publish(&mut report, &CacheTag::ALL, now, false).await;
        report.finish()
    }

    async fn repair_item(
        &self,
        item: &TrackedItem,
        req: &RepairRequest,
        now: DateTime<Utc>,
    ) -> Result<ItemResult, PipelineError> {
        let existing = self
            .history
            .get(&item.id, req.date)
            .await
            .map_err(|e| PipelineError::storage(format!("history:{}", item.id), &e))?;
        if existing.is_some() && !req.confirm {
            return Err(PipelineError::RecordExists {
                item_id: item.id.clone(),
                date: req.date,
            });
        }

        let (raw, used) = self.repair_value(item, req).await?;
        let record = DailyPriceRecord::new(item, req.date, raw, now);
        let changed = self
            .history
            .upsert(&record)
            .await
            .map_err(|e| PipelineError::storage(format!("history:{}", item.id), &e))?;

        if used == RepairSource::Accumulator {
            if let Err(err) = self.accumulator.clear(&item.id, req.date).await {
                tracing::warn!(item_id = %item.id, date = %req.date, error = %err, "failed to clear repaired bucket");
            }
        }

        let status = if changed {
            ItemStatus::Written
        } else {
            ItemStatus::Unchanged
        };
        Ok(ItemResult::new(&item.id, status)
            .with_date(req.date)
            .with_price(record.price)
            .with_detail(used.as_str()))
    }

    /// Raw value for the repair plus the source it actually came from.
    async fn repair_value(
        &self,
        item: &TrackedItem,
        req: &RepairRequest,
    ) -> Result<(f64, RepairSource), PipelineError> {
        let missing = |detail: String| PipelineError::UpstreamDataMissing {
            item_id: item.id.clone(),
            detail,
        };

        let try_bucket = matches!(req.source, RepairSource::Auto | RepairSource::Accumulator);
        if try_bucket {
            let bucket = self
                .accumulator
                .bucket(&item.id, req.date)
                .await
                .map_err(|e| PipelineError::storage(format!("accumulator:{}", item.id), &e))?;
            if let Some(v) = bucket.as_ref().and_then(AccumulatorBucket::derive) {
                return Ok((v, RepairSource::Accumulator));
            }
        }

        let try_upstream = matches!(req.source, RepairSource::Auto | RepairSource::Upstream)
            && item.source_kind() == SourceKind::Aggregated;
        if try_upstream {
            let mut throttle = self.throttle();
            if let Some(v) = self.upstream_stat_for(item, req.date, &mut throttle).await {
                return Ok((v, RepairSource::Upstream));
            }
        }

        if matches!(req.source, RepairSource::Auto | RepairSource::Manual) {
            if let Some(&v) = req.values.get(&item.id) {
                if !v.is_finite() || v < 0.0 {
                    return Err(PipelineError::InvalidRequest(format!(
                        "manual value for {} must be a non-negative number",
                        item.id
                    )));
                }
                return Ok((v, RepairSource::Manual));
            }
        }

        Err(missing(format!(
            "no {} value available for {}",
            req.source.as_str(),
            req.date
        )))
    }

    /// Removes every record stored under `date`, e.g. after a boundary misattribution.
    pub async fn delete_wrong_date(&self, date: NaiveDate, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new("delete_date", date, now);

        match self.history.delete_date(date).await {
            Ok(removed) => {
                tracing::info!(%date, removed = removed.len(), "deleted records for date");
                for item_id in removed {
                    report.push_ok(ItemResult::new(item_id, ItemStatus::Deleted).with_date(date));
                }
            }
            Err(err) => {
                let err = PipelineError::storage("history", &err);
                tracing::error!(%date, error = %err, "delete by date failed");
                report.push_err(&err);
                return report.finish();
            }
        }

        self.publish(&mut report, &CacheTag::ALL, now, false).await;
        report.finish()
    }

    /// Removes one record. Ids no longer in the catalog are accepted so orphans can be cleaned up.
    pub async fn delete_record(
        &self,
        item_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> BatchReport {
        let mut report = BatchReport::new("delete_record", date, now);

        if item_id.trim().is_empty() {
            report.push_err(&PipelineError::InvalidRequest(
                "item id must not be empty".to_string(),
            ));
            return report.finish();
        }

        match self.history.delete(item_id, date).await {
            Ok(true) => {
                tracing::info!(item_id, %date, "deleted record");
                report.push_ok(ItemResult::new(item_id, ItemStatus::Deleted).with_date(date));
            }
            Ok(false) => report.push_ok(
                ItemResult::new(item_id, ItemStatus::Kept)
                    .with_date(date)
                    .with_detail("no record for date"),
            ),
            Err(err) => {
                report.push_err(&PipelineError::storage(format!("history:{item_id}"), &err));
                return report.finish();
            }
        }

        self.publish(&mut report, &CacheTag::ALL, now, false).await;
        report.finish()
    }

    /// Seeds newly catalogued items from the upstream's longest trailing window.
    ///
    /// The most recent entry becomes the current day's bucket; the rest go to history
    /// without touching records that already exist.
    pub async fn backfill_new_items(&self, item_ids: &[String], now: DateTime<Utc>) -> BatchReport {
        let today = self.clock.service_day(now);
        let mut report = BatchReport::new("backfill", today, now);

        if item_ids.is_empty() {
            report.push_err(&PipelineError::InvalidRequest(
                "backfill needs at least one item id".to_string(),
            ));
            return report.finish();
        }
        let items = match self.catalog.select(Some(item_ids)) {
            Ok(items) => items,
            Err(err) => {
                report.push_err(&err);
                return report.finish();
            }
        };

        let mut throttle = self.throttle();
        for item in items {
            throttle.wait().await;
            match self.backfill_item(item, today, now).await {
                Ok(result) => report.push_ok(result),
                Err(err) => {
                    tracing::warn!(item_id = %item.id, error = %err, "backfill failed for item");
                    report.push_err(&err);
                }
            }
        }

        self.publish(&mut report, &CacheTag::ALL, now, false).await;
        report.finish()
    }

    async fn backfill_item(
        &self,
        item: &TrackedItem,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ItemResult, PipelineError> {
        let mut stats = self
            .upstream
            .fetch_daily_stats(item, self.backfill_window_days)
            .await?;
        stats.sort_by_key(|s| s.date);

        let Some(current) = stats.pop() else {
            return Err(PipelineError::UpstreamDataMissing {
                item_id: item.id.clone(),
                detail: "upstream returned an empty window".to_string(),
            });
        };

        let acc_err = |e: anyhow::Error| PipelineError::storage(format!("accumulator:{}", item.id), &e);
        self.accumulator
            .clear(&item.id, today)
            .await
            .map_err(acc_err)?;
        let sample = PriceSample {
            item_id: item.id.clone(),
            value: current.average_price,
            observed_at: now,
        };
        apply_sample(self.accumulator.as_ref(), item, today, &sample)
            .await
            .map_err(acc_err)?;

        let mut inserted = 0usize;
        for stat in stats.iter().filter(|s| s.date < today) {
            let record = DailyPriceRecord::new(item, stat.date, stat.average_price, now);
            let added = self
                .history
                .insert_if_absent(&record)
                .await
                .map_err(|e| PipelineError::storage(format!("history:{}", item.id), &e))?;
            if added {
                inserted += 1;
            }
        }

        tracing::info!(
            item_id = %item.id,
            window = stats.len() + 1,
            inserted,
            "backfilled item"
        );

        Ok(ItemResult::new(&item.id, ItemStatus::Seeded)
            .with_date(today)
            .with_price(current.average_price)
            .with_detail(format!("{inserted} history records")))
    }

    /// Flags records written before their service day had closed.
    pub async fn audit_dates(&self, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new("audit", self.clock.service_day(now), now);

        let records = match self.history.all_records().await {
            Ok(records) => records,
            Err(err) => {
                report.push_err(&PipelineError::storage("history", &err));
                return report.finish();
            }
        };

        let checked = records.len();
        for rec in records {
            let written_during = self.clock.service_day(rec.recorded_at);
            if rec.date >= written_during {
                report.push_err(&PipelineError::DateAttributionError {
                    item_id: rec.item_id.clone(),
                    detail: format!(
                        "record for {} written at {} during service day {written_during}",
                        rec.date,
                        rec.recorded_at.to_rfc3339()
                    ),
                });
            }
        }

        tracing::info!(checked, flagged = report.errors.len(), "date audit done");
        report.finish()
    }
}
