use super::Pipeline;
use crate::domain::catalog::{SourceKind, TrackedItem};
use crate::domain::price::{AccumulatorBucket, DailyPriceRecord};
use crate::domain::report::{BatchReport, ItemResult, ItemStatus};
use crate::error::PipelineError;
use crate::ingest::upstream::SHORT_WINDOW_DAYS;
use crate::ingest::Throttle;
use crate::publish::CacheTag;
use chrono::{DateTime, NaiveDate, Utc};

impl Pipeline {
    /// Promotes each item's bucket for `day` into one history record.
    ///
    /// Safe to re-run: a second run over the same inputs stores the same records and
    /// republishes nothing.
    pub async fn finalize_day(&self, day: NaiveDate, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new("finalize", day, now);

        let open_day = self.clock.service_day(now);
        if day >= open_day {
            report.push_err(&PipelineError::InvalidRequest(format!(
                "{day} is not a closed service day (current is {open_day})"
            )));
            return report.finish();
        }

        let mut throttle = self.throttle();

        for item in self.catalog.items() {
            match self.finalize_item(item, day, now, &mut throttle).await {
                Ok(result) => report.push_ok(result),
                Err(err) => {
                    tracing::warn!(item_id = %item.id, %day, error = %err, "finalize failed for item");
                    report.push_err(&err);
                }
            }
        }

        tracing::info!(
            %day,
            finalized = report.results.len(),
            failures = report.errors.len(),
            "finalize pass done"
        );

        self.publish(&mut report, &CacheTag::ALL, now, false).await;
        report.finish()
    }

    async fn finalize_item(
        &self,
        item: &TrackedItem,
        day: NaiveDate,
        now: DateTime<Utc>,
        throttle: &mut Throttle,
    ) -> Result<ItemResult, PipelineError> {
        let existing = self
            .history
            .get(&item.id, day)
            .await
            .map_err(|e| PipelineError::storage(format!("history:{}", item.id), &e))?;
        let bucket = self
            .accumulator
            .bucket(&item.id, day)
            .await
            .map_err(|e| PipelineError::storage(format!("accumulator:{}", item.id), &e))?;

        // A closed day is only ever changed through repair; leftovers from overlapping
        // ticks are dropped whatever their timestamps say.
        if let Some(rec) = existing {
            if let Some(b) = &bucket {
                tracing::warn!(
                    item_id = %item.id,
                    %day,
                    late_samples = b.sample_count(),
                    "discarding samples for an already finalized day"
                );
                self.clear_bucket(item, day).await;
            }
            return Ok(ItemResult::new(&item.id, ItemStatus::Kept)
                .with_date(day)
                .with_price(rec.price));
        }

        let upstream_stat = match item.source_kind() {
            SourceKind::Aggregated => self.upstream_stat_for(item, day, throttle).await,
            SourceKind::RawSample => None,
        };

        let raw = upstream_stat.or_else(|| bucket.as_ref().and_then(AccumulatorBucket::derive));
        let Some(raw) = raw else {
            return Err(PipelineError::UpstreamDataMissing {
                item_id: item.id.clone(),
                detail: format!("no samples or upstream statistic for {day}"),
            });
        };

        let record = DailyPriceRecord::new(item, day, raw, now);
        let changed = self
            .history
            .upsert(&record)
            .await
            .map_err(|e| PipelineError::storage(format!("history:{}", item.id), &e))?;

        if bucket.is_some() {
            self.clear_bucket(item, day).await;
        }

        let status = if changed {
            ItemStatus::Written
        } else {
            ItemStatus::Unchanged
        };
        let mut result = ItemResult::new(&item.id, status)
            .with_date(day)
            .with_price(record.price);
        if upstream_stat.is_some() {
            result = result.with_detail("upstream daily statistic");
        }
        Ok(result)
    }

    /// The upstream's own statistic for exactly `day`, if it has one.
    pub(crate) async fn upstream_stat_for(
        &self,
        item: &TrackedItem,
        day: NaiveDate,
        throttle: &mut Throttle,
    ) -> Option<f64> {
        throttle.wait().await;
        match self.upstream.fetch_daily_stats(item, SHORT_WINDOW_DAYS).await {
            Ok(stats) => stats
                .into_iter()
                .find(|s| s.date == day)
                .map(|s| s.average_price),
            Err(err) => {
                tracing::warn!(item_id = %item.id, %day, error = %err, "upstream statistic unavailable; using bucket");
                None
            }
        }
    }

    async fn clear_bucket(&self, item: &TrackedItem, day: NaiveDate) {
        // A leftover bucket only makes the next run redo the same computation.
        if let Err(err) = self.accumulator.clear(&item.id, day).await {
            tracing::warn!(item_id = %item.id, %day, error = %err, "failed to clear accumulator bucket");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::report::ItemStatus;
    use crate::error::ErrorKind;
    use crate::publish::PublishStatus;
    use crate::storage::{AccumulatorStore, HistoryStore};
    use crate::testing::{d, harness, utc};

    #[tokio::test]
    async fn raw_sample_day_finalizes_to_mean() {
        let h = harness();
        for (minute, price) in [(0, 100.0), (10, 110.0), (20, 120.0)] {
            h.acc.append("feather", d(9), price, utc(9, 12, minute)).await.unwrap();
        }

        let report = h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        let feather = report.results.iter().find(|r| r.item_id == "feather").unwrap();
        assert_eq!(feather.status, ItemStatus::Written);
        assert_eq!(feather.price, Some(110.0));
        assert_eq!(h.hist.get("feather", d(9)).await.unwrap().unwrap().price, 110.0);
        assert!(h.acc.bucket("feather", d(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let h = harness();
        h.acc.overwrite("gold", d(9), 1000.0, utc(9, 23, 0)).await.unwrap();
        h.acc.overwrite("token", d(9), 2.44, utc(9, 23, 0)).await.unwrap();
        h.acc.append("feather", d(9), 100.0, utc(9, 12, 0)).await.unwrap();
        h.acc.append("feather", d(9), 105.0, utc(9, 13, 0)).await.unwrap();

        let first = h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        assert!(first.success);
        let history_after_first = h.objects.object("history.json").await.unwrap().body;
        let records_after_first = h.hist.all_records().await.unwrap();

        let second = h.pipeline.finalize_day(d(9), utc(10, 6, 35)).await;
        assert!(second.success);
        assert!(second
            .results
            .iter()
            .all(|r| matches!(r.status, ItemStatus::Kept | ItemStatus::Unchanged)));
        assert!(second
            .published
            .iter()
            .any(|p| p.tag == crate::publish::CacheTag::History && p.status == PublishStatus::Unchanged));

        assert_eq!(h.objects.object("history.json").await.unwrap().body, history_after_first);
        assert_eq!(h.hist.all_records().await.unwrap(), records_after_first);
    }

    #[tokio::test]
    async fn upstream_statistic_overrides_bucket() {
        let h = harness();
        h.acc.overwrite("gold", d(9), 1000.0, utc(9, 23, 0)).await.unwrap();
        h.upstream.set_stats("gold", &[(8, 990.0), (9, 1004.6)]);

        let report = h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        let gold = report.results.iter().find(|r| r.item_id == "gold").unwrap();
        assert_eq!(gold.price, Some(1005.0));
        assert_eq!(gold.detail.as_deref(), Some("upstream daily statistic"));
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_bucket() {
        let h = harness();
        h.acc.overwrite("gold", d(9), 1000.0, utc(9, 23, 0)).await.unwrap();
        h.upstream.fail("gold");

        let report = h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        let gold = report.results.iter().find(|r| r.item_id == "gold").unwrap();
        assert_eq!(gold.price, Some(1000.0));
    }

    #[tokio::test]
    async fn rounding_by_precision() {
        let h = harness();
        h.acc.overwrite("gold", d(9), 1234.56, utc(9, 23, 0)).await.unwrap();
        h.acc.overwrite("token", d(9), 2.4567, utc(9, 23, 0)).await.unwrap();
        h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;

        assert_eq!(h.hist.get("gold", d(9)).await.unwrap().unwrap().price, 1235.0);
        assert_eq!(h.hist.get("token", d(9)).await.unwrap().unwrap().price, 2.5);

        let history = h.blob("history.json").await.unwrap();
        assert_eq!(history["gold"][0]["price"].to_string(), "1235");
        assert_eq!(history["token"][0]["price"].to_string(), "2.5");
    }

    #[tokio::test]
    async fn missing_data_is_reported_per_item() {
        let h = harness();
        h.acc.append("feather", d(9), 100.0, utc(9, 12, 0)).await.unwrap();

        let report = h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| e.kind == ErrorKind::UpstreamDataMissing));
    }

    #[tokio::test]
    async fn leftover_samples_never_replace_record() {
        let h = harness();
        h.acc.append("feather", d(9), 100.0, utc(9, 12, 0)).await.unwrap();
        h.acc.append("feather", d(9), 120.0, utc(9, 13, 0)).await.unwrap();
        h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;

        // An overlapping invocation stamps its sample with its own, pre-boundary clock.
        h.acc.append("feather", d(9), 130.0, utc(10, 5, 58)).await.unwrap();
        let report = h.pipeline.finalize_day(d(9), utc(10, 6, 15)).await;

        let feather = report.results.iter().find(|r| r.item_id == "feather").unwrap();
        assert_eq!(feather.status, ItemStatus::Kept);
        assert_eq!(h.hist.get("feather", d(9)).await.unwrap().unwrap().price, 110.0);
        assert!(h.acc.bucket("feather", d(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_day_is_rejected() {
        let h = harness();
        h.acc.append("feather", d(10), 100.0, utc(10, 8, 0)).await.unwrap();

        let report = h.pipeline.finalize_day(d(10), utc(10, 9, 0)).await;
        assert!(!report.success);
        assert_eq!(report.errors[0].kind, ErrorKind::InvalidRequest);
        assert!(report.published.is_empty());
        assert!(h.hist.get("feather", d(10)).await.unwrap().is_none());

        // The day keeps accumulating and closes normally.
        h.acc.append("feather", d(10), 200.0, utc(10, 12, 0)).await.unwrap();
        h.acc.append("feather", d(10), 300.0, utc(10, 18, 0)).await.unwrap();
        h.pipeline.finalize_day(d(10), utc(11, 6, 5)).await;
        assert_eq!(h.hist.get("feather", d(10)).await.unwrap().unwrap().price, 200.0);
    }

    #[tokio::test]
    async fn finalized_day_skips_upstream() {
        let h = harness();
        h.acc.overwrite("gold", d(9), 1000.0, utc(9, 23, 0)).await.unwrap();
        h.pipeline.finalize_day(d(9), utc(10, 6, 5)).await;
        let after_first = h.upstream.calls();

        h.pipeline.finalize_day(d(9), utc(10, 6, 15)).await;
        h.pipeline.finalize_day(d(9), utc(10, 6, 25)).await;
        // Only token, which never got a record, is looked up again.
        assert_eq!(h.upstream.calls(), after_first + 2);
    }
}
