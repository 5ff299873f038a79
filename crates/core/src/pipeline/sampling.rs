use super::Pipeline;
use crate::domain::price::PriceSample;
use crate::domain::report::{BatchReport, ItemResult, ItemStatus};
use crate::error::PipelineError;
use crate::publish::CacheTag;
use crate::storage::apply_sample;
use chrono::{DateTime, Duration, Utc};

const MAX_LOGGED_FAILURES: usize = 10;

impl Pipeline {
    /// One sampling pass over the whole catalog.
    ///
    /// Inside the boundary grace window the outgoing day is finalized first, so no
    /// new-day sample is ever folded into the previous day's bucket.
    pub async fn on_sampling_tick(&self, now: DateTime<Utc>) -> BatchReport {
        let service_day = self.clock.service_day(now);
        let mut report = BatchReport::new("sample", service_day, now);

        if self.clock.in_grace_window(now) {
            let outgoing = service_day - Duration::days(1);
            tracing::info!(%outgoing, "tick inside boundary grace window; finalizing first");
            report.finalized = Some(Box::new(self.finalize_day(outgoing, now).await));
        }

        let mut throttle = self.throttle();
        let total = self.catalog.len();
        let mut failures: usize = 0;

        for item in self.catalog.items() {
            // A late invocation whose clock still reads the closed day must not reopen it.
            match self.history.get(&item.id, service_day).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    tracing::warn!(item_id = %item.id, %service_day, "service day already finalized; sample skipped");
                    report.push_ok(
                        ItemResult::new(&item.id, ItemStatus::Kept)
                            .with_date(service_day)
                            .with_detail("service day already finalized"),
                    );
                    continue;
                }
                Err(err) => {
                    failures += 1;
                    let err = PipelineError::storage(format!("history:{}", item.id), &err);
                    tracing::warn!(item_id = %item.id, error = %err, "history lookup failed");
                    report.push_err(&err);
                    continue;
                }
            }

            throttle.wait().await;

            let value = match self.upstream.fetch_price(item).await {
                Ok(v) => v,
                Err(err) => {
                    failures += 1;
                    if failures <= MAX_LOGGED_FAILURES {
                        tracing::warn!(
                            item_id = %item.id,
                            failure_count = failures,
                            error = %err,
                            "upstream fetch failed; skipping item"
                        );
                    }
                    report.push_err(&err);
                    continue;
                }
            };

            let sample = PriceSample {
                item_id: item.id.clone(),
                value,
                observed_at: now,
            };
            match apply_sample(self.accumulator.as_ref(), item, service_day, &sample).await {
                Ok(()) => report.push_ok(
                    ItemResult::new(&item.id, ItemStatus::Sampled)
                        .with_date(service_day)
                        .with_price(value),
                ),
                Err(err) => {
                    failures += 1;
                    let err = PipelineError::storage(format!("accumulator:{}", item.id), &err);
                    tracing::warn!(item_id = %item.id, error = %err, "accumulator write failed");
                    report.push_err(&err);
                }
            }
        }

        tracing::info!(
            %service_day,
            total,
            sampled = report.results.len(),
            failures,
            "sampling pass done"
        );

        self.publish(&mut report, &[CacheTag::Latest], now, false).await;
        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::price::BucketValues;
    use crate::domain::report::ItemStatus;
    use crate::error::ErrorKind;
    use crate::storage::{AccumulatorStore, HistoryStore};
    use crate::testing::{d, harness, utc};

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let h = harness();
        h.upstream.set_price("gold", 1000.0);
        h.upstream.set_price("token", 2.5);
        h.upstream.set_price("feather", 100.0);
        h.upstream.fail("token");

        let report = h.pipeline.on_sampling_tick(utc(10, 12, 0)).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item_id.as_deref(), Some("token"));
        assert_eq!(report.errors[0].kind, ErrorKind::UpstreamUnavailable);
        assert!(!report.success);
        assert_eq!(h.upstream.calls(), 3);
        assert!(h.acc.bucket("token", d(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_and_append_by_kind() {
        let h = harness();
        h.upstream.set_price("gold", 1000.0);
        h.upstream.set_price("token", 2.5);
        h.upstream.set_price("feather", 100.0);
        h.pipeline.on_sampling_tick(utc(10, 12, 0)).await;

        h.upstream.set_price("gold", 1010.0);
        h.upstream.set_price("feather", 110.0);
        let report = h.pipeline.on_sampling_tick(utc(10, 12, 10)).await;
        assert!(report.success);
        assert!(report.results.iter().all(|r| r.status == ItemStatus::Sampled));

        let gold = h.acc.bucket("gold", d(10)).await.unwrap().unwrap();
        assert_eq!(gold.values, BucketValues::Latest(1010.0));
        let feather = h.acc.bucket("feather", d(10)).await.unwrap().unwrap();
        assert_eq!(feather.values, BucketValues::Samples(vec![100.0, 110.0]));
    }

    #[tokio::test]
    async fn ticks_straddling_boundary_use_different_buckets() {
        let h = harness();
        h.upstream.set_price("feather", 100.0);
        h.pipeline.on_sampling_tick(utc(10, 5, 50)).await;
        h.upstream.set_price("feather", 120.0);
        h.pipeline.on_sampling_tick(utc(10, 6, 10)).await;

        // The 06:10 tick finalized the 05:50 sample under the 9th, then sampled into the 10th.
        let finalized = h.hist.get("feather", d(9)).await.unwrap().unwrap();
        assert_eq!(finalized.price, 100.0);
        assert!(h.acc.bucket("feather", d(9)).await.unwrap().is_none());
        let today = h.acc.bucket("feather", d(10)).await.unwrap().unwrap();
        assert_eq!(today.values, BucketValues::Samples(vec![120.0]));
    }

    #[tokio::test]
    async fn grace_window_finalizes_before_sampling() {
        let h = harness();
        h.upstream.set_price("gold", 1000.0);
        h.pipeline.on_sampling_tick(utc(10, 22, 0)).await;

        h.upstream.set_price("gold", 1100.0);
        let report = h.pipeline.on_sampling_tick(utc(11, 6, 5)).await;
        let finalized = report.finalized.as_ref().expect("finalize ran");
        assert_eq!(finalized.service_day, d(10));

        let record = h.hist.get("gold", d(10)).await.unwrap().unwrap();
        assert_eq!(record.price, 1000.0);

        // Outside the window no finalization is attempted.
        let later = h.pipeline.on_sampling_tick(utc(11, 8, 0)).await;
        assert!(later.finalized.is_none());
    }

    #[tokio::test]
    async fn tick_publishes_latest() {
        let h = harness();
        h.upstream.set_price("gold", 1000.4);
        h.upstream.set_price("token", 2.46);
        let report = h.pipeline.on_sampling_tick(utc(10, 12, 0)).await;
        assert_eq!(report.published.len(), 1);

        let latest = h.blob("latest.json").await.unwrap();
        assert_eq!(latest["gold"], serde_json::json!(1000));
        assert_eq!(latest["token"], serde_json::json!(2.5));
        assert_eq!(latest["_meta"]["date"], "2026-03-10");
    }

    #[tokio::test]
    async fn overlapping_ticks_leave_closed_day_alone() {
        let h = harness();
        h.upstream.set_price("feather", 140.0);
        h.acc.append("feather", d(9), 100.0, utc(9, 12, 0)).await.unwrap();
        h.acc.append("feather", d(9), 120.0, utc(9, 13, 0)).await.unwrap();

        h.pipeline.on_sampling_tick(utc(10, 6, 5)).await;
        assert_eq!(h.hist.get("feather", d(9)).await.unwrap().unwrap().price, 110.0);

        // A slow invocation started just before the boundary lands after finalize.
        h.upstream.set_price("feather", 130.0);
        let late = h.pipeline.on_sampling_tick(utc(10, 5, 58)).await;
        let feather = late.results.iter().find(|r| r.item_id == "feather").unwrap();
        assert_eq!(feather.status, ItemStatus::Kept);
        assert!(h.acc.bucket("feather", d(9)).await.unwrap().is_none());

        h.pipeline.on_sampling_tick(utc(10, 6, 15)).await;
        assert_eq!(h.hist.get("feather", d(9)).await.unwrap().unwrap().price, 110.0);
        assert!(h.acc.bucket("feather", d(9)).await.unwrap().is_none());
    }
}
