//! Sampling, finalization and repair, wired over explicitly constructed components.
//!
//! Every operation returns a [`BatchReport`]; per-item failures land in its `errors`
//! and never abort the remaining items.

use crate::config::{PipelineConfig, Settings};
use crate::domain::catalog::Catalog;
use crate::domain::report::BatchReport;
use crate::ingest::{HttpUpstreamClient, Throttle, UpstreamClient};
use crate::publish::object_store::ObjectStore;
use crate::publish::{CacheCoordinator, CacheTag, PublishStatus, SnapshotBuilder};
use crate::storage::{AccumulatorStore, HistoryStore, PgAccumulatorStore, PgHistoryStore};
use crate::time::ServiceClock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

mod finalize;
pub mod repair;
mod sampling;

pub use repair::{RepairRequest, RepairSource};

pub struct Components {
    pub catalog: Arc<Catalog>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub accumulator: Arc<dyn AccumulatorStore>,
    pub history: Arc<dyn HistoryStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub cache: CacheCoordinator,
}

impl Components {
    /// Production wiring: Postgres-backed stores and the HTTP upstream client.
    pub fn postgres(
        pool: sqlx::PgPool,
        settings: &Settings,
        cfg: &PipelineConfig,
        objects: Arc<dyn ObjectStore>,
        cache: CacheCoordinator,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            catalog: Arc::new(Catalog::load(settings.catalog_path.as_deref())?),
            upstream: Arc::new(HttpUpstreamClient::from_settings(settings, cfg)?),
            accumulator: Arc::new(PgAccumulatorStore::new(pool.clone())),
            history: Arc::new(PgHistoryStore::new(pool)),
            objects,
            cache,
        })
    }
}

pub struct Pipeline {
    catalog: Arc<Catalog>,
    upstream: Arc<dyn UpstreamClient>,
    accumulator: Arc<dyn AccumulatorStore>,
    history: Arc<dyn HistoryStore>,
    snapshots: SnapshotBuilder,
    cache: CacheCoordinator,
    clock: ServiceClock,
    request_delay: Duration,
    backfill_window_days: u32,
}

impl Pipeline {
    pub fn new(components: Components, cfg: &PipelineConfig) -> Self {
        let Components {
            catalog,
            upstream,
            accumulator,
            history,
            objects,
            cache,
        } = components;

        let snapshots = SnapshotBuilder::new(
            catalog.clone(),
            accumulator.clone(),
            history.clone(),
            objects,
        );

        Self {
            catalog,
            upstream,
            accumulator,
            history,
            snapshots,
            cache,
            clock: ServiceClock::from_config(cfg),
            request_delay: cfg.request_delay,
            backfill_window_days: cfg.backfill_window_days,
        }
    }

    pub fn clock(&self) -> &ServiceClock {
        &self.clock
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn throttle(&self) -> Throttle {
        Throttle::new(self.request_delay)
    }

    /// Rebuilds `tags` and invalidates whichever blobs were actually rewritten.
    async fn publish(
        &self,
        report: &mut BatchReport,
        tags: &[CacheTag],
        now: DateTime<Utc>,
        force: bool,
    ) {
        let as_of = self.clock.service_day(now);
        let mut written = Vec::with_capacity(tags.len());

        for tag in tags {
            let res = match tag {
                CacheTag::Latest => self.snapshots.rebuild_latest(as_of, now, force).await,
                CacheTag::History => self.snapshots.rebuild_history(force).await,
            };
            match res {
                Ok(outcome) => {
                    if outcome.status == PublishStatus::Written {
                        written.push(*tag);
                    }
                    report.published.push(outcome);
                }
                Err(err) => {
                    tracing::error!(tag = tag.as_str(), error = %err, "snapshot rebuild failed");
                    report.push_err(&err);
                }
            }
        }

        if let Err(err) = self.cache.after_rebuild(&written).await {
            tracing::error!(error = %err, "cache invalidation failed");
            report.push_err(&err);
        }
    }

    /// Rewrites both blobs from current store contents.
    pub async fn rebuild(&self, now: DateTime<Utc>, force: bool) -> BatchReport {
        let mut report = BatchReport::new("rebuild", self.clock.service_day(now), now);
        self.publish(&mut report, &CacheTag::ALL, now, force).await;
        report.finish()
    }

    /// Forced, wholesale history regeneration.
    pub async fn regenerate_history(&self, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new("regenerate_history", self.clock.service_day(now), now);
        self.publish(&mut report, &[CacheTag::History], now, true).await;
        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::publish::PublishStatus;
    use crate::testing::{harness, utc};

    #[tokio::test]
    async fn cold_read_after_rebuild_matches_blob() {
        let h = harness();
        h.upstream.set_price("gold", 1000.0);
        h.pipeline.on_sampling_tick(utc(10, 12, 0)).await;

        let report = h.pipeline.rebuild(utc(10, 12, 1), true).await;
        assert!(report.success);

        let reader = crate::publish::SnapshotReader::new(
            h.objects.clone(),
            std::time::Duration::from_secs(300),
            std::time::Duration::from_secs(30),
        );
        for tag in crate::publish::CacheTag::ALL {
            let read = reader.read(tag).await.unwrap();
            let stored = h.objects.object(tag.object_key()).await.unwrap();
            assert_eq!(read.as_slice(), stored.body.as_slice());
        }
    }

    #[tokio::test]
    async fn regenerate_history_always_writes() {
        let h = harness();
        let first = h.pipeline.regenerate_history(utc(10, 12, 0)).await;
        let second = h.pipeline.regenerate_history(utc(10, 12, 1)).await;
        assert_eq!(first.published[0].status, PublishStatus::Written);
        assert_eq!(second.published[0].status, PublishStatus::Written);
        assert_eq!(h.objects.put_count().await, 2);
    }
}
