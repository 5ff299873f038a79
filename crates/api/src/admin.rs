use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use itemwatch_core::domain::report::BatchReport;
use itemwatch_core::pipeline::{Pipeline, RepairRequest};
use itemwatch_core::publish::cache::{CacheInvalidator, CacheTag};
use itemwatch_core::time::ServiceClock;

use crate::AppState;

type AdminResult = Result<Json<BatchReport>, StatusCode>;

impl AppState {
    fn pipeline(&self) -> Result<Arc<Pipeline>, StatusCode> {
        self.pipeline.clone().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }

    /// Records the run in the ledger (best effort) and hands the report back.
    async fn finish(&self, report: BatchReport) -> Json<BatchReport> {
        tracing::info!(
            run_id = %report.run_id,
            operation = %report.operation,
            success = report.success,
            results = report.results.len(),
            errors = report.errors.len(),
            "admin operation finished"
        );
        if let Some(pool) = &self.pool {
            if let Err(e) = itemwatch_core::storage::runs::record_run(pool, &report).await {
                sentry_anyhow::capture_anyhow(&e);
                tracing::warn!(error = %e, "failed to record run");
            }
        }
        Json(report)
    }
}

pub async fn sample(State(state): State<AppState>) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.on_sampling_tick(Utc::now()).await;
    Ok(state.finish(report).await)
}

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeBody {
    #[serde(default)]
    date: Option<String>,
}

pub async fn finalize(
    State(state): State<AppState>,
    body: Option<Json<FinalizeBody>>,
) -> AdminResult {
    let pipeline = state.pipeline()?;
    let now = Utc::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let day = ServiceClock::resolve_date_arg(
        body.date.as_deref(),
        pipeline.clock().previous_service_day(now),
    )
    .map_err(|_| StatusCode::BAD_REQUEST)?;

    let report = pipeline.finalize_day(day, now).await;
    Ok(state.finish(report).await)
}

pub async fn regenerate_history(State(state): State<AppState>) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.regenerate_history(Utc::now()).await;
    Ok(state.finish(report).await)
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((item_id, date)): Path<(String, String)>,
) -> AdminResult {
    let pipeline = state.pipeline()?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)?;
    let report = pipeline.delete_record(&item_id, date, Utc::now()).await;
    Ok(state.finish(report).await)
}

pub async fn repair(State(state): State<AppState>, Json(req): Json<RepairRequest>) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.repair_day(&req, Utc::now()).await;
    Ok(state.finish(report).await)
}

#[derive(Debug, Deserialize)]
pub struct DeleteDateBody {
    date: NaiveDate,
}

pub async fn delete_date(
    State(state): State<AppState>,
    Json(body): Json<DeleteDateBody>,
) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.delete_wrong_date(body.date, Utc::now()).await;
    Ok(state.finish(report).await)
}

#[derive(Debug, Deserialize)]
pub struct BackfillBody {
    item_ids: Vec<String>,
}

pub async fn backfill(
    State(state): State<AppState>,
    Json(body): Json<BackfillBody>,
) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.backfill_new_items(&body.item_ids, Utc::now()).await;
    Ok(state.finish(report).await)
}

pub async fn audit(State(state): State<AppState>) -> AdminResult {
    let pipeline = state.pipeline()?;
    let report = pipeline.audit_dates(Utc::now()).await;
    Ok(state.finish(report).await)
}

#[derive(Debug, Deserialize)]
pub struct RevalidateBody {
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Revalidated {
    revalidated: Vec<CacheTag>,
}

/// Marks this process's tag-cache entries stale. Called by the worker after it publishes.
pub async fn revalidate(
    State(state): State<AppState>,
    Json(body): Json<RevalidateBody>,
) -> Result<Json<Revalidated>, StatusCode> {
    let tags = parse_tags(&body.tags).ok_or(StatusCode::BAD_REQUEST)?;
    state.reader.invalidate_tags(&tags).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    tracing::info!(?tags, "revalidated tags");
    Ok(Json(Revalidated { revalidated: tags }))
}

fn parse_tags(raw: &[String]) -> Option<Vec<CacheTag>> {
    let mut tags = Vec::with_capacity(raw.len());
    for s in raw {
        let tag = CacheTag::parse(s)?;
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    (!tags.is_empty()).then_some(tags)
}
