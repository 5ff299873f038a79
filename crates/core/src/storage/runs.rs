use crate::domain::report::BatchReport;
use anyhow::Context;
use chrono::Utc;

/// Appends a finished report to the run ledger.
pub async fn record_run(pool: &sqlx::PgPool, report: &BatchReport) -> anyhow::Result<()> {
    let raw = serde_json::to_value(report).context("serialize batch report failed")?;
    let error_count = i32::try_from(report.errors.len()).unwrap_or(i32::MAX);

    sqlx::query(
        "INSERT INTO pipeline_runs (id, operation, service_day, started_at, finished_at, success, error_count, report) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (id) DO NOTHING",
    )
    .persistent(false)
    .bind(report.run_id)
    .bind(&report.operation)
    .bind(report.service_day)
    .bind(report.started_at)
    .bind(Utc::now())
    .bind(report.success)
    .bind(error_count)
    .bind(raw)
    .execute(pool)
    .await
    .context("insert pipeline_runs failed")?;

    Ok(())
}
