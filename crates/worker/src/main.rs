use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use itemwatch_core::config::{PipelineConfig, Settings};
use itemwatch_core::domain::catalog::Catalog;
use itemwatch_core::domain::report::BatchReport;
use itemwatch_core::ingest::HttpUpstreamClient;
use itemwatch_core::pipeline::{Components, Pipeline, RepairRequest, RepairSource};
use itemwatch_core::publish::cache::{
    CacheInvalidator, CloudflarePurger, EdgePurger, HttpRevalidator, NoopInvalidator, NoopPurger,
};
use itemwatch_core::publish::{CacheCoordinator, MemoryObjectStore, SupabaseObjectStore};
use itemwatch_core::storage::{MemoryAccumulatorStore, MemoryHistoryStore};
use itemwatch_core::time::ServiceClock;

#[derive(Debug, Parser)]
#[command(name = "itemwatch_worker")]
struct Args {
    /// Run against in-memory stores; nothing durable is written and no caches are touched.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One sampling pass. Inside the boundary grace window the outgoing day is finalized first.
    Sample,
    /// Finalize a service day (YYYY-MM-DD). Defaults to the day that closed most recently.
    Finalize {
        #[arg(long)]
        date: Option<String>,
    },
    /// Rebuild the latest and history blobs from current store contents.
    Rebuild {
        #[arg(long)]
        force: bool,
        /// Only regenerate history (always rewritten).
        #[arg(long)]
        history_only: bool,
    },
    /// Recompute records for one closed day.
    Repair {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_delimiter = ',')]
        items: Vec<String>,
        /// auto | accumulator | upstream | manual
        #[arg(long, default_value = "auto", value_parser = parse_source)]
        source: RepairSource,
        /// Manual value as ITEM=PRICE; repeatable.
        #[arg(long = "value", value_parser = parse_manual_value)]
        values: Vec<(String, f64)>,
        /// Overwrite records that already exist.
        #[arg(long)]
        confirm: bool,
    },
    /// Delete every record stored under a date.
    DeleteDate {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Delete a single record.
    DeleteRecord {
        #[arg(long)]
        item: String,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Seed newly catalogued items from the upstream trailing window.
    Backfill {
        #[arg(long, value_delimiter = ',', required = true)]
        items: Vec<String>,
    },
    /// Report records whose date was attributed before their service day closed.
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let cfg = PipelineConfig::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let pool = if args.dry_run {
        None
    } else {
        let db_url = settings.require_database_url()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL failed")?;
        itemwatch_core::storage::migrate(&pool).await?;
        Some(pool)
    };

    let components = match &pool {
        Some(pool) => {
            let objects = Arc::new(SupabaseObjectStore::from_settings(&settings)?);
            Components::postgres(pool.clone(), &settings, &cfg, objects, live_cache(&settings)?)?
        }
        None => dry_run_components(&settings, &cfg)?,
    };
    let pipeline = Pipeline::new(components, &cfg);

    let now = Utc::now();
    let report = match args.command {
        Command::Sample => pipeline.on_sampling_tick(now).await,
        Command::Finalize { date } => {
            let day = ServiceClock::resolve_date_arg(
                date.as_deref(),
                pipeline.clock().previous_service_day(now),
            )?;
            pipeline.finalize_day(day, now).await
        }
        Command::Rebuild {
            force,
            history_only,
        } => {
            if history_only {
                pipeline.regenerate_history(now).await
            } else {
                pipeline.rebuild(now, force).await
            }
        }
        Command::Repair {
            date,
            items,
            source,
            values,
            confirm,
        } => {
            let req = RepairRequest {
                date,
                items: (!items.is_empty()).then_some(items),
                source,
                values: values.into_iter().collect::<BTreeMap<_, _>>(),
                confirm,
            };
            pipeline.repair_day(&req, now).await
        }
        Command::DeleteDate { date } => pipeline.delete_wrong_date(date, now).await,
        Command::DeleteRecord { item, date } => pipeline.delete_record(&item, date, now).await,
        Command::Backfill { items } => pipeline.backfill_new_items(&items, now).await,
        Command::Audit => pipeline.audit_dates(now).await,
    };

    if let Some(pool) = &pool {
        if let Err(e) = itemwatch_core::storage::runs::record_run(pool, &report).await {
            sentry_anyhow::capture_anyhow(&e);
            tracing::warn!(error = %e, "failed to record run");
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    finish(&report)
}

/// Non-zero exit when any item or publish step failed, so the invoker can retry.
fn finish(report: &BatchReport) -> anyhow::Result<()> {
    if report.success {
        tracing::info!(
            run_id = %report.run_id,
            operation = %report.operation,
            results = report.results.len(),
            "run finished"
        );
        return Ok(());
    }
    let nested = report.finalized.as_ref().map_or(0, |f| f.errors.len());
    tracing::error!(
        run_id = %report.run_id,
        operation = %report.operation,
        errors = report.errors.len(),
        nested_errors = nested,
        "run finished with errors"
    );
    anyhow::bail!(
        "{} reported {} error(s)",
        report.operation,
        report.errors.len() + nested
    )
}

fn live_cache(settings: &Settings) -> anyhow::Result<CacheCoordinator> {
    let app: Arc<dyn CacheInvalidator> = match HttpRevalidator::from_settings(settings)? {
        Some(r) => Arc::new(r),
        None => {
            tracing::warn!("REVALIDATE_URL missing; API tag cache will expire on TTL");
            Arc::new(NoopInvalidator)
        }
    };
    let edge: Arc<dyn EdgePurger> = match CloudflarePurger::from_settings(settings)? {
        Some(p) => Arc::new(p),
        None => {
            tracing::warn!("CLOUDFLARE_ZONE_ID/CLOUDFLARE_API_TOKEN missing; edge purge disabled");
            Arc::new(NoopPurger)
        }
    };
    Ok(CacheCoordinator::new(app, edge))
}

fn dry_run_components(settings: &Settings, cfg: &PipelineConfig) -> anyhow::Result<Components> {
    tracing::info!(dry_run = true, "using in-memory stores");
    Ok(Components {
        catalog: Arc::new(Catalog::load(settings.catalog_path.as_deref())?),
        upstream: Arc::new(HttpUpstreamClient::from_settings(settings, cfg)?),
        accumulator: Arc::new(MemoryAccumulatorStore::new()),
        history: Arc::new(MemoryHistoryStore::new()),
        objects: Arc::new(MemoryObjectStore::new()),
        cache: CacheCoordinator::noop(),
    })
}

fn parse_source(s: &str) -> Result<RepairSource, String> {
    serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
        .map_err(|_| format!("unknown repair source {s:?}"))
}

fn parse_manual_value(s: &str) -> Result<(String, f64), String> {
    let (item, price) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ITEM=PRICE, got {s:?}"))?;
    let price: f64 = price
        .trim()
        .parse()
        .map_err(|_| format!("invalid price in {s:?}"))?;
    Ok((item.trim().to_string(), price))
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manual_values() {
        assert_eq!(
            parse_manual_value("gold_ingot=1234.5").unwrap(),
            ("gold_ingot".to_string(), 1234.5)
        );
        assert!(parse_manual_value("gold_ingot").is_err());
        assert!(parse_manual_value("gold_ingot=abc").is_err());
    }

    #[test]
    fn parses_sources() {
        assert_eq!(parse_source("Upstream").unwrap(), RepairSource::Upstream);
        assert!(parse_source("guess").is_err());
    }

    #[test]
    fn repair_command_line() {
        let args = Args::try_parse_from([
            "itemwatch_worker",
            "repair",
            "--date",
            "2026-03-08",
            "--items",
            "gold_ingot,premium_token",
            "--source",
            "manual",
            "--value",
            "gold_ingot=1200",
            "--confirm",
        ])
        .unwrap();
        let Command::Repair {
            date,
            items,
            source,
            values,
            confirm,
        } = args.command
        else {
            panic!("expected repair");
        };
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 8).unwrap());
        assert_eq!(items, vec!["gold_ingot", "premium_token"]);
        assert_eq!(source, RepairSource::Manual);
        assert_eq!(values, vec![("gold_ingot".to_string(), 1200.0)]);
        assert!(confirm);
        assert!(!args.dry_run);
    }

    #[test]
    fn dry_run_is_global() {
        let args = Args::try_parse_from(["itemwatch_worker", "sample", "--dry-run"]).unwrap();
        assert!(args.dry_run);
        assert!(matches!(args.command, Command::Sample));
    }
}
