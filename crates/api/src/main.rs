use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use itemwatch_core::config::{PipelineConfig, Settings};
use itemwatch_core::pipeline::{Components, Pipeline};
use itemwatch_core::publish::cache::{
    CacheInvalidator, CloudflarePurger, EdgePurger, NoopPurger,
};
use itemwatch_core::publish::object_store::ObjectStore;
use itemwatch_core::publish::reader::ReadError;
use itemwatch_core::publish::{CacheCoordinator, CacheTag, SnapshotReader, SupabaseObjectStore};

mod admin;
mod auth;

use auth::AuthToken;

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

    // Without the object store there is nothing to serve.
    let objects: Arc<dyn ObjectStore> = Arc::new(SupabaseObjectStore::from_settings(&settings)?);
    let reader = Arc::new(SnapshotReader::new(
        objects.clone(),
        cfg.app_cache_ttl,
        cfg.burst_cache_ttl,
    ));

    let edge: Arc<dyn EdgePurger> = match CloudflarePurger::from_settings(&settings)? {
        Some(purger) => Arc::new(purger),
        None => {
            tracing::warn!("CLOUDFLARE_ZONE_ID/CLOUDFLARE_API_TOKEN missing; edge purge disabled");
            Arc::new(NoopPurger)
        }
    };
    let app_cache: Arc<dyn CacheInvalidator> = reader.clone();
    let cache = CacheCoordinator::new(app_cache, edge);

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match itemwatch_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; admin routes disabled");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; admin routes disabled");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; admin routes disabled");
            None
        }
    };

    let pipeline = match &pool {
        Some(pool) => {
            match Components::postgres(pool.clone(), &settings, &cfg, objects.clone(), cache) {
                Ok(components) => Some(Arc::new(Pipeline::new(components, &cfg))),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "pipeline setup failed; admin routes disabled");
                    None
                }
            }
        }
        None => None,
    };

    let token = settings.admin_token.clone().unwrap_or_default();
    if token.is_empty() {
        tracing::warn!("ADMIN_TOKEN unset; admin routes are unauthenticated");
    }

    let state = AppState {
        pipeline,
        reader,
        pool,
    };

    let admin_routes = Router::new()
        .route("/sample", post(admin::sample))
        .route("/finalize", post(admin::finalize))
        .route("/history/regenerate", post(admin::regenerate_history))
        .route("/records/:item_id/:date", delete(admin::delete_record))
        .route("/repair", post(admin::repair))
        .route("/delete-date", post(admin::delete_date))
        .route("/backfill", post(admin::backfill))
        .route("/audit", get(admin::audit))
        .route("/revalidate", post(admin::revalidate))
        .layer(middleware::from_fn(auth::require_admin))
        .layer(axum::Extension(AuthToken(token)));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/data/latest", get(get_latest))
        .route("/data/history", get(get_history))
        .nest("/admin", admin_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// `None` when the database or upstream is not configured; admin routes answer 503.
    pipeline: Option<Arc<Pipeline>>,
    reader: Arc<SnapshotReader>,
    pool: Option<PgPool>,
}

async fn get_latest(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    serve_snapshot(&state, CacheTag::Latest).await
}

async fn get_history(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    serve_snapshot(&state, CacheTag::History).await
}

/// Per-item detail never reaches readers: any failure is a bare 500.
async fn serve_snapshot(
    state: &AppState,
    tag: CacheTag,
) -> Result<impl IntoResponse, StatusCode> {
    match state.reader.read(tag).await {
        Ok(body) => Ok((
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, tag.cache_control()),
            ],
            body.as_ref().clone(),
        )),
        Err(ReadError::Missing) => {
            tracing::error!(tag = tag.as_str(), "snapshot missing from object store");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(ReadError::Unavailable(e)) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(tag = tag.as_str(), error = %e, "snapshot unavailable");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
