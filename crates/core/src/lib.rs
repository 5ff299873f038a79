pub mod domain;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod storage;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

pub mod config {
    use crate::error::PipelineError;
    use anyhow::Context;
    use chrono_tz::Tz;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub supabase_url: Option<String>,
        pub supabase_service_role_key: Option<String>,
        pub snapshot_bucket: String,
        pub upstream_base_url: Option<String>,
        pub upstream_api_key: Option<String>,
        pub admin_token: Option<String>,
        pub cloudflare_zone_id: Option<String>,
        pub cloudflare_api_token: Option<String>,
        pub revalidate_url: Option<String>,
        pub catalog_path: Option<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: env_opt("DATABASE_URL"),
                supabase_url: env_opt("SUPABASE_URL"),
                supabase_service_role_key: env_opt("SUPABASE_SERVICE_ROLE_KEY"),
                snapshot_bucket: env_opt("SNAPSHOT_BUCKET")
                    .unwrap_or_else(|| "snapshots".to_string()),
                upstream_base_url: env_opt("UPSTREAM_BASE_URL"),
                upstream_api_key: env_opt("UPSTREAM_API_KEY"),
                admin_token: env_opt("ADMIN_TOKEN"),
                cloudflare_zone_id: env_opt("CLOUDFLARE_ZONE_ID"),
                cloudflare_api_token: env_opt("CLOUDFLARE_API_TOKEN"),
                revalidate_url: env_opt("REVALIDATE_URL"),
                catalog_path: env_opt("CATALOG_PATH"),
                sentry_dsn: env_opt("SENTRY_DSN"),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            require(&self.database_url, "DATABASE_URL")
        }

        pub fn require_upstream_base_url(&self) -> anyhow::Result<&str> {
            require(&self.upstream_base_url, "UPSTREAM_BASE_URL")
        }

        pub fn require_upstream_api_key(&self) -> anyhow::Result<&str> {
            require(&self.upstream_api_key, "UPSTREAM_API_KEY")
        }

        pub fn require_supabase_url(&self) -> anyhow::Result<&str> {
            require(&self.supabase_url, "SUPABASE_URL")
        }

        pub fn require_supabase_service_role_key(&self) -> anyhow::Result<&str> {
            require(&self.supabase_service_role_key, "SUPABASE_SERVICE_ROLE_KEY")
        }
    }

    /// Tunables for the sampling/finalization pipeline and the read path.
    #[derive(Debug, Clone)]
    pub struct PipelineConfig {
        pub timezone: Tz,
        pub boundary_hour: u32,
        /// Minutes after the boundary during which a tick finalizes the outgoing day first.
        pub grace_minutes: u32,
        pub request_delay: Duration,
        pub request_timeout: Duration,
        pub backfill_window_days: u32,
        pub app_cache_ttl: Duration,
        pub burst_cache_ttl: Duration,
    }

    impl Default for PipelineConfig {
        fn default() -> Self {
            Self {
                timezone: Tz::UTC,
                boundary_hour: crate::time::service_day::DEFAULT_BOUNDARY_HOUR,
                grace_minutes: crate::time::service_day::DEFAULT_GRACE_MINUTES,
                request_delay: Duration::from_millis(300),
                request_timeout: Duration::from_secs(30),
                backfill_window_days: 90,
                app_cache_ttl: Duration::from_secs(300),
                burst_cache_ttl: Duration::from_secs(30),
            }
        }
    }

    impl PipelineConfig {
        pub fn from_env() -> anyhow::Result<Self> {
            let mut out = Self::default();

            if let Some(tz) = env_opt("SERVICE_TIMEZONE") {
                out.timezone = tz
                    .parse::<Tz>()
                    .map_err(|e| anyhow::anyhow!("invalid SERVICE_TIMEZONE {tz:?}: {e}"))?;
            }
            if let Some(h) = env_parse::<u32>("SERVICE_DAY_BOUNDARY_HOUR")? {
                anyhow::ensure!(h < 24, "SERVICE_DAY_BOUNDARY_HOUR must be 0..=23 (got {h})");
                out.boundary_hour = h;
            }
            if let Some(m) = env_parse::<u32>("BOUNDARY_GRACE_MINUTES")? {
                out.grace_minutes = m;
            }
            if let Some(ms) = env_parse::<u64>("UPSTREAM_REQ_DELAY_MS")? {
                out.request_delay = Duration::from_millis(ms);
            }
            if let Some(secs) = env_parse::<u64>("UPSTREAM_TIMEOUT_SECS")? {
                out.request_timeout = Duration::from_secs(secs);
            }
            if let Some(days) = env_parse::<u32>("BACKFILL_WINDOW_DAYS")? {
                anyhow::ensure!(days >= 1, "BACKFILL_WINDOW_DAYS must be >= 1");
                out.backfill_window_days = days;
            }
            if let Some(secs) = env_parse::<u64>("APP_CACHE_TTL_SECS")? {
                out.app_cache_ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = env_parse::<u64>("BURST_CACHE_TTL_SECS")? {
                out.burst_cache_ttl = Duration::from_secs(secs);
            }

            Ok(out)
        }
    }

    fn require<'a>(value: &'a Option<String>, name: &'static str) -> anyhow::Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| PipelineError::ConfigurationMissing(name).into())
    }

    fn env_opt(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        env_opt(name)
            .map(|s| s.parse::<T>().with_context(|| format!("invalid {name}: {s}")))
            .transpose()
    }

}
