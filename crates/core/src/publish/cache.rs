use crate::config::Settings;
use crate::error::PipelineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// The two logical cache tags. Each maps to one object-store blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTag {
    Latest,
    History,
}

impl CacheTag {
    pub const ALL: [CacheTag; 2] = [CacheTag::Latest, CacheTag::History];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::History => "history",
        }
    }

    pub fn object_key(self) -> &'static str {
        match self {
            Self::Latest => "latest.json",
            Self::History => "history.json",
        }
    }

    /// Intraday refresh for `latest`, once-daily for `history`.
    pub fn cache_control(self) -> &'static str {
        match self {
            Self::Latest => "public, max-age=60, s-maxage=300",
            Self::History => "public, max-age=3600, s-maxage=86400",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "latest" => Some(Self::Latest),
            "history" => Some(Self::History),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
    stale: bool,
}

/// Keyed TTL cache. Invalidation marks entries stale instead of dropping them so a
/// failing origin can still be answered with the last good value.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_fresh(&self, key: &str) -> Option<V> {
        let guard = self.entries.read().await;
        guard
            .get(key)
            .filter(|e| !e.stale && e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Any entry, fresh or not.
    pub async fn get_stale(&self, key: &str) -> Option<V> {
        let guard = self.entries.read().await;
        guard.get(key).map(|e| e.value.clone())
    }

    pub async fn insert(&self, key: &str, value: V) {
        let mut guard = self.entries.write().await;
        guard.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
                stale: false,
            },
        );
    }

    pub async fn mark_stale(&self, key: &str) {
        let mut guard = self.entries.write().await;
        if let Some(e) = guard.get_mut(key) {
            e.stale = true;
        }
    }
}

/// Application-layer tag cache invalidation.
#[async_trait::async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_tags(&self, tags: &[CacheTag]) -> Result<()>;
}

/// CDN purge by tag. Callers treat failures as best effort.
#[async_trait::async_trait]
pub trait EdgePurger: Send + Sync {
    async fn purge_tags(&self, tags: &[CacheTag]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

#[async_trait::async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate_tags(&self, _tags: &[CacheTag]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPurger;

#[async_trait::async_trait]
impl EdgePurger for NoopPurger {
    async fn purge_tags(&self, _tags: &[CacheTag]) -> Result<()> {
        Ok(())
    }
}

/// Invalidates the API process's tag cache from another process.
#[derive(Debug, Clone)]
pub struct HttpRevalidator {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRevalidator {
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let Some(base_url) = settings.revalidate_url.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build revalidate http client")?;
        Ok(Some(Self {
            http,
            base_url,
            token: settings.admin_token.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl CacheInvalidator for HttpRevalidator {
    async fn invalidate_tags(&self, tags: &[CacheTag]) -> Result<()> {
        let url = format!("{}/admin/revalidate", self.base_url.trim_end_matches('/'));
        let mut req = self.http.post(url).json(&json!({ "tags": tags }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await.context("revalidate request failed")?;
        let status = res.status();
        anyhow::ensure!(status.is_success(), "revalidate HTTP {status}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CloudflarePurger {
    http: reqwest::Client,
    zone_id: String,
    api_token: String,
}

impl CloudflarePurger {
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let (Some(zone_id), Some(api_token)) = (
            settings.cloudflare_zone_id.clone(),
            settings.cloudflare_api_token.clone(),
        ) else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build edge purge http client")?;
        Ok(Some(Self {
            http,
            zone_id,
            api_token,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[async_trait::async_trait]
impl EdgePurger for CloudflarePurger {
    async fn purge_tags(&self, tags: &[CacheTag]) -> Result<()> {
        let names: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
        let res = self
            .http
            .post(format!("{CLOUDFLARE_API}/zones/{}/purge_cache", self.zone_id))
            .bearer_auth(&self.api_token)
            .json(&json!({ "tags": names }))
            .send()
            .await
            .context("edge purge request failed")?;

        let status = res.status();
        let body: CloudflareResponse = res
            .json()
            .await
            .with_context(|| format!("edge purge HTTP {status}: unreadable body"))?;
        anyhow::ensure!(
            status.is_success() && body.success,
            "edge purge HTTP {status}: {:?}",
            body.errors
        );
        Ok(())
    }
}

/// Runs after every successful rebuild: app cache first, then the edge.
#[derive(Clone)]
pub struct CacheCoordinator {
    app: Arc<dyn CacheInvalidator>,
    edge: Arc<dyn EdgePurger>,
}

impl CacheCoordinator {
    pub fn new(app: Arc<dyn CacheInvalidator>, edge: Arc<dyn EdgePurger>) -> Self {
        Self { app, edge }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopInvalidator), Arc::new(NoopPurger))
    }

    pub async fn after_rebuild(&self, tags: &[CacheTag]) -> Result<(), PipelineError> {
        if tags.is_empty() {
            return Ok(());
        }

        self.app
            .invalidate_tags(tags)
            .await
            .map_err(|e| PipelineError::storage("app-cache", &e))?;

        // Stale edge copies expire on their own via s-maxage.
        if let Err(err) = self.edge.purge_tags(tags).await {
            tracing::warn!(error = %err, ?tags, "edge purge failed; relying on TTL");
        }

        tracing::info!(?tags, "cache tags invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CacheInvalidator for Counting {
        async fn invalidate_tags(&self, _tags: &[CacheTag]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "rejected");
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl EdgePurger for Counting {
        async fn purge_tags(&self, _tags: &[CacheTag]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "cdn down");
            Ok(())
        }
    }

    #[tokio::test]
    async fn edge_failure_is_swallowed() {
        let app = Arc::new(Counting::default());
        let edge = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let coord = CacheCoordinator::new(app.clone(), edge.clone());
        coord.after_rebuild(&[CacheTag::Latest]).await.unwrap();
        assert_eq!(app.calls.load(Ordering::SeqCst), 1);
        assert_eq!(edge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn app_failure_is_reported_and_skips_edge() {
        let app = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let edge = Arc::new(Counting::default());
        let coord = CacheCoordinator::new(app, edge.clone());
        let err = coord.after_rebuild(&CacheTag::ALL).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageWriteFailure);
        assert_eq!(edge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_tag_list_is_noop() {
        let app = Arc::new(Counting::default());
        let coord = CacheCoordinator::new(app.clone(), Arc::new(NoopPurger));
        coord.after_rebuild(&[]).await.unwrap();
        assert_eq!(app.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entries_survive_invalidation() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("latest", 1u32).await;
        assert_eq!(cache.get_fresh("latest").await, Some(1));
        cache.mark_stale("latest").await;
        assert_eq!(cache.get_fresh("latest").await, None);
        assert_eq!(cache.get_stale("latest").await, Some(1));
    }

    #[tokio::test]
    async fn zero_ttl_never_fresh() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert("k", "v").await;
        assert_eq!(cache.get_fresh("k").await, None);
    }

    #[test]
    fn tag_names_round_trip() {
        for tag in CacheTag::ALL {
            assert_eq!(CacheTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(CacheTag::parse("prices"), None);
    }
}
