use crate::config::{PipelineConfig, Settings};
use crate::domain::catalog::{FetchParams, TrackedItem};
use crate::error::PipelineError;
use crate::ingest::types::{
    decode_aggregated_price, decode_daily_stats, decode_lowest_listing, DailyStat,
    ItemStatsResponse, SearchResponse,
};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::time::Duration;

const ITEM_PATH: &str = "/v1/items";
const SEARCH_PATH: &str = "/v1/search";

// Trailing window the per-item endpoint returns when no `days` is requested.
pub const SHORT_WINDOW_DAYS: u32 = 7;

/// Read-only access to the upstream item API.
///
/// Implementations make exactly one attempt per call; callers decide what to do with a
/// failure and keep going with the remaining items.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_price(&self, item: &TrackedItem) -> Result<f64, PipelineError>;

    /// Usable daily statistics over the last `days` days, ascending by date.
    async fn fetch_daily_stats(
        &self,
        item: &TrackedItem,
        days: u32,
    ) -> Result<Vec<DailyStat>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpUpstreamClient {
    pub fn from_settings(settings: &Settings, cfg: &PipelineConfig) -> Result<Self> {
        let base_url = settings.require_upstream_base_url()?.to_string();
        let api_key = settings.require_upstream_api_key()?.to_string();

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build upstream http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        Ok(headers)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        item_id: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, PipelineError> {
        let unavailable = |detail: String| PipelineError::UpstreamUnavailable {
            item_id: item_id.to_string(),
            detail,
        };

        let headers = self.headers().map_err(|e| unavailable(format!("{e:#}")))?;
        let res = self
            .http
            .get(self.url(path))
            .headers(headers)
            .query(query)
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {e}")))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| unavailable(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(unavailable(format!("HTTP {status}: {}", truncate(&text, 200))));
        }

        serde_json::from_str::<T>(&text).map_err(|e| PipelineError::UpstreamDataMissing {
            item_id: item_id.to_string(),
            detail: format!("unexpected response shape: {e}"),
        })
    }

    async fn item_stats(
        &self,
        item: &TrackedItem,
        upstream_id: &str,
        days: u32,
    ) -> Result<ItemStatsResponse, PipelineError> {
        let path = format!("{ITEM_PATH}/{upstream_id}");
        self.get_json(&item.id, &path, &[("days", days.to_string())])
            .await
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn fetch_price(&self, item: &TrackedItem) -> Result<f64, PipelineError> {
        match &item.source {
            FetchParams::Aggregated { upstream_id } => {
                let resp = self.item_stats(item, upstream_id, SHORT_WINDOW_DAYS).await?;
                decode_aggregated_price(&item.id, &resp)
            }
            FetchParams::RawSample { query, category } => {
                let mut params = vec![("q", query.clone())];
                if let Some(category) = category {
                    params.push(("category", category.clone()));
                }
                let resp: SearchResponse = self.get_json(&item.id, SEARCH_PATH, &params).await?;
                decode_lowest_listing(&item.id, query, &resp)
            }
        }
    }

    async fn fetch_daily_stats(
        &self,
        item: &TrackedItem,
        days: u32,
    ) -> Result<Vec<DailyStat>, PipelineError> {
        match &item.source {
            FetchParams::Aggregated { upstream_id } => {
                let resp = self.item_stats(item, upstream_id, days).await?;
                Ok(decode_daily_stats(&resp))
            }
            FetchParams::RawSample { .. } => Err(PipelineError::UpstreamDataMissing {
                item_id: item.id.clone(),
                detail: "search endpoint has no daily statistics".to_string(),
            }),
        }
    }
}

/// Fixed inter-call delay within one pass. The first call goes out immediately.
#[derive(Debug)]
pub struct Throttle {
    delay: Duration,
    calls: usize,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self { delay, calls: 0 }
    }

    pub async fn wait(&mut self) {
        if self.calls != 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls += 1;
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
