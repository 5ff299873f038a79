use crate::config::Settings;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Whole-object blob storage. `put` replaces the object atomically.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, cache_control: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Supabase Storage over its REST API.
#[derive(Debug, Clone)]
pub struct SupabaseObjectStore {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseObjectStore {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_supabase_url()?.to_string();
        let service_key = settings.require_supabase_service_role_key()?.to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build object store http client")?;

        Ok(Self {
            http,
            base_url,
            service_key,
            bucket: settings.snapshot_bucket.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            key.trim_start_matches('/')
        )
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.service_key))?,
        );
        headers.insert("apikey", HeaderValue::from_str(&self.service_key)?);
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl ObjectStore for SupabaseObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, cache_control: &str) -> Result<()> {
        let mut headers = self.auth_headers()?;
        headers.insert("x-upsert", HeaderValue::from_static("true"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_str(cache_control)?);

        let res = self
            .http
            .post(self.object_url(key))
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("object store upload failed (key={key})"))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            anyhow::bail!("object store upload HTTP {status} (key={key}): {text}");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let res = self
            .http
            .get(self.object_url(key))
            .headers(self.auth_headers()?)
            .send()
            .await
            .with_context(|| format!("object store download failed (key={key})"))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            // Storage answers 400 {"error":"not_found"} for missing objects.
            if status == StatusCode::BAD_REQUEST && text.contains("not_found") {
                return Ok(None);
            }
            anyhow::bail!("object store download HTTP {status} (key={key}): {text}");
        }

        let bytes = res
            .bytes()
            .await
            .with_context(|| format!("failed to read object body (key={key})"))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub cache_control: String,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    puts: Mutex<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(key).cloned()
    }

    /// Number of successful `put` calls so far.
    pub async fn put_count(&self) -> usize {
        *self.puts.lock().await
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, cache_control: &str) -> Result<()> {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                body,
                cache_control: cache_control.to_string(),
            },
        );
        *self.puts.lock().await += 1;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(key).map(|o| o.body.clone()))
    }
}
