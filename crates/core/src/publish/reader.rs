use crate::publish::cache::{CacheInvalidator, CacheTag, TtlCache};
use crate::publish::object_store::ObjectStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Read path for the public blobs: a short burst tier in front of the tag cache,
/// in front of the object store.
///
/// Tag invalidation only touches the tag-cache tier; the burst tier expires on its
/// own within its TTL.
pub struct SnapshotReader {
    objects: Arc<dyn ObjectStore>,
    burst: TtlCache<Arc<Vec<u8>>>,
    app: TtlCache<Arc<Vec<u8>>>,
}

#[derive(Debug)]
pub enum ReadError {
    /// Object store has nothing and no copy was ever cached.
    Missing,
    /// Object store failed and no copy was ever cached.
    Unavailable(anyhow::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "snapshot missing"),
            Self::Unavailable(e) => write!(f, "snapshot unavailable: {e:#}"),
        }
    }
}

impl std::error::Error for ReadError {}

impl SnapshotReader {
    pub fn new(objects: Arc<dyn ObjectStore>, app_ttl: Duration, burst_ttl: Duration) -> Self {
        Self {
            objects,
            burst: TtlCache::new(burst_ttl),
            app: TtlCache::new(app_ttl),
        }
    }

    pub async fn read(&self, tag: CacheTag) -> Result<Arc<Vec<u8>>, ReadError> {
        let key = tag.as_str();

        if let Some(hit) = self.burst.get_fresh(key).await {
            return Ok(hit);
        }
        if let Some(hit) = self.app.get_fresh(key).await {
            self.burst.insert(key, hit.clone()).await;
            return Ok(hit);
        }

        match self.objects.get(tag.object_key()).await {
            Ok(Some(bytes)) => {
                let body = Arc::new(bytes);
                self.app.insert(key, body.clone()).await;
                self.burst.insert(key, body.clone()).await;
                Ok(body)
            }
            Ok(None) => self.stale_or(tag, ReadError::Missing).await,
            Err(err) => {
                tracing::warn!(tag = key, error = %err, "object store read failed");
                self.stale_or(tag, ReadError::Unavailable(err)).await
            }
        }
    }

    async fn stale_or(&self, tag: CacheTag, err: ReadError) -> Result<Arc<Vec<u8>>, ReadError> {
        match self.app.get_stale(tag.as_str()).await {
            Some(stale) => {
                tracing::warn!(tag = tag.as_str(), "serving stale snapshot");
                Ok(stale)
            }
            None => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl CacheInvalidator for SnapshotReader {
    async fn invalidate_tags(&self, tags: &[CacheTag]) -> Result<()> {
        for tag in tags {
            self.app.mark_stale(tag.as_str()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::object_store::MemoryObjectStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Object store whose reads can be switched off.
    #[derive(Default)]
    struct Flaky {
        inner: MemoryObjectStore,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ObjectStore for Flaky {
        async fn put(&self, key: &str, body: Vec<u8>, cache_control: &str) -> Result<()> {
            self.inner.put(key, body, cache_control).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            anyhow::ensure!(!self.down.load(Ordering::SeqCst), "store down");
            self.inner.get(key).await
        }
    }

    async fn put(store: &Flaky, tag: CacheTag, body: &str) {
        store
            .put(tag.object_key(), body.as_bytes().to_vec(), tag.cache_control())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cold_read_returns_store_bytes() {
        let store = Arc::new(Flaky::default());
        put(&store, CacheTag::Latest, r#"{"a":1}"#).await;
        let reader = SnapshotReader::new(store, Duration::from_secs(300), Duration::from_secs(30));
        let got = reader.read(CacheTag::Latest).await.unwrap();
        assert_eq!(got.as_slice(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn invalidation_refreshes_through_tag_tier() {
        let store = Arc::new(Flaky::default());
        put(&store, CacheTag::History, "v1").await;
        // Burst tier disabled so the tag tier is observable.
        let reader =
            SnapshotReader::new(store.clone(), Duration::from_secs(300), Duration::ZERO);
        assert_eq!(reader.read(CacheTag::History).await.unwrap().as_slice(), b"v1");

        put(&store, CacheTag::History, "v2").await;
        assert_eq!(reader.read(CacheTag::History).await.unwrap().as_slice(), b"v1");

        reader.invalidate_tags(&[CacheTag::History]).await.unwrap();
        assert_eq!(reader.read(CacheTag::History).await.unwrap().as_slice(), b"v2");
    }

    #[tokio::test]
    async fn store_outage_serves_stale_copy() {
        let store = Arc::new(Flaky::default());
        put(&store, CacheTag::Latest, "good").await;
        let reader = SnapshotReader::new(store.clone(), Duration::ZERO, Duration::ZERO);
        reader.read(CacheTag::Latest).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        assert_eq!(reader.read(CacheTag::Latest).await.unwrap().as_slice(), b"good");
    }

    #[tokio::test]
    async fn outage_without_cache_is_an_error() {
        let store = Arc::new(Flaky::default());
        store.down.store(true, Ordering::SeqCst);
        let reader = SnapshotReader::new(store, Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            reader.read(CacheTag::Latest).await,
            Err(ReadError::Unavailable(_))
        ));
        let empty = SnapshotReader::new(
            Arc::new(MemoryObjectStore::new()),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert!(matches!(
            empty.read(CacheTag::History).await,
            Err(ReadError::Missing)
        ));
    }
}
