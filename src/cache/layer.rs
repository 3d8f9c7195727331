//! Cache layer that executes a caching strategy around a network fetch.

use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::{BucketSummary, CacheStorage, EntryInfo};
use super::traits::{CacheResult, CachedEntry, CachedResponse, Policy, Strategy};

/// What the executor produced for one request.
#[derive(Debug)]
pub struct Outcome {
  pub result: CacheResult<CachedResponse>,
  pub strategy: Strategy,
  pub bucket: String,
  /// Network work still running after the response was handed back: a
  /// stale-while-revalidate refresh, or a network-first fetch that outlived
  /// its timeout. It writes the bucket when it resolves.
  pub background: Option<JoinHandle<()>>,
}

impl Outcome {
  pub fn response(&self) -> &CachedResponse {
    &self.result.data
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// Storage failures never reach the caller: a failed read is a miss and a
/// failed write is dropped.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Serve one request according to `policy`.
  ///
  /// `key` identifies the entry inside the bucket, `url` is kept alongside it
  /// for listings. The fetch future must be `'static` because some strategies
  /// finish it on a background task.
  pub async fn execute<F, Fut>(
    &self,
    policy: &Policy,
    key: &str,
    url: &str,
    fetcher: F,
  ) -> Result<Outcome>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    let (result, background) = match policy.strategy {
      Strategy::NetworkOnly => (CacheResult::from_network(fetcher().await?), None),
      Strategy::CacheFirst | Strategy::Precache => {
        (self.cache_first(policy, key, url, fetcher).await?, None)
      }
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(policy, key, url, fetcher)
          .await?
      }
      Strategy::NetworkFirst => self.network_first(policy, key, url, fetcher).await?,
    };

    Ok(Outcome {
      result,
      strategy: policy.strategy,
      bucket: policy.bucket.clone(),
      background,
    })
  }

  /// 1. Serve an unexpired cached entry
  /// 2. Otherwise fetch from network and store the response
  ///
  /// An expired entry counts as a miss, so a network failure is returned.
  async fn cache_first<F, Fut>(
    &self,
    policy: &Policy,
    key: &str,
    url: &str,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    if let Some(cached) = self.read(&policy.bucket, key) {
      if !cached.is_expired(policy.limits.max_age_secs) {
        return Ok(CacheResult::from_cache(
          cached.response,
          cached.cached_at,
          false,
        ));
      }
      debug!(bucket = %policy.bucket, url, "Cached entry expired");
    }

    let data = fetcher().await?;
    store(&*self.storage, policy, key, url, &data);
    Ok(CacheResult::from_network(data))
  }

  /// Serve whatever the bucket holds, regardless of age, while a background
  /// task refreshes it. Without an entry the caller waits on the network.
  async fn stale_while_revalidate<F, Fut>(
    &self,
    policy: &Policy,
    key: &str,
    url: &str,
    fetcher: F,
  ) -> Result<(CacheResult<CachedResponse>, Option<JoinHandle<()>>)>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    let cached = self.read(&policy.bucket, key);

    let fetch = fetcher();
    let storage = Arc::clone(&self.storage);
    let (task_policy, task_key, task_url) = (policy.clone(), key.to_string(), url.to_string());
    let revalidate = async move {
      let data = fetch.await?;
      store(&*storage, &task_policy, &task_key, &task_url, &data);
      Ok::<_, color_eyre::Report>(data)
    };

    match cached {
      Some(cached) => {
        let bucket = policy.bucket.clone();
        let handle = tokio::spawn(async move {
          if let Err(e) = revalidate.await {
            warn!(%bucket, error = %e, "Background revalidation failed");
          }
        });
        let is_stale = cached.is_expired(policy.limits.max_age_secs);
        Ok((
          CacheResult::from_cache(cached.response, cached.cached_at, is_stale),
          Some(handle),
        ))
      }
      None => Ok((CacheResult::from_network(revalidate.await?), None)),
    }
  }

  /// 1. Fetch from network, bounded by the policy's timeout
  /// 2. On success store the response
  /// 3. On failure or timeout serve the cached entry (offline mode)
  ///
  /// Entries past the bucket's age limit are not served. A fetch that times
  /// out keeps running and still stores its response.
  async fn network_first<F, Fut>(
    &self,
    policy: &Policy,
    key: &str,
    url: &str,
    fetcher: F,
  ) -> Result<(CacheResult<CachedResponse>, Option<JoinHandle<()>>)>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    let fetch = fetcher();
    let storage = Arc::clone(&self.storage);
    let (task_policy, task_key, task_url) = (policy.clone(), key.to_string(), url.to_string());
    let (tx, rx) = oneshot::channel();

    let task = tokio::spawn(async move {
      let result = fetch.await;
      if let Ok(data) = &result {
        store(&*storage, &task_policy, &task_key, &task_url, data);
      }
      // Receiver is gone once the caller has moved on after a timeout
      let _ = tx.send(result);
    });

    let error = match tokio::time::timeout(policy.network_timeout, rx).await {
      Ok(Ok(Ok(data))) => return Ok((CacheResult::from_network(data), None)),
      Ok(Ok(Err(e))) => e,
      Ok(Err(_)) => eyre!("Network task for {} ended without a response", url),
      Err(_) => {
        let error = eyre!(
          "Network request for {} timed out after {}s",
          url,
          policy.network_timeout.as_secs()
        );
        return match self.read_unexpired(policy, key) {
          Some(cached) => {
            debug!(bucket = %policy.bucket, url, "Network timed out, serving cache");
            Ok((
              CacheResult::offline(cached.response, cached.cached_at),
              Some(task),
            ))
          }
          None => Err(error),
        };
      }
    };

    match self.read_unexpired(policy, key) {
      Some(cached) => {
        debug!(bucket = %policy.bucket, url, error = %error, "Network failed, serving cache");
        Ok((CacheResult::offline(cached.response, cached.cached_at), None))
      }
      None => Err(error),
    }
  }

  /// Delete entries older than each policy's age limit.
  pub fn purge_expired(&self, policies: &[Policy]) -> Result<usize> {
    let mut purged = 0;
    for policy in policies {
      if policy.limits.max_entries == 0 || policy.limits.max_age_secs == 0 {
        continue;
      }
      let cutoff = Utc::now() - ChronoDuration::seconds(policy.limits.max_age_secs as i64);
      purged += self.storage.purge_older_than(&policy.bucket, cutoff)?;
    }
    Ok(purged)
  }

  pub fn buckets(&self) -> Result<Vec<BucketSummary>> {
    self.storage.buckets()
  }

  pub fn entries(&self, bucket: &str) -> Result<Vec<EntryInfo>> {
    self.storage.entries_by_age(bucket)
  }

  pub fn clear(&self, bucket: Option<&str>) -> Result<usize> {
    self.storage.clear(bucket)
  }

  /// Read an entry, treating storage errors as a miss.
  fn read(&self, bucket: &str, key: &str) -> Option<CachedEntry> {
    match self.storage.get(bucket, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(bucket, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  fn read_unexpired(&self, policy: &Policy, key: &str) -> Option<CachedEntry> {
    self
      .read(&policy.bucket, key)
      .filter(|cached| !cached.is_expired(policy.limits.max_age_secs))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Write a response into its bucket. Non-200 responses and zero-bound buckets
/// are skipped; storage errors are logged and dropped.
fn store<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &Policy,
  key: &str,
  url: &str,
  data: &CachedResponse,
) {
  if policy.limits.max_entries == 0 || !data.is_cacheable() {
    return;
  }

  let entry = CachedEntry::new(data.clone());
  match storage.put(&policy.bucket, key, url, &entry, policy.limits.max_entries) {
    Ok(0) => {}
    Ok(evicted) => debug!(bucket = %policy.bucket, evicted, "Evicted oldest cache entries"),
    Err(e) => warn!(bucket = %policy.bucket, error = %e, "Cache write failed"),
  }
}
