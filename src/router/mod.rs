//! Offline cache router: classify each outbound request and serve it with the
//! strategy of the first matching rule.

mod request;
mod rules;

pub use request::{parse_header, RequestInfo};
pub use rules::{CacheRule, RuleTable};

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::cache::{BucketSummary, CacheLayer, CacheStorage, EntryInfo, Outcome, Strategy};
use crate::network::Network;

/// Entry point of the interception hook.
pub struct Router<S: CacheStorage> {
  rules: RuleTable,
  cache: CacheLayer<S>,
}

impl<S: CacheStorage + 'static> Router<S> {
  pub fn new(rules: RuleTable, storage: S) -> Self {
    Self {
      rules,
      cache: CacheLayer::new(storage),
    }
  }

  pub fn classify(&self, request: &RequestInfo) -> Result<&CacheRule> {
    self
      .rules
      .classify(request)
      .ok_or_else(|| eyre!("No cache rule matches {}", request.url))
  }

  /// Classify `request` and serve it.
  ///
  /// Requests reaching the app shell rule are served from the precache only
  /// when they name a bundled path; anything else goes straight to the network.
  pub async fn handle<N: Network>(&self, request: RequestInfo, network: &N) -> Result<Outcome> {
    let rule = self.classify(&request)?;
    let mut policy = rule.policy.clone();
    if policy.strategy == Strategy::Precache && !self.rules.is_precached(&request) {
      policy.strategy = Strategy::NetworkOnly;
    }

    debug!(
      method = %request.method,
      url = %request.url,
      rule = rule.name,
      strategy = %policy.strategy,
      bucket = %policy.bucket,
      "Routing request"
    );

    let key = request.cache_key();
    let url = request.url.to_string();
    let network = network.clone();
    self
      .cache
      .execute(&policy, &key, &url, move || async move {
        network.fetch(request).await
      })
      .await
  }

  /// Age out entries of every bucket with an age limit.
  pub fn purge_expired(&self) -> Result<usize> {
    self.cache.purge_expired(&self.rules.policies())
  }

  pub fn buckets(&self) -> Result<Vec<BucketSummary>> {
    self.cache.buckets()
  }

  pub fn entries(&self, bucket: &str) -> Result<Vec<EntryInfo>> {
    self.cache.entries(bucket)
  }

  pub fn clear(&self, bucket: Option<&str>) -> Result<usize> {
    self.cache.clear(bucket)
  }
}
