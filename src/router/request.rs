use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  #[default]
  Other,
}

/// Descriptor of one outbound request, as seen by the interception hook.
#[derive(Debug, Clone)]
pub struct RequestInfo {
  /// Upper-case HTTP method
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub mode: RequestMode,
}

impl RequestInfo {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      mode: RequestMode::Other,
    }
  }

  #[cfg(test)]
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse a URL string into a GET request.
  #[cfg(test)]
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self
  }

  /// Header lookup, case-insensitive on the name.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// A document request: either flagged as a navigation or asking for HTML.
  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Whether the query string carries any of the given parameter names.
  pub fn has_query_param(&self, names: &[&str]) -> bool {
    self
      .url
      .query_pairs()
      .any(|(key, _)| names.contains(&key.as_ref()))
  }

  /// Stable key of this request inside a bucket.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Parse a curl-style `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Invalid header '{}', name is empty", raw));
  }
  Ok((name.to_string(), value.trim().to_string()))
}
