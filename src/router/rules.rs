//! The ordered rule table. The first matching rule wins, so every
//! authentication exclusion sits above the general same-origin rules.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::time::Duration;
use url::{Origin, Url};

use crate::cache::{Limits, Policy, Strategy};

use super::request::RequestInfo;

const DAY_SECS: u64 = 86_400;

/// Query parameters that carry OAuth callback secrets.
const AUTH_QUERY_PARAMS: &[&str] = &["code", "access_token", "refresh_token"];

/// Predicate over a request.
#[derive(Debug, Clone)]
pub enum Matcher {
  /// Path prefix on any host
  PathPrefix(String),
  /// Path prefix on the app's own origin
  SameOriginPathPrefix(String),
  /// Header is present, whatever its value
  HeaderPresent(String),
  /// GET whose path matches the pattern
  GetPath(Regex),
  /// Same-origin GET navigation outside the excluded prefixes, without auth
  /// callback parameters in the query
  Pages { excluded_prefixes: Vec<String> },
  Any,
}

impl Matcher {
  pub fn matches(&self, req: &RequestInfo, origin: &Origin) -> bool {
    match self {
      Self::PathPrefix(prefix) => req.url.path().starts_with(prefix.as_str()),
      Self::SameOriginPathPrefix(prefix) => {
        req.url.origin() == *origin && req.url.path().starts_with(prefix.as_str())
      }
      Self::HeaderPresent(name) => req.header(name).is_some(),
      Self::GetPath(pattern) => req.is_get() && pattern.is_match(req.url.path()),
      Self::Pages { excluded_prefixes } => {
        req.is_get()
          && req.url.origin() == *origin
          && req.is_navigation()
          && !excluded_prefixes
            .iter()
            .any(|p| req.url.path().starts_with(p.as_str()))
          && !req.has_query_param(AUTH_QUERY_PARAMS)
      }
      Self::Any => true,
    }
  }
}

#[derive(Debug, Clone)]
pub struct CacheRule {
  /// Short label for logs and `doorstep classify`
  pub name: &'static str,
  pub matcher: Matcher,
  pub policy: Policy,
}

/// Rules in evaluation order, plus the app shell's precache manifest.
#[derive(Debug, Clone)]
pub struct RuleTable {
  origin: Origin,
  rules: Vec<CacheRule>,
  precache: Vec<String>,
}

impl RuleTable {
  /// Build a table from explicit rules. The last rule should match anything.
  pub fn new(origin: &Url, rules: Vec<CacheRule>, precache: Vec<String>) -> Self {
    Self {
      origin: origin.origin(),
      rules,
      precache,
    }
  }

  /// The app's standard routing rules.
  pub fn standard(origin: &Url, precache: Vec<String>) -> Result<Self> {
    let images = Regex::new(r"(?i)\.(?:png|jpg|jpeg|svg|gif|webp|ico)$")
      .map_err(|e| eyre!("Invalid image pattern: {}", e))?;
    let assets = Regex::new(r"(?i)\.(?:js|css|woff|woff2|ttf|eot)$")
      .map_err(|e| eyre!("Invalid static asset pattern: {}", e))?;

    let precache_limits = Limits {
      max_entries: precache.len(),
      max_age_secs: 0,
    };

    let rules = vec![
      CacheRule {
        name: "identity provider auth",
        matcher: Matcher::PathPrefix("/auth/v1/".to_string()),
        policy: Policy::new(Strategy::NetworkOnly, "supabase-auth", Limits::NEVER_RETAIN),
      },
      CacheRule {
        name: "app auth routes",
        matcher: Matcher::SameOriginPathPrefix("/auth/".to_string()),
        policy: Policy::new(Strategy::NetworkOnly, "app-auth", Limits::NEVER_RETAIN),
      },
      CacheRule {
        name: "auth api",
        matcher: Matcher::SameOriginPathPrefix("/api/auth/".to_string()),
        policy: Policy::new(Strategy::NetworkOnly, "api-auth", Limits::NEVER_RETAIN),
      },
      CacheRule {
        name: "authorized request",
        matcher: Matcher::HeaderPresent("authorization".to_string()),
        policy: Policy::new(Strategy::NetworkOnly, "auth-requests", Limits::NEVER_RETAIN),
      },
      CacheRule {
        name: "images",
        matcher: Matcher::GetPath(images),
        policy: Policy::new(
          Strategy::CacheFirst,
          "images",
          Limits {
            max_entries: 100,
            max_age_secs: 30 * DAY_SECS,
          },
        ),
      },
      CacheRule {
        name: "static resources",
        matcher: Matcher::GetPath(assets),
        policy: Policy::new(
          Strategy::StaleWhileRevalidate,
          "static-resources",
          Limits {
            max_entries: 100,
            max_age_secs: 7 * DAY_SECS,
          },
        ),
      },
      CacheRule {
        name: "pages",
        matcher: Matcher::Pages {
          excluded_prefixes: vec!["/auth/".to_string(), "/api/auth".to_string()],
        },
        policy: Policy::new(
          Strategy::NetworkFirst,
          "pages",
          Limits {
            max_entries: 50,
            max_age_secs: DAY_SECS,
          },
        )
        .with_network_timeout(Duration::from_secs(10)),
      },
      CacheRule {
        name: "app shell",
        matcher: Matcher::Any,
        policy: Policy::new(Strategy::Precache, "precache", precache_limits),
      },
    ];

    Ok(Self::new(origin, rules, precache))
  }

  /// First rule whose matcher accepts the request. `None` only for a table
  /// without a catch-all rule.
  pub fn classify(&self, req: &RequestInfo) -> Option<&CacheRule> {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(req, &self.origin))
  }

  /// Whether the request is for a bundled app shell path. Shell URLs carry
  /// no query string.
  pub fn is_precached(&self, req: &RequestInfo) -> bool {
    req.is_get()
      && req.url.origin() == self.origin
      && req.url.query().is_none()
      && self.precache.iter().any(|p| p == req.url.path())
  }

  pub fn policies(&self) -> Vec<Policy> {
    self.rules.iter().map(|r| r.policy.clone()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ORIGIN: &str = "https://fixit.example.com";

  fn table() -> RuleTable {
    let origin = Url::parse(ORIGIN).unwrap();
    RuleTable::standard(&origin, vec!["/".to_string(), "/manifest.json".to_string()]).unwrap()
  }

  fn req(url: &str) -> RequestInfo {
    RequestInfo::parse(url).unwrap()
  }

  fn bucket_of(table: &RuleTable, req: &RequestInfo) -> String {
    table.classify(req).unwrap().policy.bucket.clone()
  }

  #[test]
  fn test_auth_traffic_is_never_cached() {
    let table = table();
    let cases = [
      ("https://abc.supabase.co/auth/v1/token?grant_type=refresh_token", "supabase-auth"),
      ("https://fixit.example.com/auth/v1/user", "supabase-auth"),
      ("https://fixit.example.com/auth/callback", "app-auth"),
      ("https://fixit.example.com/auth/logo.png", "app-auth"),
      ("https://fixit.example.com/api/auth/session", "api-auth"),
    ];

    for method in ["GET", "POST", "DELETE"] {
      for (url, bucket) in cases {
        let r = RequestInfo::new(method, Url::parse(url).unwrap()).navigate();
        let rule = table.classify(&r).unwrap();
        assert_eq!(rule.policy.strategy, Strategy::NetworkOnly, "{} {}", method, url);
        assert_eq!(rule.policy.limits.max_entries, 0);
        assert_eq!(rule.policy.bucket, bucket);
      }
    }
  }

  #[test]
  fn test_authorization_header_bypasses_cache() {
    let table = table();
    for url in [
      "https://fixit.example.com/images/banner.webp",
      "https://fixit.example.com/_next/static/app.js",
      "https://fixit.example.com/bookings",
    ] {
      let r = req(url).navigate().with_header("Authorization", "Bearer abc");
      let rule = table.classify(&r).unwrap();
      assert_eq!(rule.policy.strategy, Strategy::NetworkOnly);
      assert_eq!(rule.policy.bucket, "auth-requests");
      assert_eq!(rule.policy.limits.max_entries, 0);
    }
  }

  #[test]
  fn test_auth_callback_wins_over_pages() {
    let table = table();
    let r = req("https://fixit.example.com/auth/callback?code=X").navigate();
    assert_eq!(bucket_of(&table, &r), "app-auth");
  }

  #[test]
  fn test_images_and_static_assets() {
    let table = table();

    let rule = table
      .classify(&req("https://cdn.example.net/uploads/phone.JPG"))
      .unwrap();
    assert_eq!(rule.policy.strategy, Strategy::CacheFirst);
    assert_eq!(rule.policy.limits.max_entries, 100);
    assert_eq!(rule.policy.limits.max_age_secs, 2_592_000);

    let rule = table
      .classify(&req("https://fixit.example.com/fonts/inter.woff2"))
      .unwrap();
    assert_eq!(rule.policy.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(rule.policy.bucket, "static-resources");
    assert_eq!(rule.policy.limits.max_age_secs, 604_800);

    // The extension has to end the path
    let r = req("https://fixit.example.com/app.js.map");
    assert_eq!(bucket_of(&table, &r), "precache");
  }

  #[test]
  fn test_non_get_assets_fall_through() {
    let table = table();
    let r = RequestInfo::new("POST", Url::parse("https://fixit.example.com/upload/a.png").unwrap());
    let rule = table.classify(&r).unwrap();
    assert_eq!(rule.policy.strategy, Strategy::Precache);
    assert!(!table.is_precached(&r));
  }

  #[test]
  fn test_pages_rule() {
    let table = table();

    let rule = table
      .classify(&req("https://fixit.example.com/services/laptop").navigate())
      .unwrap();
    assert_eq!(rule.policy.strategy, Strategy::NetworkFirst);
    assert_eq!(rule.policy.bucket, "pages");
    assert_eq!(rule.policy.limits.max_entries, 50);
    assert_eq!(rule.policy.network_timeout, Duration::from_secs(10));

    // Callback secrets in the query keep a page out of the cache
    for url in [
      "https://fixit.example.com/?code=abc",
      "https://fixit.example.com/book?access_token=t",
      "https://fixit.example.com/book?refresh_token=t",
      "https://fixit.example.com/api/authorize",
    ] {
      let rule = table.classify(&req(url).navigate()).unwrap();
      assert_ne!(rule.policy.bucket, "pages", "{}", url);
    }

    // Cross-origin documents and non-navigations are not pages
    let r = req("https://partner.example.org/offers").navigate();
    assert_ne!(bucket_of(&table, &r), "pages");
    let r = req("https://fixit.example.com/api/categories");
    assert_ne!(bucket_of(&table, &r), "pages");
  }

  #[test]
  fn test_precache_manifest() {
    let table = table();
    assert!(table.is_precached(&req("https://fixit.example.com/manifest.json")));
    assert!(!table.is_precached(&req("https://fixit.example.com/api/categories")));
    assert!(!table.is_precached(&req("https://other.example.com/manifest.json")));
    assert!(!table.is_precached(&req("https://fixit.example.com/?code=abc")));
  }

  #[test]
  fn test_table_order_puts_auth_first() {
    let table = table();
    let names: Vec<_> = table.policies().into_iter().map(|p| p.bucket).collect();
    assert_eq!(
      names,
      [
        "supabase-auth",
        "app-auth",
        "api-auth",
        "auth-requests",
        "images",
        "static-resources",
        "pages",
        "precache"
      ]
    );
  }
}
