use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
  pub id: String,
  pub email: Option<String>,
}

/// A session as held by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
  pub access_token: String,
  pub refresh_token: String,
  #[serde(default = "default_token_type")]
  pub token_type: String,
  /// Unix timestamp, seconds
  pub expires_at: i64,
  pub user: Option<SessionUser>,
}

fn default_token_type() -> String {
  "bearer".to_string()
}

impl SessionRecord {
  /// Seconds until expiry; negative once expired.
  pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
    self.expires_at - now.timestamp()
  }

  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(self.expires_at, 0)
  }
}

/// Token endpoint response of the identity provider.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
  pub access_token: String,
  pub refresh_token: String,
  #[serde(default = "default_token_type")]
  pub token_type: String,
  pub expires_in: Option<i64>,
  pub expires_at: Option<i64>,
  pub user: Option<SessionUser>,
}

impl TokenResponse {
  /// Prefer the absolute expiry, otherwise derive it from `expires_in`.
  pub fn into_record(self, now: DateTime<Utc>) -> SessionRecord {
    let expires_at = self
      .expires_at
      .unwrap_or_else(|| now.timestamp() + self.expires_in.unwrap_or(3600));
    SessionRecord {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      token_type: self.token_type,
      expires_at,
      user: self.user,
    }
  }
}
