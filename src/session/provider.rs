//! Identity provider seam and the Supabase implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;

use super::types::{SessionRecord, TokenResponse};

/// Owner of the session record. The monitor only reads and asks for refreshes.
pub trait IdentityProvider: Send + Sync {
  /// Current session, or None when signed out.
  fn get_session(&self) -> impl Future<Output = Result<Option<SessionRecord>>> + Send;

  /// Rotate the session's tokens and advance its expiry.
  fn refresh_session(&self) -> impl Future<Output = Result<SessionRecord>> + Send;
}

/// Session persisted as JSON on disk, the CLI's equivalent of browser storage.
#[derive(Debug, Clone)]
pub struct SessionStore {
  path: PathBuf,
}

impl SessionStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Get the default session file path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("doorstep").join("session.json"))
  }

  pub async fn load(&self) -> Result<Option<SessionRecord>> {
    let contents = match tokio::fs::read(&self.path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(eyre!(
          "Failed to read session file {}: {}",
          self.path.display(),
          e
        ))
      }
    };

    let session = serde_json::from_slice(&contents)
      .map_err(|e| eyre!("Failed to parse session file {}: {}", self.path.display(), e))?;
    Ok(Some(session))
  }

  pub async fn save(&self, session: &SessionRecord) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
    }

    let data =
      serde_json::to_vec_pretty(session).map_err(|e| eyre!("Failed to serialize session: {}", e))?;
    tokio::fs::write(&self.path, data)
      .await
      .map_err(|e| eyre!("Failed to write session file {}: {}", self.path.display(), e))
  }

  pub async fn clear(&self) -> Result<()> {
    match tokio::fs::remove_file(&self.path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!("Failed to remove session file: {}", e)),
    }
  }
}

/// Supabase (GoTrue) auth over its REST endpoints.
#[derive(Clone)]
pub struct SupabaseAuth {
  client: reqwest::Client,
  base_url: Url,
  anon_key: String,
  store: SessionStore,
}

impl SupabaseAuth {
  pub fn new(base_url: Url, anon_key: String, store: SessionStore) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("doorstep/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      anon_key,
      store,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid auth endpoint {}: {}", path, e))
  }

  /// POST to the token endpoint with the given grant and persist the session.
  async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<SessionRecord> {
    let mut url = self.endpoint("/auth/v1/token")?;
    url.query_pairs_mut().append_pair("grant_type", grant_type);

    let response = self
      .client
      .post(url)
      .header("apikey", &self.anon_key)
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Token request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(eyre!("Token request rejected ({}): {}", status, text));
    }

    let token: TokenResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse token response: {}", e))?;

    let session = token.into_record(Utc::now());
    self.store.save(&session).await?;
    Ok(session)
  }

  pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SessionRecord> {
    let session = self
      .token_grant("password", json!({ "email": email, "password": password }))
      .await?;
    info!(email, expires_at = session.expires_at, "Signed in");
    Ok(session)
  }

  /// Revoke the session remotely (best effort) and forget it locally.
  pub async fn sign_out(&self) -> Result<()> {
    if let Some(session) = self.store.load().await? {
      let result = self
        .client
        .post(self.endpoint("/auth/v1/logout")?)
        .header("apikey", &self.anon_key)
        .bearer_auth(&session.access_token)
        .send()
        .await;

      match result {
        Ok(response) if response.status().is_success() => info!("Signed out"),
        Ok(response) => warn!(status = %response.status(), "Logout was rejected"),
        Err(e) => warn!(error = %e, "Logout request failed"),
      }
    }

    self.store.clear().await
  }
}

impl IdentityProvider for SupabaseAuth {
  async fn get_session(&self) -> Result<Option<SessionRecord>> {
    self.store.load().await
  }

  async fn refresh_session(&self) -> Result<SessionRecord> {
    let current = self
      .store
      .load()
      .await?
      .ok_or_else(|| eyre!("No session to refresh"))?;

    let session = self
      .token_grant(
        "refresh_token",
        json!({ "refresh_token": current.refresh_token }),
      )
      .await?;
    info!(expires_at = session.expires_at, "Session refreshed");
    Ok(session)
  }
}
