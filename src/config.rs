use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::session::ShellHints;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub app: AppConfig,
  pub identity: IdentityConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
  /// How the shell was launched; decides whether the session monitor runs
  #[serde(default)]
  pub shell: ShellHints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Origin the booking app is served from, e.g. "https://fixit.example.com"
  pub origin: Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
  /// Supabase project URL
  pub url: Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to run every request against the network
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Cache database location (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// App shell paths served from the precache
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      precache: default_precache(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_precache() -> Vec<String> {
  ["/", "/manifest.json", "/offline"]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  /// Refresh sessions expiring within this many seconds
  pub refresh_threshold_secs: u64,
  /// Delay before the first restore on startup
  pub mount_delay_ms: u64,
  /// Interval of the focus tick in `session watch`
  pub poll_interval_secs: u64,
  /// Session file location (defaults to the data directory)
  pub path: Option<PathBuf>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      refresh_threshold_secs: 300,
      mount_delay_ms: 100,
      poll_interval_secs: 60,
      path: None,
    }
  }
}

impl SessionConfig {
  pub fn refresh_threshold(&self) -> Duration {
    Duration::from_secs(self.refresh_threshold_secs)
  }

  pub fn mount_delay(&self) -> Duration {
    Duration::from_millis(self.mount_delay_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./doorstep.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/doorstep/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/doorstep/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("doorstep.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("doorstep").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the Supabase anon key from environment variables.
  ///
  /// Checks DOORSTEP_SUPABASE_ANON_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_anon_key() -> Result<String> {
    std::env::var("DOORSTEP_SUPABASE_ANON_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!(
          "Supabase anon key not found. Set DOORSTEP_SUPABASE_ANON_KEY or SUPABASE_ANON_KEY environment variable."
        )
      })
  }

  /// Get the account password from environment variables.
  ///
  /// Checks DOORSTEP_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("DOORSTEP_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set DOORSTEP_PASSWORD environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
app:
  origin: https://fixit.example.com
identity:
  url: https://abc.supabase.co
"#;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(MINIMAL).unwrap();
    assert_eq!(config.app.origin.as_str(), "https://fixit.example.com/");
    assert!(config.cache.enabled);
    assert_eq!(config.cache.precache, default_precache());
    assert_eq!(config.session.refresh_threshold(), Duration::from_secs(300));
    assert_eq!(config.session.mount_delay(), Duration::from_millis(100));
    assert!(!config.shell.is_standalone());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
app:
  origin: https://fixit.example.com
identity:
  url: https://abc.supabase.co
cache:
  enabled: false
  path: /tmp/doorstep-cache.db
  precache: ["/", "/offline"]
session:
  refresh_threshold_secs: 120
  poll_interval_secs: 0
shell:
  display_mode: standalone
"#;
    let config = Config::parse(yaml).unwrap();
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.precache.len(), 2);
    assert_eq!(config.session.refresh_threshold_secs, 120);
    assert_eq!(config.session.mount_delay_ms, 100);
    assert_eq!(config.session.poll_interval(), Duration::from_secs(1));
    assert!(config.shell.is_standalone());
  }

  #[test]
  fn test_missing_sections_and_bad_urls_are_errors() {
    assert!(Config::parse("app:\n  origin: https://fixit.example.com\n").is_err());
    assert!(Config::parse("app:\n  origin: not a url\nidentity:\n  url: https://a.b\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/doorstep.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
