//! Subcommands and their handlers.

use chrono::Utc;
use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::cache::{CacheStorage, NoopStorage, SqliteStorage, Strategy};
use crate::config::Config;
use crate::network::HttpClient;
use crate::router::{parse_header, RequestInfo, Router, RuleTable};
use crate::session::{
  terminal_events, IdentityProvider, SessionMonitor, SessionStore, SupabaseAuth,
};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show which cache rule handles a request
  Classify(RequestArgs),
  /// Fetch a URL through the cache router
  Fetch {
    #[command(flatten)]
    request: RequestArgs,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Inspect and maintain cache buckets
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Manage the signed-in session
  #[command(subcommand)]
  Session(SessionCommand),
}

#[derive(Args, Debug)]
pub struct RequestArgs {
  /// Absolute URL to request
  pub url: String,
  /// HTTP method
  #[arg(short = 'X', long, default_value = "GET")]
  pub method: String,
  /// Extra request header, 'Name: value' (repeatable)
  #[arg(short = 'H', long = "header")]
  pub headers: Vec<String>,
  /// Mark the request as a document navigation
  #[arg(long)]
  pub navigate: bool,
}

impl RequestArgs {
  fn to_request(&self) -> Result<RequestInfo> {
    let url =
      url::Url::parse(&self.url).map_err(|e| eyre!("Invalid URL '{}': {}", self.url, e))?;
    let mut request = RequestInfo::new(&self.method, url);
    for raw in &self.headers {
      let (name, value) = parse_header(raw)?;
      request = request.with_header(&name, &value);
    }
    if self.navigate {
      request = request.navigate();
    }
    Ok(request)
  }
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// List buckets, or the entries of one bucket
  List { bucket: Option<String> },
  /// Delete entries older than their bucket's age limit
  Purge,
  /// Delete one bucket, or every bucket
  Clear { bucket: Option<String> },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
  /// Show the stored session
  Status,
  /// Sign in with email and the password from DOORSTEP_PASSWORD
  Login {
    #[arg(long)]
    email: String,
  },
  /// Sign out and forget the stored session
  Logout,
  /// Refresh the session now
  Refresh,
  /// Keep the session fresh while running
  Watch {
    /// Treat the shell as installed regardless of launch hints
    #[arg(long)]
    standalone: bool,
  },
}

pub async fn run(command: Command, config: Config) -> Result<()> {
  match command {
    Command::Classify(args) => classify(&config, &args),
    Command::Fetch { request, output } => fetch(&config, &request, output).await,
    Command::Cache(cmd) => cache(&config, cmd),
    Command::Session(cmd) => session(&config, cmd).await,
  }
}

fn build_router(config: &Config) -> Result<Router<Box<dyn CacheStorage>>> {
  let rules = RuleTable::standard(&config.app.origin, config.cache.precache.clone())?;
  let storage: Box<dyn CacheStorage> = if config.cache.enabled {
    Box::new(SqliteStorage::open(config.cache.path.as_deref())?)
  } else {
    Box::new(NoopStorage)
  };
  Ok(Router::new(rules, storage))
}

fn classify(config: &Config, args: &RequestArgs) -> Result<()> {
  let rules = RuleTable::standard(&config.app.origin, config.cache.precache.clone())?;
  let request = args.to_request()?;
  let rule = rules
    .classify(&request)
    .ok_or_else(|| eyre!("No cache rule matches {}", request.url))?;
  let policy = &rule.policy;

  println!("rule:        {}", rule.name);
  if policy.strategy == Strategy::Precache && !rules.is_precached(&request) {
    println!("strategy:    {} (not in manifest, network passthrough)", policy.strategy);
  } else {
    println!("strategy:    {}", policy.strategy);
  }
  println!("bucket:      {}", policy.bucket);
  println!("max entries: {}", policy.limits.max_entries);
  if policy.limits.max_age_secs > 0 {
    println!("max age:     {}s", policy.limits.max_age_secs);
  }
  if policy.strategy == Strategy::NetworkFirst {
    println!("timeout:     {}s", policy.network_timeout.as_secs());
  }
  Ok(())
}

async fn fetch(config: &Config, args: &RequestArgs, output: Option<PathBuf>) -> Result<()> {
  let router = build_router(config)?;
  let network = HttpClient::new()?;
  let request = args.to_request()?;

  let outcome = router.handle(request, &network).await?;
  let response = outcome.response();
  eprintln!(
    "{} from {} [{} / {}]",
    response.status, outcome.result.source, outcome.strategy, outcome.bucket
  );
  if let Some(cached_at) = outcome.result.cached_at {
    eprintln!("cached at {}", cached_at.to_rfc3339());
  }

  match output {
    Some(path) => std::fs::write(&path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write response: {}", e))?,
  }

  // Let revalidation land before the process exits
  if let Some(background) = outcome.background {
    let _ = background.await;
  }
  Ok(())
}

fn cache(config: &Config, command: CacheCommand) -> Result<()> {
  let router = build_router(config)?;
  match command {
    CacheCommand::List { bucket: None } => {
      let buckets = router.buckets()?;
      if buckets.is_empty() {
        println!("cache is empty");
      }
      for b in buckets {
        let oldest = b.oldest.map(|t| t.to_rfc3339()).unwrap_or_default();
        let newest = b.newest.map(|t| t.to_rfc3339()).unwrap_or_default();
        println!(
          "{:<18} {:>5} entries  oldest {}  newest {}",
          b.bucket, b.entries, oldest, newest
        );
      }
    }
    CacheCommand::List {
      bucket: Some(bucket),
    } => {
      for entry in router.entries(&bucket)? {
        let key = entry.key.get(..12).unwrap_or(&entry.key);
        println!("{}  {}  {}", entry.cached_at.to_rfc3339(), key, entry.url);
      }
    }
    CacheCommand::Purge => {
      let purged = router.purge_expired()?;
      info!(purged, "Purged expired cache entries");
      println!("purged {} expired entries", purged);
    }
    CacheCommand::Clear { bucket } => {
      let cleared = router.clear(bucket.as_deref())?;
      info!(cleared, bucket = bucket.as_deref().unwrap_or("*"), "Cleared cache");
      println!("cleared {} entries", cleared);
    }
  }
  Ok(())
}

fn build_auth(config: &Config) -> Result<SupabaseAuth> {
  let path = match &config.session.path {
    Some(p) => p.clone(),
    None => SessionStore::default_path()?,
  };
  SupabaseAuth::new(
    config.identity.url.clone(),
    Config::get_anon_key()?,
    SessionStore::new(path),
  )
}

async fn session(config: &Config, command: SessionCommand) -> Result<()> {
  let auth = build_auth(config)?;
  match command {
    SessionCommand::Status => match auth.get_session().await? {
      Some(session) => {
        let who = session
          .user
          .as_ref()
          .map(|u| u.email.clone().unwrap_or_else(|| u.id.clone()))
          .unwrap_or_else(|| "unknown user".to_string());
        let expires = session
          .expires_at()
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| session.expires_at.to_string());
        println!("signed in as {}", who);
        println!(
          "expires {} ({}s remaining)",
          expires,
          session.remaining_secs(Utc::now())
        );
      }
      None => println!("not signed in"),
    },
    SessionCommand::Login { email } => {
      let password = Config::get_password()?;
      auth.sign_in_with_password(&email, &password).await?;
      println!("signed in as {}", email);
    }
    SessionCommand::Logout => {
      auth.sign_out().await?;
      println!("signed out");
    }
    SessionCommand::Refresh => {
      let session = auth.refresh_session().await?;
      println!("session refreshed, expires at {}", session.expires_at);
    }
    SessionCommand::Watch { standalone } => {
      let standalone = standalone || config.shell.is_standalone();
      let monitor = SessionMonitor::new(auth)
        .with_refresh_threshold(config.session.refresh_threshold())
        .with_mount_delay(config.session.mount_delay());
      let events = terminal_events(config.session.poll_interval());

      tokio::select! {
        _ = monitor.run(standalone, events) => {}
        _ = tokio::signal::ctrl_c() => info!("Session watch stopped"),
      }
    }
  }
  Ok(())
}
