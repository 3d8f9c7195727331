use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Directory holding `doorstep.log`.
fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("doorstep"))
}

/// Install the global subscriber. Logs go to a file; `verbose` also mirrors
/// them to stderr and lowers the default level to debug. `RUST_LOG` overrides
/// the level either way. Keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::never(&dir, "doorstep.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let default_level = if verbose { "doorstep=debug" } else { "doorstep=info" };
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false);
  let result = if verbose {
    builder.with_writer(writer.and(std::io::stderr)).try_init()
  } else {
    builder.with_writer(writer).try_init()
  };
  result.map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
