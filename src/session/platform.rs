//! Host lifecycle signals the session monitor reacts to.

use futures::Stream;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Lifecycle events of the application shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Application started
  Mount,
  VisibilityChanged { visible: bool },
  Focus,
  /// Page shown; `persisted` when restored from the back-forward cache
  PageShow { persisted: bool },
}

impl LifecycleEvent {
  pub fn triggers_restore(&self) -> bool {
    match self {
      Self::Mount | Self::Focus => true,
      Self::VisibilityChanged { visible } => *visible,
      Self::PageShow { persisted } => *persisted,
    }
  }
}

/// What the host knows about how the app was launched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellHints {
  /// The matching `display-mode` media feature, e.g. "standalone"
  pub display_mode: Option<String>,
  /// Platform flag set when launched from the home screen
  #[serde(default)]
  pub standalone: bool,
  /// Document referrer at launch
  pub referrer: Option<String>,
}

impl ShellHints {
  /// Whether the app runs as an installed shell rather than a browser tab.
  pub fn is_standalone(&self) -> bool {
    let display_mode = self
      .display_mode
      .as_deref()
      .is_some_and(|mode| matches!(mode, "standalone" | "fullscreen" | "minimal-ui"));
    let trusted_web_activity = self
      .referrer
      .as_deref()
      .is_some_and(|r| r.starts_with("android-app://"));

    display_mode || self.standalone || trusted_web_activity
  }
}

/// Lifecycle events of a terminal process: `Mount` at start, `Focus` on every
/// poll tick, `VisibilityChanged { visible: true }` on SIGUSR1 and
/// `PageShow { persisted: true }` on SIGUSR2 (Unix). SIGUSR2 stands in for a
/// resume from a suspended state, the closest a process has to the
/// back-forward cache.
pub fn terminal_events(poll_interval: Duration) -> impl Stream<Item = LifecycleEvent> {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let _ = tx.send(LifecycleEvent::Mount);

  let tick_tx = tx.clone();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(poll_interval);
    // The first tick fires immediately; Mount already covers startup
    interval.tick().await;
    loop {
      interval.tick().await;
      if tick_tx.send(LifecycleEvent::Focus).is_err() {
        break;
      }
    }
  });

  #[cfg(unix)]
  {
    use tokio::signal::unix::SignalKind;

    forward_signal(
      SignalKind::user_defined1(),
      "SIGUSR1",
      LifecycleEvent::VisibilityChanged { visible: true },
      tx.clone(),
    );
    forward_signal(
      SignalKind::user_defined2(),
      "SIGUSR2",
      LifecycleEvent::PageShow { persisted: true },
      tx,
    );
  }

  futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

/// Send `event` every time the process receives `kind`. The handler is
/// installed before returning, so the signal is never delivered unhandled.
#[cfg(unix)]
fn forward_signal(
  kind: tokio::signal::unix::SignalKind,
  name: &'static str,
  event: LifecycleEvent,
  tx: mpsc::UnboundedSender<LifecycleEvent>,
) {
  let mut signal = match tokio::signal::unix::signal(kind) {
    Ok(s) => s,
    Err(e) => {
      warn!(signal = name, error = %e, "Could not listen for signal");
      return;
    }
  };

  tokio::spawn(async move {
    while signal.recv().await.is_some() {
      if tx.send(event).is_err() {
        break;
      }
    }
  });
}
