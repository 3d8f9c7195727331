//! Session freshness monitor.
//!
//! Storage can lag behind right after the shell resumes, so every foreground
//! signal re-reads the session and refreshes it when it is close to expiry.
//! One restoration runs at a time; triggers arriving meanwhile are dropped.

use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::platform::LifecycleEvent;
use super::provider::IdentityProvider;

/// Sessions expiring within this window are refreshed.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(300);

/// Grace period on mount for persistent storage to come up.
pub const DEFAULT_MOUNT_DELAY: Duration = Duration::from_millis(100);

/// How a restoration attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
  /// Another restoration was already in flight
  Skipped,
  NoSession,
  Fresh,
  Refreshed,
  RefreshFailed,
  ReadFailed,
}

pub struct SessionMonitor<P> {
  provider: P,
  restore_in_flight: AtomicBool,
  refresh_threshold: Duration,
  mount_delay: Duration,
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<P: IdentityProvider> SessionMonitor<P> {
  pub fn new(provider: P) -> Self {
    Self {
      provider,
      restore_in_flight: AtomicBool::new(false),
      refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
      mount_delay: DEFAULT_MOUNT_DELAY,
    }
  }

  pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
    self.refresh_threshold = threshold;
    self
  }

  pub fn with_mount_delay(mut self, delay: Duration) -> Self {
    self.mount_delay = delay;
    self
  }

  #[cfg(test)]
  fn provider(&self) -> &P {
    &self.provider
  }

  /// Read the session and refresh it if it expires within the threshold.
  pub async fn restore_session(&self) -> RestoreOutcome {
    // Claimed before the first await so overlapping triggers see it
    if self.restore_in_flight.swap(true, Ordering::AcqRel) {
      debug!("Session restore already in flight");
      return RestoreOutcome::Skipped;
    }
    let _in_flight = InFlight(&self.restore_in_flight);

    let session = match self.provider.get_session().await {
      Ok(Some(session)) => session,
      Ok(None) => {
        debug!("No session to restore");
        return RestoreOutcome::NoSession;
      }
      Err(e) => {
        warn!(error = %e, "Failed to read session");
        return RestoreOutcome::ReadFailed;
      }
    };

    let remaining = session.remaining_secs(Utc::now());
    if remaining >= self.refresh_threshold.as_secs() as i64 {
      debug!(remaining, "Session is fresh");
      return RestoreOutcome::Fresh;
    }

    info!(remaining, "Session expiring soon, refreshing");
    match self.provider.refresh_session().await {
      Ok(refreshed) => {
        debug!(expires_at = refreshed.expires_at, "Session refresh succeeded");
        RestoreOutcome::Refreshed
      }
      Err(e) => {
        // Next lifecycle trigger retries
        warn!(error = %e, "Session refresh failed");
        RestoreOutcome::RefreshFailed
      }
    }
  }

  /// React to one lifecycle event. Returns None when the event does not
  /// trigger a restoration.
  pub async fn handle_event(
    &self,
    standalone: bool,
    event: LifecycleEvent,
  ) -> Option<RestoreOutcome> {
    if !standalone || !event.triggers_restore() {
      return None;
    }
    if event == LifecycleEvent::Mount {
      tokio::time::sleep(self.mount_delay).await;
    }
    Some(self.restore_session().await)
  }

  /// Consume lifecycle events until the stream ends. Events are handled
  /// concurrently, as a browser host would interleave its listeners.
  pub async fn run<S>(&self, standalone: bool, events: S)
  where
    S: Stream<Item = LifecycleEvent>,
  {
    if standalone {
      info!("Session monitor watching lifecycle events");
    } else {
      info!("Not running as an installed shell, session monitor stays idle");
    }

    events
      .for_each_concurrent(None, |event| async move {
        if let Some(outcome) = self.handle_event(standalone, event).await {
          debug!(?event, ?outcome, "Lifecycle event handled");
        }
      })
      .await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::types::SessionRecord;
  use color_eyre::{eyre::eyre, Result};
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  /// Provider holding a session in memory, counting calls.
  #[derive(Default)]
  struct FakeProvider {
    session: Mutex<Option<SessionRecord>>,
    fail_read: AtomicBool,
    fail_refresh: AtomicBool,
    reads: AtomicUsize,
    refreshes: AtomicUsize,
  }

  impl FakeProvider {
    fn expiring_in(secs: i64) -> Self {
      let provider = Self::default();
      *provider.session.lock().unwrap() = Some(session(secs));
      provider
    }

    fn reads(&self) -> usize {
      self.reads.load(Ordering::SeqCst)
    }

    fn refreshes(&self) -> usize {
      self.refreshes.load(Ordering::SeqCst)
    }
  }

  fn session(expires_in: i64) -> SessionRecord {
    SessionRecord {
      access_token: "access".to_string(),
      refresh_token: "refresh".to_string(),
      token_type: "bearer".to_string(),
      expires_at: Utc::now().timestamp() + expires_in,
      user: None,
    }
  }

  impl IdentityProvider for FakeProvider {
    async fn get_session(&self) -> Result<Option<SessionRecord>> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      // Storage reads suspend, giving overlapping triggers a chance to run
      tokio::task::yield_now().await;
      if self.fail_read.load(Ordering::SeqCst) {
        return Err(eyre!("storage unavailable"));
      }
      Ok(self.session.lock().unwrap().clone())
    }

    async fn refresh_session(&self) -> Result<SessionRecord> {
      self.refreshes.fetch_add(1, Ordering::SeqCst);
      tokio::task::yield_now().await;
      if self.fail_refresh.load(Ordering::SeqCst) {
        return Err(eyre!("refresh token revoked"));
      }
      let refreshed = session(3600);
      *self.session.lock().unwrap() = Some(refreshed.clone());
      Ok(refreshed)
    }
  }

  #[tokio::test]
  async fn test_refreshes_when_close_to_expiry() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(200));
    assert_eq!(monitor.restore_session().await, RestoreOutcome::Refreshed);
    assert_eq!(monitor.provider().refreshes(), 1);

    // The refreshed session is an hour out, so the next pass leaves it alone
    assert_eq!(monitor.restore_session().await, RestoreOutcome::Fresh);
    assert_eq!(monitor.provider().refreshes(), 1);
  }

  #[tokio::test]
  async fn test_fresh_session_is_not_refreshed() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(600));
    assert_eq!(monitor.restore_session().await, RestoreOutcome::Fresh);
    assert_eq!(monitor.provider().refreshes(), 0);
  }

  #[tokio::test]
  async fn test_no_session_is_a_no_op() {
    let monitor = SessionMonitor::new(FakeProvider::default());
    assert_eq!(monitor.restore_session().await, RestoreOutcome::NoSession);
    assert_eq!(monitor.provider().refreshes(), 0);
  }

  #[tokio::test]
  async fn test_overlapping_restores_run_once() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(200));

    let (first, second) = tokio::join!(monitor.restore_session(), monitor.restore_session());

    assert_eq!(first, RestoreOutcome::Refreshed);
    assert_eq!(second, RestoreOutcome::Skipped);
    assert_eq!(monitor.provider().reads(), 1);
    assert_eq!(monitor.provider().refreshes(), 1);
  }

  #[tokio::test]
  async fn test_guard_released_after_failures() {
    let provider = FakeProvider::expiring_in(200);
    provider.fail_read.store(true, Ordering::SeqCst);
    let monitor = SessionMonitor::new(provider);

    assert_eq!(monitor.restore_session().await, RestoreOutcome::ReadFailed);

    monitor.provider().fail_read.store(false, Ordering::SeqCst);
    monitor.provider().fail_refresh.store(true, Ordering::SeqCst);
    assert_eq!(monitor.restore_session().await, RestoreOutcome::RefreshFailed);

    // No retry is scheduled; the next trigger tries again
    monitor.provider().fail_refresh.store(false, Ordering::SeqCst);
    assert_eq!(monitor.restore_session().await, RestoreOutcome::Refreshed);
    assert_eq!(monitor.provider().reads(), 3);
  }

  #[tokio::test]
  async fn test_non_standalone_never_restores() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(200));
    let events = futures::stream::iter([
      LifecycleEvent::Mount,
      LifecycleEvent::VisibilityChanged { visible: true },
      LifecycleEvent::Focus,
      LifecycleEvent::PageShow { persisted: true },
    ]);

    monitor.run(false, events).await;
    assert_eq!(monitor.provider().reads(), 0);
    assert_eq!(monitor.provider().refreshes(), 0);
  }

  #[tokio::test]
  async fn test_only_foreground_events_trigger() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(600));

    for event in [
      LifecycleEvent::VisibilityChanged { visible: false },
      LifecycleEvent::PageShow { persisted: false },
    ] {
      assert_eq!(monitor.handle_event(true, event).await, None);
    }
    assert_eq!(monitor.provider().reads(), 0);

    assert_eq!(
      monitor
        .handle_event(true, LifecycleEvent::PageShow { persisted: true })
        .await,
      Some(RestoreOutcome::Fresh)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_mount_waits_for_storage() {
    let monitor = SessionMonitor::new(FakeProvider::expiring_in(600))
      .with_mount_delay(Duration::from_millis(100));
    let started = tokio::time::Instant::now();

    let outcome = monitor.handle_event(true, LifecycleEvent::Mount).await;
    assert_eq!(outcome, Some(RestoreOutcome::Fresh));
    assert!(started.elapsed() >= Duration::from_millis(100));
  }

  #[tokio::test]
  async fn test_burst_of_triggers_refreshes_once() {
    let monitor =
      SessionMonitor::new(FakeProvider::expiring_in(200)).with_mount_delay(Duration::ZERO);
    let events = futures::stream::iter([
      LifecycleEvent::VisibilityChanged { visible: true },
      LifecycleEvent::Focus,
      LifecycleEvent::PageShow { persisted: true },
    ]);

    monitor.run(true, events).await;
    assert_eq!(monitor.provider().refreshes(), 1);
  }
}
