use crate::error::Result;
use crate::result::RefresherStatus;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Last-outcome bookkeeping for every background refresher.
#[derive(Default)]
pub struct RefreshTracker {
    statuses: Mutex<BTreeMap<String, RefresherStatus>>,
}

impl RefreshTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, name: &str) {
        let mut statuses = self.lock();
        let status = statuses.entry(name.to_string()).or_insert_with(|| RefresherStatus {
            name: name.to_string(),
            ..Default::default()
        });
        status.last_success = Some(Utc::now());
        status.consecutive_failures = 0;
        status.last_error = None;
    }

    pub fn record_failure(&self, name: &str, error: String) {
        let mut statuses = self.lock();
        let status = statuses.entry(name.to_string()).or_insert_with(|| RefresherStatus {
            name: name.to_string(),
            ..Default::default()
        });
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_error = Some(error);
    }

    /// Sorted by refresher name.
    pub fn statuses(&self) -> Vec<RefresherStatus> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RefresherStatus>> {
        match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Runs one refresh and records the outcome. A failure is a staleness
/// warning: the previous snapshot stays in effect.
pub async fn run_once<Fut>(tracker: &RefreshTracker, name: &str, refresh: Fut) -> Result<()>
where
    Fut: Future<Output = Result<()>>,
{
    match refresh.await {
        Ok(()) => {
            tracker.record_success(name);
            debug!(refresher = name, "refresh succeeded");
            Ok(())
        }
        Err(err) => {
            warn!(refresher = name, error = %err, "refresh failed; serving stale data");
            tracker.record_failure(name, err.to_string());
            Err(err)
        }
    }
}

/// Spawns a loop that calls `refresh` every `period` until `shutdown` fires.
/// The first run happens one period after spawning.
pub fn spawn_refresh_loop<F, Fut>(
    name: String,
    period: Duration,
    tracker: Arc<RefreshTracker>,
    shutdown: CancellationToken,
    refresh: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = run_once(&tracker, &name, refresh()).await;
                }
            }
        }
        debug!(refresher = %name, "refresh loop stopped");
    })
}
