// ============================================================================
// Scheduled tasks
// ============================================================================
//
// Every timer in the relay goes through here so that it carries an explicit
// CancellationToken and runs on tokio's clock (tests pause and advance it).
//
// ============================================================================

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Fixed-interval background task.
///
/// The first tick fires one full period after start. Ticks missed while a
/// run is still in progress are skipped, never queued.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period }
    }

    /// Spawn the loop; `tick` runs to completion before the next tick is
    /// considered.
    pub fn spawn<F, Fut>(self, token: CancellationToken, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.period;
            let mut interval = tokio::time::interval_at(start, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                task = self.name,
                period_ms = self.period.as_millis() as u64,
                "Periodic task started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            tracing::info!(task = self.name, "Periodic task stopped");
        })
    }
}

/// Sleep that wakes early on cancellation. Returns `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
