use super::record::DeadLetterRecord;
use super::store::DeadLetterStore;
use crate::scheduler::PeriodicTask;
use chrono::{DateTime, Utc};
use relay_error::RelayResult;
use relay_metrics::DLQ_SWEEP_TOTAL;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-sweep counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub retried: usize,
    /// Retry or archive attempted but did not go through; the record stays
    /// parked for the next sweep
    pub failed: usize,
    /// Archived: out of retries or not recoverable
    pub discarded: usize,
    /// Left parked until `min_retry_delay` has passed
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Retry,
    Defer,
    Archive(&'static str),
}

/// Periodic sweep over the dead-letter store.
///
/// A record is retried when it has budget left, its last failure is at least
/// `min_retry_delay` old and its error is recoverable. Records out of budget
/// or with a terminal error are archived. Sweeps never overlap: a tick that
/// finds one in progress is skipped.
pub struct RetryCoordinator {
    store: Arc<DeadLetterStore>,
    sweeping: AtomicBool,
}

/// Clears the in-progress flag however the sweep ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryCoordinator {
    pub fn new(store: Arc<DeadLetterStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sweeping: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<DeadLetterStore> {
        &self.store
    }

    fn try_begin(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(&self.sweeping))
    }

    fn decide(&self, record: &DeadLetterRecord, now: DateTime<Utc>) -> Decision {
        if record.is_terminal() {
            return Decision::Archive("retries exhausted");
        }
        if !record.error_kind().is_recoverable() {
            return Decision::Archive("not recoverable");
        }
        let elapsed = now
            .signed_duration_since(record.last_error_timestamp)
            .to_std()
            .unwrap_or_default();
        if elapsed < self.store.config().min_retry_delay {
            return Decision::Defer;
        }
        Decision::Retry
    }

    /// Whether `record` would be retried by a sweep at `now`
    pub fn should_retry(&self, record: &DeadLetterRecord, now: DateTime<Utc>) -> bool {
        self.decide(record, now) == Decision::Retry
    }

    /// One pass over up to `sweep_batch_size` records. `None` if another
    /// sweep is still running.
    pub async fn sweep(&self) -> RelayResult<Option<SweepReport>> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Dead-letter sweep already running - skipping tick");
            return Ok(None);
        };

        let records = self.store.list(self.store.config().sweep_batch_size).await?;
        let now = Utc::now();
        let mut report = SweepReport::default();

        for record in records {
            report.processed += 1;
            match self.decide(&record, now) {
                Decision::Retry => match self.store.retry(&record.id).await {
                    Ok(true) => report.retried += 1,
                    Ok(false) => report.failed += 1,
                    Err(e) => {
                        tracing::warn!(message_id = %record.id, error = %e, "Dead-letter retry failed");
                        report.failed += 1;
                    }
                },
                Decision::Defer => report.deferred += 1,
                Decision::Archive(reason) => {
                    tracing::info!(
                        message_id = %record.id,
                        retry_count = record.retry_count,
                        error_type = record.error_kind().as_str(),
                        reason,
                        "Archiving dead letter"
                    );
                    match self.store.archive(&record.id).await {
                        Ok(_) => report.discarded += 1,
                        Err(e) => {
                            tracing::warn!(message_id = %record.id, error = %e, "Dead-letter archive failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        record_metrics(&report);
        if report.processed > 0 {
            tracing::info!(
                processed = report.processed,
                retried = report.retried,
                failed = report.failed,
                discarded = report.discarded,
                deferred = report.deferred,
                "Dead-letter sweep complete"
            );
        }
        Ok(Some(report))
    }

    /// Operator bulk retry: every parked record with budget left, ignoring
    /// the minimum delay and error classification.
    pub async fn retry_all(&self) -> RelayResult<SweepReport> {
        let records = self.store.list(usize::MAX).await?;
        let mut report = SweepReport::default();

        for record in records {
            report.processed += 1;
            if record.is_terminal() {
                report.deferred += 1;
                continue;
            }
            match self.store.retry(&record.id).await {
                Ok(true) => report.retried += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    tracing::warn!(message_id = %record.id, error = %e, "Dead-letter retry failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            retried = report.retried,
            failed = report.failed,
            "Bulk dead-letter retry complete"
        );
        Ok(report)
    }

    /// Operator purge. Each record is written to the archive before it is
    /// deleted. Returns the number purged.
    pub async fn clear(&self) -> RelayResult<usize> {
        let records = self.store.list(usize::MAX).await?;
        let mut purged = 0;
        for record in records {
            if self.store.delete(&record.id).await? {
                purged += 1;
            }
        }
        tracing::warn!(purged, "Dead-letter store cleared");
        Ok(purged)
    }

    /// Sweep every `sweep_interval` until cancelled
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        PeriodicTask::new("dlq-sweep", self.store.config().sweep_interval).spawn(token, move || {
            let coordinator = Arc::clone(&coordinator);
            async move {
                if let Err(e) = coordinator.sweep().await {
                    tracing::error!(error = %e, "Dead-letter sweep failed");
                }
            }
        })
    }
}

fn record_metrics(report: &SweepReport) {
    for (outcome, n) in [
        ("retried", report.retried),
        ("failed", report.failed),
        ("discarded", report.discarded),
        ("deferred", report.deferred),
    ] {
        if n > 0 {
            DLQ_SWEEP_TOTAL
                .with_label_values(&[outcome])
                .inc_by(n as u64);
        }
    }
}
