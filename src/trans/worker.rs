//! Recovery Scheduler
//!
//! Background worker that repeatedly leases one due, non-terminal
//! transaction and drives it forward. Any number of workers, in this
//! process or others, may poll the same store; they coordinate only through
//! the store's lease primitive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::error::TransError;
use super::invoker::BranchInvoker;
use super::processor::{Processor, Progress};
use super::state::GlobalStatus;
use super::store::TransStore;
use crate::config::SchedulerConfig;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when nothing is due
    pub poll_interval: Duration,
    /// Look-ahead passed to the lease; zero only claims overdue records
    pub expire_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            expire_window: Duration::ZERO,
        }
    }
}

impl From<&SchedulerConfig> for WorkerConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            expire_window: Duration::from_secs(config.expire_window_secs),
        }
    }
}

/// Cooperative stop flag shared by all workers
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    shutdown: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// What one scheduler iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub gid: String,
    pub status: GlobalStatus,
    pub progress: Progress,
}

/// Recovery Scheduler
///
/// Claims exactly one transaction per iteration, so a stalled worker holds
/// at most one lease.
pub struct RecoveryScheduler {
    store: Arc<dyn TransStore>,
    processor: Processor,
    backoff: Arc<dyn BackoffPolicy>,
    config: WorkerConfig,
}

impl RecoveryScheduler {
    pub fn new(
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
        backoff: Arc<dyn BackoffPolicy>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            processor: Processor::new(store.clone(), invoker),
            store,
            backoff,
            config,
        }
    }

    /// Lease one due transaction and drive it.
    ///
    /// `Ok(None)` means nothing was due. A non-terminal record is always
    /// rescheduled, also when processing failed.
    pub async fn run_once(&self) -> Result<Option<Attempt>, TransError> {
        let mut global = match self
            .store
            .lease_due_transaction(self.config.expire_window)
            .await
        {
            Ok(global) => global,
            Err(TransError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let current = Duration::from_secs(u64::try_from(global.next_cron_interval).unwrap_or(0));
        let result = self.processor.process(&mut global).await;

        if !global.status.is_terminal() {
            let progressed = matches!(result, Ok(p) if p.made_progress());
            let interval = self.backoff.next_interval(current, progressed);
            match self.store.schedule_next_attempt(&mut global, interval).await {
                Ok(()) => debug!(
                    gid = %global.gid,
                    status = %global.status,
                    interval_secs = interval.as_secs(),
                    "Next attempt scheduled"
                ),
                // Keep the processing error, it is the more useful one
                Err(e) if result.is_err() => {
                    warn!(gid = %global.gid, error = %e, "Failed to reschedule transaction")
                }
                Err(e) => return Err(e),
            }
        }

        let progress = result?;
        Ok(Some(Attempt {
            gid: global.gid,
            status: global.status,
            progress,
        }))
    }

    /// Run the recovery loop until `shutdown` is requested.
    ///
    /// Due transactions are drained back to back; the worker sleeps only
    /// when nothing is due or the store failed.
    pub async fn run(&self, shutdown: &ShutdownSignal) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            expire_window_secs = self.config.expire_window.as_secs(),
            "Starting recovery scheduler"
        );

        while !shutdown.is_shutdown_requested() {
            match self.run_once().await {
                Ok(Some(attempt)) => {
                    if attempt.progress == Progress::Finished {
                        info!(gid = %attempt.gid, status = %attempt.status, "Transaction finished");
                    }
                }
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, code = e.code(), "Recovery attempt failed, will retry");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(error = %e, code = e.code(), "Recovery attempt failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!("Recovery scheduler stopped");
    }

    /// Start `workers` independent loops on the tokio runtime
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        shutdown: Arc<ShutdownSignal>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|_| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.run(&shutdown).await })
            })
            .collect()
    }
}
