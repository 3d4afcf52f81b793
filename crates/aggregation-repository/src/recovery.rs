//! Periodic recovery of unconfirmed completed exchanges.
//!
//! Every `recovery_interval_ms` the scanner walks the completed key-space.
//! Each entry is read, its redelivery counter incremented and stamped on the
//! exchange, then:
//!
//! - counter <= `maximum_redeliveries`: handed to the [`Redeliverer`]
//! - counter > `maximum_redeliveries`: sent once to the dead-letter
//!   destination, then confirmed (deleted)
//!
//! A failure on one entry is logged and the cycle moves on.
//!
//! # Cancellation
//!
//! The run-allowed flag is checked between entries. A halted cycle stops at
//! the next entry and leaves everything it has not visited in place.
//!
//! # Counters
//!
//! Counters live in process memory only. After a restart every staged
//! exchange starts a fresh redelivery budget, so across repeated crashes an
//! exchange can be redelivered more than `maximum_redeliveries` times in
//! total.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::delivery::{DeadLetterChannel, DeliveryError, Redeliverer};
use crate::repository::AggregationRepository;
use crate::{RepositoryError, RepositoryResult};

/// Lifecycle of a [`RecoveryScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Stopped,
    Running,
    Stopping,
}

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Completed entries visited.
    pub scanned: usize,
    pub redelivered: usize,
    pub escalated: usize,
    /// Entries whose recovery failed this cycle.
    pub failed: usize,
    /// The cycle stopped early because the scanner was halted.
    pub aborted: bool,
}

/// In-memory redelivery attempts per exchange id.
#[derive(Debug, Default)]
pub struct RedeliveryCounters {
    counts: Mutex<HashMap<String, u32>>,
}

impl RedeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the counter for `exchange_id` and returns the new value.
    pub fn increment(&self, exchange_id: &str) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(exchange_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn get(&self, exchange_id: &str) -> u32 {
        self.counts.lock().get(exchange_id).copied().unwrap_or(0)
    }

    pub fn remove(&self, exchange_id: &str) {
        self.counts.lock().remove(exchange_id);
    }

    /// Keeps only the counters whose id satisfies `keep`.
    pub fn retain<F: Fn(&str) -> bool>(&self, keep: F) {
        self.counts.lock().retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug)]
enum RecoveryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("redelivery failed: {0}")]
    Redelivery(#[source] DeliveryError),

    #[error("dead letter hand-off to {destination} failed: {source}")]
    DeadLetter {
        destination: String,
        source: DeliveryError,
    },
}

enum Outcome {
    Redelivered,
    Escalated,
    /// Confirmed between the scan and the read.
    Gone,
}

/// One repository's recovery logic, independent of scheduling.
pub struct RecoveryTask {
    repository: Arc<AggregationRepository>,
    redeliverer: Arc<dyn Redeliverer>,
    dead_letter: Arc<dyn DeadLetterChannel>,
    destination: String,
    counters: RedeliveryCounters,
    run_allowed: AtomicBool,
    cycle: Mutex<()>,
}

impl std::fmt::Debug for RecoveryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryTask")
            .field("repository", &self.repository.name())
            .field("destination", &self.destination)
            .field("tracked", &self.counters.len())
            .finish()
    }
}

impl RecoveryTask {
    /// Fails with a configuration error when recovery is disabled or its
    /// settings are incomplete.
    pub fn new(
        repository: Arc<AggregationRepository>,
        redeliverer: Arc<dyn Redeliverer>,
        dead_letter: Arc<dyn DeadLetterChannel>,
    ) -> RepositoryResult<Self> {
        let config = repository.config();
        if !config.use_recovery {
            return Err(RepositoryError::Config(format!(
                "recovery is disabled for repository {}",
                repository.name()
            )));
        }
        config.validate_recovery()?;
        let destination = config.dead_letter_uri.clone().unwrap_or_default();

        Ok(Self {
            repository,
            redeliverer,
            dead_letter,
            destination,
            counters: RedeliveryCounters::new(),
            run_allowed: AtomicBool::new(true),
            cycle: Mutex::new(()),
        })
    }

    pub fn repository(&self) -> &Arc<AggregationRepository> {
        &self.repository
    }

    /// Redelivery attempts recorded for `exchange_id` in this process.
    pub fn redelivery_count(&self, exchange_id: &str) -> u32 {
        self.counters.get(exchange_id)
    }

    pub fn counters(&self) -> &RedeliveryCounters {
        &self.counters
    }

    /// Makes the current and any later cycle stop before its next entry.
    pub fn halt(&self) {
        self.run_allowed.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.run_allowed.store(true, Ordering::SeqCst);
    }

    pub fn is_run_allowed(&self) -> bool {
        self.run_allowed.load(Ordering::SeqCst)
    }

    /// Runs one cycle over the completed key-space. Cycles never overlap.
    pub fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle.lock();
        let name = self.repository.name();
        let mut report = CycleReport::default();
        let mut visited = HashSet::new();
        let mut fully_visited = true;

        for id in self.repository.completed_ids() {
            if !self.is_run_allowed() {
                info!(repository = %name, scanned = report.scanned, "recovery cycle halted");
                report.aborted = true;
                fully_visited = false;
                break;
            }

            let id = match id {
                Ok(id) => id,
                Err(e) => {
                    warn!(repository = %name, error = %e, "failed to scan completed exchanges");
                    report.failed += 1;
                    fully_visited = false;
                    break;
                }
            };

            report.scanned += 1;
            match self.recover_one(&id) {
                Ok(Outcome::Redelivered) => report.redelivered += 1,
                Ok(Outcome::Escalated) => report.escalated += 1,
                Ok(Outcome::Gone) => {}
                Err(e @ RecoveryError::DeadLetter { .. }) => {
                    error!(
                        repository = %name,
                        exchange_id = %id,
                        error = %e,
                        "failed to escalate exchange"
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(
                        repository = %name,
                        exchange_id = %id,
                        error = %e,
                        "failed to recover exchange"
                    );
                    report.failed += 1;
                }
            }
            visited.insert(id);
        }

        if fully_visited {
            self.counters.retain(|id| visited.contains(id));
        }

        if report.scanned > 0 {
            debug!(repository = %name, ?report, "recovery cycle finished");
        } else {
            trace!(repository = %name, "recovery cycle found nothing to recover");
        }
        report
    }

    fn recover_one(&self, exchange_id: &str) -> Result<Outcome, RecoveryError> {
        let Some(mut exchange) = self.repository.recover(exchange_id)? else {
            self.counters.remove(exchange_id);
            return Ok(Outcome::Gone);
        };

        let maximum = self.repository.config().maximum_redeliveries;
        let attempt = self.counters.increment(exchange_id);
        exchange.stamp_redelivery(attempt, maximum);

        if i64::from(attempt) > i64::from(maximum) {
            warn!(
                repository = %self.repository.name(),
                exchange_id,
                attempt,
                destination = %self.destination,
                "redelivery budget exhausted, moving exchange to dead letter"
            );
            self.dead_letter
                .send(&self.destination, &exchange)
                .map_err(|source| RecoveryError::DeadLetter {
                    destination: self.destination.clone(),
                    source,
                })?;
            self.repository.confirm(exchange_id)?;
            self.counters.remove(exchange_id);
            Ok(Outcome::Escalated)
        } else {
            debug!(
                repository = %self.repository.name(),
                exchange_id,
                attempt,
                maximum,
                "redelivering exchange"
            );
            self.redeliverer
                .redeliver(exchange)
                .map_err(RecoveryError::Redelivery)?;
            Ok(Outcome::Redelivered)
        }
    }
}

/// Runs a [`RecoveryTask`] on a dedicated thread every recovery interval.
pub struct RecoveryScanner {
    task: Arc<RecoveryTask>,
    state: Mutex<ScannerState>,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RecoveryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryScanner")
            .field("task", &self.task)
            .field("state", &self.state())
            .finish()
    }
}

impl RecoveryScanner {
    /// Validates the recovery settings and starts the scan thread.
    pub fn start(
        repository: Arc<AggregationRepository>,
        redeliverer: Arc<dyn Redeliverer>,
        dead_letter: Arc<dyn DeadLetterChannel>,
    ) -> RepositoryResult<Self> {
        let task = Arc::new(RecoveryTask::new(repository, redeliverer, dead_letter)?);
        let interval = task.repository().config().recovery_interval();
        let name = task.repository().name().to_string();
        let (sender, receiver) = mpsc::channel::<()>();

        let worker_task = Arc::clone(&task);
        let worker = std::thread::Builder::new()
            .name(format!("aggregation-recovery-{}", name))
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !worker_task.is_run_allowed() {
                            break;
                        }
                        worker_task.run_cycle();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(
            repository = %name,
            interval_ms = interval.as_millis() as u64,
            maximum_redeliveries = task.repository().config().maximum_redeliveries,
            "recovery scanner started"
        );

        Ok(Self {
            task,
            state: Mutex::new(ScannerState::Running),
            shutdown: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn state(&self) -> ScannerState {
        *self.state.lock()
    }

    pub fn task(&self) -> &Arc<RecoveryTask> {
        &self.task
    }

    /// Runs one cycle on the calling thread, serialized with the scan thread.
    pub fn run_once(&self) -> CycleReport {
        self.task.run_cycle()
    }

    /// Halts the current cycle at its next entry and joins the scan thread.
    /// Stopping a stopped scanner is a no-op.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        *self.state.lock() = ScannerState::Stopping;
        self.task.halt();
        drop(self.shutdown.lock().take());

        if worker.join().is_err() {
            error!(repository = %self.task.repository().name(), "recovery scanner thread panicked");
        }
        *self.state.lock() = ScannerState::Stopped;
        info!(repository = %self.task.repository().name(), "recovery scanner stopped");
    }
}

impl Drop for RecoveryScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
