//! Ordered start-up and shutdown of a repository and its scanner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aggregation_store::KeyValueStore;
use tracing::{info, warn};

use crate::codec::JsonExchangeCodec;
use crate::config::RepositoryConfig;
use crate::delivery::{DeadLetterChannel, Redeliverer};
use crate::recovery::{RecoveryScanner, ScannerState};
use crate::repository::AggregationRepository;
use crate::RepositoryResult;

/// A running repository plus, when recovery is enabled, its scanner.
///
/// Shutdown stops the scanner (joining its thread) before the store is
/// closed. Dropping the service does the same.
#[derive(Debug)]
pub struct AggregationService {
    repository: Arc<AggregationRepository>,
    scanner: Option<RecoveryScanner>,
    shut_down: AtomicBool,
}

impl AggregationService {
    /// Validates `config`, opens a repository over `store` with the default
    /// codec and starts recovery if enabled. Nothing is opened when the
    /// configuration is invalid.
    pub fn start(
        config: RepositoryConfig,
        store: Arc<dyn KeyValueStore>,
        redeliverer: Arc<dyn Redeliverer>,
        dead_letter: Arc<dyn DeadLetterChannel>,
    ) -> RepositoryResult<Self> {
        config.validate_recovery()?;
        let repository =
            AggregationRepository::with_store(config, store, Arc::new(JsonExchangeCodec))?;
        Self::with_repository(Arc::new(repository), redeliverer, dead_letter)
    }

    /// Starts recovery for an already opened repository. If the scanner
    /// cannot start, the repository is closed.
    pub fn with_repository(
        repository: Arc<AggregationRepository>,
        redeliverer: Arc<dyn Redeliverer>,
        dead_letter: Arc<dyn DeadLetterChannel>,
    ) -> RepositoryResult<Self> {
        let scanner = if repository.config().use_recovery {
            match RecoveryScanner::start(Arc::clone(&repository), redeliverer, dead_letter) {
                Ok(scanner) => Some(scanner),
                Err(e) => {
                    if let Err(close_err) = repository.close() {
                        warn!(
                            repository = %repository.name(),
                            error = %close_err,
                            "failed to close repository after scanner start failure"
                        );
                    }
                    return Err(e);
                }
            }
        } else {
            info!(repository = %repository.name(), "recovery disabled, scanner not started");
            None
        };

        Ok(Self {
            repository,
            scanner,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn repository(&self) -> &Arc<AggregationRepository> {
        &self.repository
    }

    pub fn scanner(&self) -> Option<&RecoveryScanner> {
        self.scanner.as_ref()
    }

    /// `Stopped` when recovery is disabled or the service is shut down.
    pub fn scanner_state(&self) -> ScannerState {
        self.scanner
            .as_ref()
            .map_or(ScannerState::Stopped, RecoveryScanner::state)
    }

    /// Stops the scanner, then closes the store. Later calls are no-ops.
    pub fn shutdown(&self) -> RepositoryResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(scanner) = &self.scanner {
            scanner.stop();
        }
        self.repository.close()?;
        info!(repository = %self.repository.name(), "aggregation service shut down");
        Ok(())
    }
}

impl Drop for AggregationService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(
                repository = %self.repository.name(),
                error = %e,
                "aggregation service shutdown failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{RecordingDeadLetter, RecordingRedeliverer};
    use aggregation_store::MemoryStore;

    fn collaborators() -> (Arc<RecordingRedeliverer>, Arc<RecordingDeadLetter>) {
        (
            Arc::new(RecordingRedeliverer::new()),
            Arc::new(RecordingDeadLetter::new()),
        )
    }

    #[test]
    fn start_and_shutdown_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (redeliverer, dead) = collaborators();
        let config = RepositoryConfig {
            dead_letter_uri: Some("mock:dead".into()),
            ..RepositoryConfig::new("orders")
        };

        let service = AggregationService::start(config, store.clone(), redeliverer, dead).unwrap();
        assert_eq!(service.scanner_state(), ScannerState::Running);
        assert!(store.is_open());

        service.shutdown().unwrap();
        assert_eq!(service.scanner_state(), ScannerState::Stopped);
        assert!(!store.is_open());
        service.shutdown().unwrap();
    }

    #[test]
    fn invalid_recovery_config_never_opens_store() {
        let store = Arc::new(MemoryStore::new());
        let (redeliverer, dead) = collaborators();

        let result = AggregationService::start(
            RepositoryConfig::new("orders"),
            store.clone(),
            redeliverer,
            dead,
        );
        assert!(result.is_err());
        assert!(!store.is_open());
    }

    #[test]
    fn recovery_disabled_runs_without_scanner() {
        let store = Arc::new(MemoryStore::new());
        let (redeliverer, dead) = collaborators();
        let config = RepositoryConfig {
            use_recovery: false,
            ..RepositoryConfig::new("orders")
        };

        let service = AggregationService::start(config, store.clone(), redeliverer, dead).unwrap();
        assert!(service.scanner().is_none());
        assert_eq!(service.scanner_state(), ScannerState::Stopped);

        drop(service);
        assert!(!store.is_open());
    }
}
