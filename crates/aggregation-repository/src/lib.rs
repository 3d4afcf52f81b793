//! # Aggregation Repository
//!
//! Durable staging for in-flight aggregated exchanges.
//!
//! A correlation key's in-progress snapshot lives in the *live* key-space
//! until the aggregation completes. [`AggregationRepository::remove`] then
//! moves it, in one atomic batch, to the *completed* key-space keyed by
//! exchange id, where it stays until downstream processing calls
//! [`AggregationRepository::confirm`].
//!
//! Anything left unconfirmed is picked up by the [`RecoveryScanner`]: it is
//! redelivered up to `maximum_redeliveries` times, then handed to the
//! dead-letter destination and dropped.
//!
//! ## Example
//!
//! ```rust
//! use aggregation_repository::{AggregationRepository, Exchange, RepositoryConfig};
//! use serde_json::json;
//!
//! let repo = AggregationRepository::in_memory(RepositoryConfig::new("orders")).unwrap();
//!
//! let snapshot = Exchange::new(json!({"lines": 3}));
//! repo.add("acct-7", &snapshot).unwrap();
//! assert_eq!(repo.get("acct-7").unwrap(), Some(snapshot.clone()));
//!
//! repo.remove("acct-7", &snapshot).unwrap();
//! assert!(repo.get("acct-7").unwrap().is_none());
//! assert!(repo.scan_completed().unwrap().contains(&snapshot.exchange_id));
//!
//! assert!(repo.confirm(&snapshot.exchange_id).unwrap());
//! ```

mod codec;
mod config;
mod delivery;
mod error;
mod exchange;
mod keys;
mod recovery;
mod repository;
mod service;

#[cfg(test)]
mod tests;

pub use codec::{CodecError, ExchangeCodec, JsonExchangeCodec, SNAPSHOT_VERSION};
pub use config::{
    RepositoryConfig, DEFAULT_MAXIMUM_REDELIVERIES, DEFAULT_RECOVERY_INTERVAL_MS, ENV_PREFIX,
};
pub use delivery::{
    DeadLetterChannel, DeadLetterRecord, DeliveryError, DeliveryResult, JsonLinesRedeliverer,
    JsonlDeadLetterFile, RecordingDeadLetter, RecordingRedeliverer, Redeliverer,
    FILE_DESTINATION_PREFIX,
};
pub use error::{RepositoryError, RepositoryResult};
pub use exchange::{
    Exchange, HeaderValue, REDELIVERED_HEADER, REDELIVERY_COUNTER_HEADER,
    REDELIVERY_MAX_COUNTER_HEADER,
};
pub use keys::{validate_repository_name, KeySpace, COMPLETED_SUFFIX, SEPARATOR};
pub use recovery::{CycleReport, RecoveryScanner, RecoveryTask, RedeliveryCounters, ScannerState};
pub use repository::{AggregationRepository, CompletedIds};
pub use service::AggregationService;
