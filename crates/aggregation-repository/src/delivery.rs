//! Delivery collaborators used by the recovery scanner.
//!
//! The scanner hands recovered exchanges to a [`Redeliverer`] and exhausted
//! ones to a [`DeadLetterChannel`]. What those mean is up to the host
//! pipeline; this module ships the recording implementations used in tests,
//! a JSON-lines redeliverer for tooling, and an fsynced JSONL dead-letter
//! file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{CodecError, ExchangeCodec, JsonExchangeCodec};
use crate::exchange::Exchange;

/// Prefix of dead-letter destinations backed by a [`JsonlDeadLetterFile`].
pub const FILE_DESTINATION_PREFIX: &str = "file:";

/// Delivery error type.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The receiving side refused the exchange.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot encoding error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Stored snapshot is not valid base64
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Receives recovered exchanges for another pass through the pipeline.
pub trait Redeliverer: Send + Sync {
    fn redeliver(&self, exchange: Exchange) -> DeliveryResult<()>;
}

/// Receives exchanges whose redelivery budget is exhausted.
pub trait DeadLetterChannel: Send + Sync {
    /// Hands `exchange` to `destination`. An `Ok` return means the exchange
    /// is safe to drop from the repository.
    fn send(&self, destination: &str, exchange: &Exchange) -> DeliveryResult<()>;
}

/// A redeliverer that records every exchange it receives.
#[derive(Debug, Default)]
pub struct RecordingRedeliverer {
    delivered: Mutex<Vec<Exchange>>,
    failing: AtomicBool,
}

impl RecordingRedeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries fail (without recording) until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns all recorded exchanges in delivery order.
    pub fn delivered(&self) -> Vec<Exchange> {
        self.delivered.lock().clone()
    }

    /// Number of deliveries of `exchange_id`.
    pub fn count_for(&self, exchange_id: &str) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|exchange| exchange.exchange_id == exchange_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.delivered.lock().clear();
    }
}

impl Redeliverer for RecordingRedeliverer {
    fn redeliver(&self, exchange: Exchange) -> DeliveryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected(format!(
                "redelivery of {} refused",
                exchange.exchange_id
            )));
        }
        self.delivered.lock().push(exchange);
        Ok(())
    }
}

/// A dead-letter channel that records `(destination, exchange)` pairs.
#[derive(Debug, Default)]
pub struct RecordingDeadLetter {
    sent: Mutex<Vec<(String, Exchange)>>,
    failing: AtomicBool,
}

impl RecordingDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail (without recording) until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Exchange)> {
        self.sent.lock().clone()
    }

    pub fn count_for(&self, exchange_id: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(_, exchange)| exchange.exchange_id == exchange_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterChannel for RecordingDeadLetter {
    fn send(&self, destination: &str, exchange: &Exchange) -> DeliveryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected(format!(
                "dead letter {} refused {}",
                destination, exchange.exchange_id
            )));
        }
        self.sent
            .lock()
            .push((destination.to_string(), exchange.clone()));
        Ok(())
    }
}

/// Writes each redelivered exchange as one JSON line.
pub struct JsonLinesRedeliverer<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesRedeliverer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> Redeliverer for JsonLinesRedeliverer<W> {
    fn redeliver(&self, exchange: Exchange) -> DeliveryResult<()> {
        let line = serde_json::to_string(&exchange)?;
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// One escalated exchange in a dead-letter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub destination: String,
    pub exchange_id: String,
    /// Base64 of the snapshot encoded with [`JsonExchangeCodec`], every
    /// header included.
    pub snapshot_b64: String,
    /// RFC 3339 time the record was written.
    pub timestamp: String,
}

impl DeadLetterRecord {
    /// Decodes the escalated exchange.
    pub fn exchange(&self) -> DeliveryResult<Exchange> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&self.snapshot_b64)?;
        Ok(JsonExchangeCodec.unmarshal(&bytes)?)
    }
}

/// Append-only JSONL dead-letter sink. Every record is fsynced before
/// `send` returns.
pub struct JsonlDeadLetterFile {
    path: PathBuf,
    writer: Mutex<File>,
}

impl std::fmt::Debug for JsonlDeadLetterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlDeadLetterFile")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlDeadLetterFile {
    /// Opens or creates the file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> DeliveryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                DeliveryError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to open dead letter file {}: {}", path.display(), e),
                ))
            })?;

        info!(path = %path.display(), "dead letter file opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Resolves a `file:<path>` destination; `None` for any other scheme.
    pub fn for_destination(destination: &str) -> Option<DeliveryResult<Self>> {
        destination
            .strip_prefix(FILE_DESTINATION_PREFIX)
            .filter(|path| !path.is_empty())
            .map(Self::open)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record in the file at `path`. A missing file has none.
    pub fn read_records(path: impl AsRef<Path>) -> DeliveryResult<Vec<DeadLetterRecord>> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl DeadLetterChannel for JsonlDeadLetterFile {
    fn send(&self, destination: &str, exchange: &Exchange) -> DeliveryResult<()> {
        let snapshot = JsonExchangeCodec.marshal(exchange, true)?;
        let record = DeadLetterRecord {
            destination: destination.to_string(),
            exchange_id: exchange.exchange_id.clone(),
            snapshot_b64: base64::engine::general_purpose::STANDARD.encode(snapshot),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&record)?;

        let mut file = self.writer.lock();
        writeln!(file, "{}", line)?;
        file.sync_all()?;

        debug!(
            destination,
            exchange_id = %exchange.exchange_id,
            path = %self.path.display(),
            "exchange written to dead letter file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn recording_redeliverer_records_and_fails_on_demand() {
        let redeliverer = RecordingRedeliverer::new();
        redeliverer.redeliver(Exchange::with_id("a", json!(1))).unwrap();

        redeliverer.set_failing(true);
        let err = redeliverer.redeliver(Exchange::with_id("b", json!(2)));
        assert!(matches!(err, Err(DeliveryError::Rejected(_))));

        assert_eq!(redeliverer.len(), 1);
        assert_eq!(redeliverer.count_for("a"), 1);
        assert_eq!(redeliverer.count_for("b"), 0);
    }

    #[test]
    fn recording_dead_letter_keeps_destination() {
        let dead = RecordingDeadLetter::new();
        dead.send("mock:dead", &Exchange::with_id("a", json!(1))).unwrap();

        let sent = dead.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "mock:dead");
        assert_eq!(sent[0].1.exchange_id, "a");
    }

    #[test]
    fn json_lines_redeliverer_writes_one_line_per_exchange() {
        let redeliverer = JsonLinesRedeliverer::new(Vec::new());
        redeliverer.redeliver(Exchange::with_id("a", json!(1))).unwrap();
        redeliverer.redeliver(Exchange::with_id("b", json!(2))).unwrap();

        let out = String::from_utf8(redeliverer.into_inner()).unwrap();
        let ids: Vec<String> = out
            .lines()
            .map(|line| serde_json::from_str::<Exchange>(line).unwrap().exchange_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn dead_letter_file_appends_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq").join("orders.jsonl");
        let exchange = Exchange::with_id("ex-1", json!({"total": 3}))
            .with_header("customer", json!({"tier": "gold"}));

        {
            let file = JsonlDeadLetterFile::open(&path).unwrap();
            file.send("file:orders", &exchange).unwrap();
        }
        let file = JsonlDeadLetterFile::open(&path).unwrap();
        file.send("file:orders", &Exchange::with_id("ex-2", json!(null)))
            .unwrap();

        let records = JsonlDeadLetterFile::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].exchange_id, "ex-1");
        assert_eq!(records[0].destination, "file:orders");
        assert_eq!(records[0].exchange().unwrap(), exchange);
    }

    #[test]
    fn read_records_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let records = JsonlDeadLetterFile::read_records(dir.path().join("none.jsonl")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn file_destination_resolution() {
        let dir = tempdir().unwrap();
        let destination = format!("file:{}", dir.path().join("dead.jsonl").display());

        let file = JsonlDeadLetterFile::for_destination(&destination)
            .unwrap()
            .unwrap();
        assert_eq!(file.path(), dir.path().join("dead.jsonl"));
        assert!(JsonlDeadLetterFile::for_destination("mock:dead").is_none());
        assert!(JsonlDeadLetterFile::for_destination("file:").is_none());
    }
}
