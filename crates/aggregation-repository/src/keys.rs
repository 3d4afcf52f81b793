//! Key-space encoding.
//!
//! Live entries live under `name \0 correlation-key`, completed entries under
//! `name-completed \0 exchange-id`. The NUL separator may not appear in a
//! repository name, and a name may not end in `-completed`, so one
//! repository's prefixes never alias another's.

use tracing::warn;

/// Byte separating a key-space name from the user key.
pub const SEPARATOR: u8 = 0;

/// Suffix appended to the repository name for the completed key-space.
pub const COMPLETED_SUFFIX: &str = "-completed";

/// Checks that `name` can be used as a repository namespace.
pub fn validate_repository_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("repository_name is required".to_string());
    }
    if name.as_bytes().contains(&SEPARATOR) {
        return Err(format!(
            "repository_name {:?} must not contain the NUL separator",
            name
        ));
    }
    if name.ends_with(COMPLETED_SUFFIX) {
        return Err(format!(
            "repository_name {:?} must not end with {:?}",
            name, COMPLETED_SUFFIX
        ));
    }
    Ok(())
}

/// The two key-spaces owned by one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    name: String,
    live_prefix: Vec<u8>,
    completed_prefix: Vec<u8>,
}

impl KeySpace {
    pub fn new(repository_name: &str) -> Result<Self, String> {
        validate_repository_name(repository_name)?;
        Ok(Self {
            name: repository_name.to_string(),
            live_prefix: prefix_for(repository_name),
            completed_prefix: prefix_for(&format!("{}{}", repository_name, COMPLETED_SUFFIX)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the completed key-space (`<name>-completed`).
    pub fn completed_name(&self) -> String {
        format!("{}{}", self.name, COMPLETED_SUFFIX)
    }

    pub fn live_prefix(&self) -> &[u8] {
        &self.live_prefix
    }

    pub fn completed_prefix(&self) -> &[u8] {
        &self.completed_prefix
    }

    pub fn live_key(&self, key: &str) -> Vec<u8> {
        join(&self.live_prefix, key)
    }

    pub fn completed_key(&self, exchange_id: &str) -> Vec<u8> {
        join(&self.completed_prefix, exchange_id)
    }

    /// Recovers the correlation key from a raw live key.
    pub fn decode_live(&self, raw: &[u8]) -> Option<String> {
        decode(&self.live_prefix, raw)
    }

    /// Recovers the exchange id from a raw completed key.
    pub fn decode_completed(&self, raw: &[u8]) -> Option<String> {
        decode(&self.completed_prefix, raw)
    }
}

fn prefix_for(space: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(space.len() + 1);
    prefix.extend_from_slice(space.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

fn join(prefix: &[u8], suffix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix.as_bytes());
    key
}

fn decode(prefix: &[u8], raw: &[u8]) -> Option<String> {
    let rest = raw.strip_prefix(prefix)?;
    match std::str::from_utf8(rest) {
        Ok(key) => Some(key.to_string()),
        Err(e) => {
            warn!(error = %e, "skipping stored key that is not valid UTF-8");
            None
        }
    }
}
