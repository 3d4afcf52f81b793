//! Message snapshots stored by the repository.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header set on redelivered exchanges.
pub const REDELIVERED_HEADER: &str = "AggregationRedelivered";
/// Header carrying the 1-based redelivery attempt.
pub const REDELIVERY_COUNTER_HEADER: &str = "AggregationRedeliveryCounter";
/// Header carrying the configured redelivery budget.
pub const REDELIVERY_MAX_COUNTER_HEADER: &str = "AggregationRedeliveryMaxCounter";

/// A header or property value.
///
/// Everything except [`HeaderValue::Object`] is a primitive. Object headers
/// are only persisted when `allow_serialized_headers` is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HeaderValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Object(serde_json::Value),
}

impl HeaderValue {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, HeaderValue::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<serde_json::Value> for HeaderValue {
    fn from(value: serde_json::Value) -> Self {
        HeaderValue::Object(value)
    }
}

/// An aggregated message snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Unique id; completed entries are keyed by it.
    pub exchange_id: String,
    pub created_at: DateTime<Utc>,
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValue>,
    /// Exchange-scoped properties. Always persisted.
    #[serde(default)]
    pub properties: BTreeMap<String, HeaderValue>,
}

impl Exchange {
    /// Creates an exchange with a fresh UUID.
    pub fn new(body: impl Into<serde_json::Value>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    pub fn with_id(exchange_id: impl Into<String>, body: impl Into<serde_json::Value>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            created_at: Utc::now(),
            body: body.into(),
            headers: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder form of [`Exchange::set_header`].
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&HeaderValue> {
        self.properties.get(name)
    }

    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> &mut Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// True when the scanner has redelivered this snapshot at least once.
    pub fn is_redelivered(&self) -> bool {
        self.header(REDELIVERED_HEADER)
            .and_then(HeaderValue::as_bool)
            .unwrap_or(false)
    }

    /// The redelivery attempt stamped by the scanner, or 0.
    pub fn redelivery_counter(&self) -> u32 {
        self.header(REDELIVERY_COUNTER_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub(crate) fn stamp_redelivery(&mut self, attempt: u32, maximum: i32) {
        self.set_header(REDELIVERED_HEADER, true)
            .set_header(REDELIVERY_COUNTER_HEADER, attempt)
            .set_header(REDELIVERY_MAX_COUNTER_HEADER, maximum);
    }
}
