//! Snapshot serialization.
//!
//! The repository treats snapshots as opaque bytes produced by an
//! [`ExchangeCodec`]. [`JsonExchangeCodec`] is the default; a custom codec can
//! be supplied through `AggregationRepository::with_store`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::exchange::{Exchange, HeaderValue};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Codec error type.
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot written by an unknown codec version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// A float header or property that JSON cannot represent.
    #[error("{field} {name:?} holds non-finite number {value}")]
    NonFiniteNumber {
        field: &'static str,
        name: String,
        value: f64,
    },

    /// Failure reported by a custom codec.
    #[error("codec failure: {0}")]
    Custom(String),
}

/// Converts exchanges to and from stored bytes.
pub trait ExchangeCodec: Send + Sync {
    /// Serializes `exchange`. Non-primitive headers are dropped unless
    /// `allow_serialized_headers` is set.
    fn marshal(
        &self,
        exchange: &Exchange,
        allow_serialized_headers: bool,
    ) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Exchange, CodecError>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    exchange_id: &'a str,
    created_at: &'a DateTime<Utc>,
    body: &'a serde_json::Value,
    headers: BTreeMap<&'a str, &'a HeaderValue>,
    properties: &'a BTreeMap<String, HeaderValue>,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    exchange_id: String,
    created_at: DateTime<Utc>,
    body: serde_json::Value,
    #[serde(default)]
    headers: BTreeMap<String, HeaderValue>,
    #[serde(default)]
    properties: BTreeMap<String, HeaderValue>,
}

/// Versioned JSON envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExchangeCodec;

impl ExchangeCodec for JsonExchangeCodec {
    fn marshal(
        &self,
        exchange: &Exchange,
        allow_serialized_headers: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let headers = exchange
            .headers
            .iter()
            .filter(|(name, value)| {
                let keep = allow_serialized_headers || value.is_primitive();
                if !keep {
                    trace!(
                        header = %name,
                        exchange_id = %exchange.exchange_id,
                        "dropping non-primitive header"
                    );
                }
                keep
            })
            .map(|(name, value)| (name.as_str(), value))
            .collect::<BTreeMap<_, _>>();

        ensure_finite("header", headers.iter().map(|(name, value)| (*name, *value)))?;
        ensure_finite(
            "property",
            exchange.properties.iter().map(|(name, value)| (name.as_str(), value)),
        )?;

        let envelope = EnvelopeRef {
            version: SNAPSHOT_VERSION,
            exchange_id: &exchange.exchange_id,
            created_at: &exchange.created_at,
            body: &exchange.body,
            headers,
            properties: &exchange.properties,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Exchange, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope.version));
        }
        Ok(Exchange {
            exchange_id: envelope.exchange_id,
            created_at: envelope.created_at,
            body: envelope.body,
            headers: envelope.headers,
            properties: envelope.properties,
        })
    }
}

/// JSON has no NaN or infinity; serde_json would write them as `null` and
/// the snapshot would no longer decode.
fn ensure_finite<'a>(
    field: &'static str,
    values: impl Iterator<Item = (&'a str, &'a HeaderValue)>,
) -> Result<(), CodecError> {
    for (name, value) in values {
        if let HeaderValue::Float(f) = value {
            if !f.is_finite() {
                return Err(CodecError::NonFiniteNumber {
                    field,
                    name: name.to_string(),
                    value: *f,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Exchange {
        let mut exchange = Exchange::with_id("ex-1", json!({"lines": [1, 2, 3]}))
            .with_header("count", 3)
            .with_header("ratio", 0.5)
            .with_header("flag", true)
            .with_header("nothing", HeaderValue::Null)
            .with_header("customer", json!({"id": 7, "tier": "gold"}));
        exchange.set_property("blob", json!([1, 2]));
        exchange
    }

    #[test]
    fn marshal_drops_object_headers_by_default() {
        let codec = JsonExchangeCodec;
        let bytes = codec.marshal(&sample(), false).unwrap();
        let restored = codec.unmarshal(&bytes).unwrap();

        assert!(restored.header("customer").is_none());
        assert_eq!(restored.header("count"), Some(&HeaderValue::Int(3)));
        assert_eq!(restored.header("nothing"), Some(&HeaderValue::Null));
        // properties are never filtered
        assert_eq!(restored.property("blob"), Some(&HeaderValue::Object(json!([1, 2]))));
        assert_eq!(restored.body, sample().body);
    }

    #[test]
    fn marshal_keeps_object_headers_when_allowed() {
        let codec = JsonExchangeCodec;
        let original = sample();
        let restored = codec
            .unmarshal(&codec.marshal(&original, true).unwrap())
            .unwrap();

        assert_eq!(restored, original);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes =
            br#"{"version":99,"exchange_id":"x","created_at":"2024-01-01T00:00:00Z","body":null}"#;
        let err = JsonExchangeCodec.unmarshal(bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(99)));
    }

    #[test]
    fn garbage_is_a_json_error() {
        let err = JsonExchangeCodec.unmarshal(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let codec = JsonExchangeCodec;
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let exchange = Exchange::new(json!(1)).with_header("ratio", value);
            match codec.marshal(&exchange, false).unwrap_err() {
                CodecError::NonFiniteNumber { field, name, .. } => {
                    assert_eq!(field, "header");
                    assert_eq!(name, "ratio");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        let mut exchange = Exchange::new(json!(1));
        exchange.set_property("ratio", f64::NAN);
        let err = codec.marshal(&exchange, true).unwrap_err();
        assert!(matches!(err, CodecError::NonFiniteNumber { field: "property", .. }));
    }

    #[test]
    fn finite_float_headers_round_trip() {
        let codec = JsonExchangeCodec;
        let exchange = Exchange::new(json!(1))
            .with_header("ratio", f64::MAX)
            .with_header("tiny", -0.25);
        let restored = codec.unmarshal(&codec.marshal(&exchange, false).unwrap()).unwrap();
        assert_eq!(restored, exchange);
    }
}
