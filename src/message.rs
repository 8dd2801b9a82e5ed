//! Wire message envelopes.
//!
//! Every frame on the wire is a single UTF-8 JSON object in one of two
//! shapes:
//!
//! - Command:   `{ "command": "<name>", "data": <payload> }`, a request
//!   that may produce a reply on the connection it arrived on
//! - Data push: `{ "dataName": "<name>", "data": <payload> }`, one-way
//!
//! Big integers are tolerated as decimal strings on input; the `index` key
//! specifically is decoded back to a `u64` wherever it appears (block
//! payloads, `getBlock`, proof-of-work candidates).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, Result};

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Envelope {
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Data {
        #[serde(rename = "dataName")]
        data_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl Envelope {
    pub fn command(name: &str, data: impl Serialize) -> Self {
        Envelope::Command {
            command: name.to_string(),
            data: serde_json::to_value(data).ok(),
        }
    }

    pub fn bare_command(name: &str) -> Self {
        Envelope::Command {
            command: name.to_string(),
            data: None,
        }
    }

    pub fn data(name: &str, data: impl Serialize) -> Self {
        Envelope::Data {
            data_name: name.to_string(),
            data: serde_json::to_value(data).ok(),
        }
    }

    /// Parse one wire frame. Callers at the transport boundary drop the
    /// frame silently on error; internal callers propagate.
    pub fn parse(line: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// BIG-INTEGER FIELDS
// ============================================================================

/// Decode an int-like JSON value (`7`, `"7"`). Non-integral numbers are
/// rejected, not truncated.
pub fn parse_index(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Serde adapter for `u64` fields that peers may emit as decimal strings.
/// Always serializes as a plain JSON number.
pub mod index_serde {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct IndexVisitor;

        impl<'de> Visitor<'de> for IndexVisitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an unsigned integer or its decimal string form")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
                u64::try_from(v).map_err(|_| E::custom("negative index"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.trim().parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IndexVisitor)
    }
}

/// Like [`parse_index`] but for payloads where a missing or malformed value
/// is a caller error worth reporting.
pub fn require_index(value: Option<&Value>) -> Result<u64> {
    value
        .and_then(parse_index)
        .ok_or_else(|| NodeError::validation("expected an integer index"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_round_trip() {
        let env = Envelope::command("getBlock", json!(3));
        let line = env.to_line();
        assert!(line.contains("\"command\":\"getBlock\""));
        assert_eq!(Envelope::parse(&line).unwrap(), env);
    }

    #[test]
    fn test_data_push_shape() {
        let env = Envelope::data("nodes", json!([{"id": "n1", "url": "tcp://a:1"}]));
        let line = env.to_line();
        assert!(line.contains("\"dataName\":\"nodes\""));
        match Envelope::parse(&line).unwrap() {
            Envelope::Data { data_name, data } => {
                assert_eq!(data_name, "nodes");
                assert!(data.unwrap().is_array());
            }
            other => panic!("expected data push, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_accepts_string_form() {
        assert_eq!(parse_index(&json!(42)), Some(42));
        assert_eq!(parse_index(&json!("42")), Some(42));
        assert_eq!(parse_index(&json!(" 7 ")), Some(7));
        assert_eq!(parse_index(&json!(4.5)), None);
        assert_eq!(parse_index(&json!(-1)), None);
        assert_eq!(parse_index(&json!(null)), None);
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse("{\"neither\": 1}").is_err());
    }
}
