//! Request and report envelopes.
//!
//! Every message on the wire is a JSON object with exactly one outer key, the
//! category, wrapping the body:
//!
//! ```json
//! {"print": {"sequence_id": "7", "command": "pause"}}
//! ```

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DecodeError, SendError};

/// Request parameters, keyed by field name.
pub type Params = BTreeMap<String, ParamValue>;

/// A request parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Text.
    Str(String),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// List of strings.
    StrList(Vec<String>),
    /// List of integers.
    IntList(Vec<i64>),
    /// Nested object.
    Object(Params),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<Params> for ParamValue {
    fn from(v: Params) -> Self {
        Self::Object(v)
    }
}

/// Build a [`Params`] map from `key => value` pairs.
#[macro_export]
macro_rules! params {
    () => { $crate::envelope::Params::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::envelope::Params::new();
        $( map.insert(($key).to_string(), $crate::envelope::ParamValue::from($value)); )+
        map
    }};
}

const SEQUENCE_ID: &str = "sequence_id";
const COMMAND: &str = "command";
const RESULT: &str = "result";
const REASON: &str = "reason";

/// An outbound command.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Outer key, e.g. `print` or `system`.
    pub category: String,
    /// Command name inside the category.
    pub command: String,
    /// Correlation id.
    pub sequence_id: String,
    /// Additional body fields.
    pub params: Params,
}

impl RequestEnvelope {
    /// Create an envelope.
    pub fn new(category: &str, command: &str, sequence_id: &str, params: Params) -> Self {
        Self {
            category: category.to_string(),
            command: command.to_string(),
            sequence_id: sequence_id.to_string(),
            params,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, SendError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for RequestEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut outer = serializer.serialize_map(Some(1))?;
        outer.serialize_entry(&self.category, &RequestBody(self))?;
        outer.end()
    }
}

struct RequestBody<'a>(&'a RequestEnvelope);

impl Serialize for RequestBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let envelope = self.0;
        let mut body = serializer.serialize_map(None)?;
        body.serialize_entry(SEQUENCE_ID, &envelope.sequence_id)?;
        body.serialize_entry(COMMAND, &envelope.command)?;
        // Explicit fields win over colliding parameters.
        for (key, value) in &envelope.params {
            if key != SEQUENCE_ID && key != COMMAND {
                body.serialize_entry(key, value)?;
            }
        }
        body.end()
    }
}

/// Encode a request envelope.
pub fn encode_request(
    category: &str,
    command: &str,
    sequence_id: &str,
    params: &Params,
) -> Result<Vec<u8>, SendError> {
    RequestEnvelope::new(category, command, sequence_id, params.clone()).encode()
}

/// An inbound event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportEnvelope {
    /// Outer key of the message.
    pub category: String,
    /// Correlation id echoed by the printer, if any.
    pub sequence_id: String,
    /// Command the report answers or announces, e.g. `push_status`.
    pub command: String,
    /// Result string, e.g. `success`.
    pub result: String,
    /// Failure reason.
    pub reason: String,
    /// Every other body field.
    pub extra_fields: Map<String, Value>,
}

impl ReportEnvelope {
    /// Look up a body field that is not one of the named ones.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra_fields.get(key)
    }

    /// Whether the printer reported success.
    pub fn succeeded(&self) -> bool {
        self.result.eq_ignore_ascii_case("success")
    }
}

/// Decode an inbound report.
///
/// Only payloads that are not JSON objects fail. Anything else decodes on a
/// best-effort basis: an empty object yields an empty envelope, extra outer
/// keys are ignored, and a non-object body yields just the category.
pub fn decode_report(bytes: &[u8]) -> Result<ReportEnvelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(outer) = value else {
        return Err(DecodeError::Malformed("top level is not an object".into()));
    };

    let Some((category, body)) = outer.into_iter().next() else {
        return Ok(ReportEnvelope::default());
    };

    let mut report = ReportEnvelope {
        category,
        ..ReportEnvelope::default()
    };

    let Value::Object(mut fields) = body else {
        return Ok(report);
    };

    report.sequence_id = match fields.remove(SEQUENCE_ID) {
        Some(Value::String(s)) => s,
        // Some firmware sends the id as a bare number.
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    report.command = take_string(&mut fields, COMMAND);
    report.result = take_string(&mut fields, RESULT);
    report.reason = take_string(&mut fields, REASON);
    report.extra_fields = fields;

    Ok(report)
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> String {
    match fields.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}
