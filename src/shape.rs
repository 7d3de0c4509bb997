//! Shape-directed value codec.
//!
//! Values cross the wire as JSON, XML, or form/query strings; this module
//! holds the protocol-independent half: leaf encodings (timestamps, blobs,
//! numbers, booleans), the JSON composite codec, and request validation
//! against a declared shape.
//!
//! Convention for user-facing values: timestamps are epoch seconds (numbers;
//! ISO-8601 strings are accepted on input), blobs are raw strings that get
//! base64-encoded only in body contexts, never in `header` or `uri`
//! locations. Null-kind shapes carry no data: they encode and decode to JSON
//! null, their leaf text is empty, and only an absent or null value
//! validates.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value, json};

use crate::anomaly::Anomaly;
use crate::service::{Service, Shape, ShapeRef};

/// Where a leaf value is headed; picks the default timestamp format and the
/// blob policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafContext {
    /// URI path or query string: iso8601 timestamps, raw blobs.
    Query,
    /// Header values: rfc822 timestamps, raw blobs.
    Header,
    /// XML or form body: iso8601 timestamps, base64 blobs.
    XmlBody,
    /// JSON body: unix timestamps, base64 blobs.
    JsonBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    Iso8601,
    UnixTimestamp,
    Rfc822,
}

impl TimeFormat {
    /// Resolves the shape's declared format, falling back to the context
    /// default.
    pub fn resolve(declared: Option<&str>, ctx: LeafContext) -> Self {
        match declared {
            Some("iso8601") => TimeFormat::Iso8601,
            Some("unixTimestamp") => TimeFormat::UnixTimestamp,
            Some("rfc822") => TimeFormat::Rfc822,
            _ => match ctx {
                LeafContext::Query | LeafContext::XmlBody => TimeFormat::Iso8601,
                LeafContext::Header => TimeFormat::Rfc822,
                LeafContext::JsonBody => TimeFormat::UnixTimestamp,
            },
        }
    }
}

/// Accepts an epoch-seconds number or an ISO-8601 / RFC 2822 string.
pub(crate) fn to_instant(value: &Value) -> Result<DateTime<Utc>, Anomaly> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| Anomaly::incorrect("timestamp out of range"))?;
            Utc.timestamp_opt(secs.trunc() as i64, ((secs.fract()) * 1e9) as u32)
                .single()
                .ok_or_else(|| Anomaly::incorrect("timestamp out of range"))
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| DateTime::parse_from_rfc2822(s).map(|t| t.with_timezone(&Utc)))
            .map_err(|_| Anomaly::incorrect(format!("unparseable timestamp {s:?}"))),
        other => Err(Anomaly::incorrect(format!(
            "expected timestamp, got {other}"
        ))),
    }
}

pub(crate) fn format_instant(t: DateTime<Utc>, format: TimeFormat) -> String {
    match format {
        TimeFormat::Iso8601 => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        TimeFormat::UnixTimestamp => t.timestamp().to_string(),
        TimeFormat::Rfc822 => t.to_rfc2822(),
    }
}

/// Encodes a leaf value as a string for the uri, querystring, header, or
/// form-body contexts.
pub fn leaf_to_string(
    service: &Service,
    shape_ref: &ShapeRef,
    value: &Value,
    ctx: LeafContext,
) -> Result<String, Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "string" => match value {
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        },
        "integer" | "long" | "double" | "float" => match value {
            Value::Number(n) => Ok(n.to_string()),
            other => Err(Anomaly::incorrect(format!("expected number, got {other}"))),
        },
        "boolean" => match value {
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(Anomaly::incorrect(format!("expected boolean, got {other}"))),
        },
        "timestamp" => {
            let format = TimeFormat::resolve(shape.timestamp_format.as_deref(), ctx);
            Ok(format_instant(to_instant(value)?, format))
        }
        "blob" => match value {
            // Raw in header/uri/query locations, base64 in body contexts.
            Value::String(s) if matches!(ctx, LeafContext::Query | LeafContext::Header) => {
                Ok(s.clone())
            }
            Value::String(s) => Ok(BASE64.encode(s.as_bytes())),
            other => Err(Anomaly::incorrect(format!("expected blob, got {other}"))),
        },
        // A null shape carries no data; its textual form is empty.
        "null" => match value {
            Value::Null => Ok(String::new()),
            other => Err(Anomaly::incorrect(format!("expected null, got {other}"))),
        },
        kind => Err(Anomaly::incorrect(format!(
            "shape {:?} ({kind}) is not a leaf",
            shape_ref.shape
        ))),
    }
}

/// Encodes a value against its shape into the JSON body representation.
pub fn json_encode(
    service: &Service,
    shape_ref: &ShapeRef,
    value: &Value,
) -> Result<Value, Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "structure" => {
            let obj = as_object(value)?;
            let mut out = Map::new();
            for (name, member) in &shape.members {
                if let Some(v) = obj.get(name) {
                    let key = member.location_name.clone().unwrap_or_else(|| name.clone());
                    out.insert(key, json_encode(service, member, v)?);
                }
            }
            Ok(Value::Object(out))
        }
        "list" => {
            let member = list_member(shape, shape_ref)?;
            let items = as_array(value)?;
            let encoded = items
                .iter()
                .map(|v| json_encode(service, member, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(encoded))
        }
        "map" => {
            let val_ref = map_value(shape, shape_ref)?;
            let obj = as_object(value)?;
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), json_encode(service, val_ref, v)?);
            }
            Ok(Value::Object(out))
        }
        "timestamp" => {
            let format = TimeFormat::resolve(shape.timestamp_format.as_deref(), LeafContext::JsonBody);
            let t = to_instant(value)?;
            Ok(match format {
                TimeFormat::UnixTimestamp => json!(t.timestamp()),
                other => Value::String(format_instant(t, other)),
            })
        }
        "blob" => match value {
            Value::String(s) => Ok(Value::String(BASE64.encode(s.as_bytes()))),
            other => Err(Anomaly::incorrect(format!("expected blob, got {other}"))),
        },
        "null" => Ok(Value::Null),
        _ => Ok(value.clone()),
    }
}

/// Decodes a wire JSON value back into the user representation.
pub fn json_decode(
    service: &Service,
    shape_ref: &ShapeRef,
    value: &Value,
) -> Result<Value, Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "structure" => {
            if value.is_null() {
                return Ok(Value::Object(Map::new()));
            }
            let obj = as_object(value)?;
            let mut out = Map::new();
            for (name, member) in &shape.members {
                let key = member.location_name.as_deref().unwrap_or(name);
                if let Some(v) = obj.get(key).or_else(|| obj.get(name)) {
                    if !v.is_null() {
                        out.insert(name.clone(), json_decode(service, member, v)?);
                    }
                }
            }
            Ok(Value::Object(out))
        }
        "list" => {
            if value.is_null() {
                return Ok(Value::Array(Vec::new()));
            }
            let member = list_member(shape, shape_ref)?;
            let items = as_array(value)?;
            let decoded = items
                .iter()
                .map(|v| json_decode(service, member, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(decoded))
        }
        "map" => {
            if value.is_null() {
                return Ok(Value::Object(Map::new()));
            }
            let val_ref = map_value(shape, shape_ref)?;
            let obj = as_object(value)?;
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), json_decode(service, val_ref, v)?);
            }
            Ok(Value::Object(out))
        }
        "timestamp" => Ok(json!(to_instant(value)?.timestamp())),
        "blob" => match value {
            Value::String(s) => {
                let bytes = BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| Anomaly::incorrect(format!("bad base64 blob: {e}")))?;
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
            other => Err(Anomaly::incorrect(format!("expected blob, got {other}"))),
        },
        "null" => Ok(Value::Null),
        _ => Ok(value.clone()),
    }
}

/// Validates a request value against its declared shape. Returns one problem
/// string per mismatch; empty means valid.
pub fn validate(service: &Service, shape_ref: &ShapeRef, value: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    validate_at(service, shape_ref, value, "$", &mut problems);
    problems
}

fn validate_at(
    service: &Service,
    shape_ref: &ShapeRef,
    value: &Value,
    path: &str,
    problems: &mut Vec<String>,
) {
    let Some(shape) = service.shape(&shape_ref.shape) else {
        problems.push(format!("{path}: unknown shape {:?}", shape_ref.shape));
        return;
    };
    match shape.kind.as_str() {
        "structure" => {
            let Some(obj) = value.as_object() else {
                problems.push(format!("{path}: expected a map"));
                return;
            };
            for required in &shape.required {
                if !obj.contains_key(required) {
                    problems.push(format!("{path}.{required}: missing required member"));
                }
            }
            let known: HashSet<&str> = shape.members.keys().map(String::as_str).collect();
            for key in obj.keys() {
                if !known.contains(key.as_str()) {
                    problems.push(format!("{path}.{key}: unexpected member"));
                }
            }
            for (name, member) in &shape.members {
                if let Some(v) = obj.get(name) {
                    validate_at(service, member, v, &format!("{path}.{name}"), problems);
                }
            }
        }
        "list" => {
            let Some(items) = value.as_array() else {
                problems.push(format!("{path}: expected a list"));
                return;
            };
            if let Some(member) = &shape.member {
                for (i, v) in items.iter().enumerate() {
                    validate_at(service, member, v, &format!("{path}[{i}]"), problems);
                }
            }
        }
        "map" => {
            let Some(obj) = value.as_object() else {
                problems.push(format!("{path}: expected a map"));
                return;
            };
            if let Some(val_ref) = &shape.value {
                for (k, v) in obj {
                    validate_at(service, val_ref, v, &format!("{path}.{k}"), problems);
                }
            }
        }
        "string" => {
            let Some(s) = value.as_str() else {
                problems.push(format!("{path}: expected a string"));
                return;
            };
            if let Some(allowed) = &shape.enum_values {
                if !allowed.iter().any(|a| a == s) {
                    problems.push(format!("{path}: {s:?} not in enum {allowed:?}"));
                }
            }
            if let Some(pattern) = &shape.pattern {
                match regex::Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => {
                        problems.push(format!("{path}: {s:?} does not match {pattern:?}"));
                    }
                    _ => {}
                }
            }
        }
        "integer" | "long" | "double" | "float" => {
            if !value.is_number() {
                problems.push(format!("{path}: expected a number"));
            }
        }
        "boolean" => {
            if !value.is_boolean() {
                problems.push(format!("{path}: expected a boolean"));
            }
        }
        "timestamp" => {
            if to_instant(value).is_err() {
                problems.push(format!("{path}: expected a timestamp"));
            }
        }
        "blob" => {
            if !value.is_string() {
                problems.push(format!("{path}: expected blob bytes"));
            }
        }
        "null" => {
            if !value.is_null() {
                problems.push(format!("{path}: expected null"));
            }
        }
        _ => {}
    }
}

pub(crate) fn as_object(value: &Value) -> Result<&Map<String, Value>, Anomaly> {
    value
        .as_object()
        .ok_or_else(|| Anomaly::incorrect(format!("expected a map, got {value}")))
}

pub(crate) fn as_array(value: &Value) -> Result<&Vec<Value>, Anomaly> {
    value
        .as_array()
        .ok_or_else(|| Anomaly::incorrect(format!("expected a list, got {value}")))
}

pub(crate) fn list_member<'a>(
    shape: &'a Shape,
    shape_ref: &ShapeRef,
) -> Result<&'a ShapeRef, Anomaly> {
    shape.member.as_deref().ok_or_else(|| {
        Anomaly::incorrect(format!("list shape {:?} lacks a member", shape_ref.shape))
    })
}

pub(crate) fn map_value<'a>(
    shape: &'a Shape,
    shape_ref: &ShapeRef,
) -> Result<&'a ShapeRef, Anomaly> {
    shape.value.as_deref().ok_or_else(|| {
        Anomaly::incorrect(format!("map shape {:?} lacks a value", shape_ref.shape))
    })
}
