//! Shared member routing for the REST protocol families.
//!
//! Input structure members are routed by their declared `location`: URI
//! template substitution, query-string parameters, single headers, prefix
//! header maps, and the payload/body remainder.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::anomaly::Anomaly;
use crate::http::{Headers, HttpResponse};
use crate::service::{Service, ShapeRef};
use crate::shape::{self, LeafContext};
use crate::sign::uri_encode;

/// Input members split by destination.
pub(crate) struct RoutedInput {
    pub uri: String,
    pub headers: Headers,
    /// Members with no location: the body remainder.
    pub body: Map<String, Value>,
    /// Name of the declared payload member, when any.
    pub payload: Option<String>,
}

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z0-9_]+)(\+)?\}").expect("invalid placeholder pattern")
    })
}

/// Substitutes `{Name}` / `{Name+}` placeholders into a path template.
///
/// `{Name+}` preserves slashes in the value; `{Name}` percent-encodes them.
/// A leading slash in a substituted value is absorbed when the template
/// already ends with one, so the result never contains `//`.
pub(crate) fn serialize_uri(
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, Anomaly> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(template) {
        let whole = caps.get(0).expect("match always has a full group");
        out.push_str(&template[last..whole.start()]);
        let name = &caps[1];
        let greedy = caps.get(2).is_some();
        let value = params
            .get(name)
            .ok_or_else(|| Anomaly::incorrect(format!("missing URI member {name:?}")))?;
        let value = if out.ends_with('/') {
            value.strip_prefix('/').unwrap_or(value)
        } else {
            value
        };
        out.push_str(&uri_encode(value, !greedy));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Routes the request's members per the input shape, producing the request
/// path (template substituted, query string assembled), headers, and body
/// remainder.
pub(crate) fn route_input(
    service: &Service,
    input_ref: &ShapeRef,
    request: &Value,
    template: &str,
) -> Result<RoutedInput, Anomaly> {
    let shape = service.resolve(input_ref)?;
    let empty = Map::new();
    let obj = if request.is_null() {
        &empty
    } else {
        shape::as_object(request)?
    };

    let (path_template, static_query) = match template.split_once('?') {
        Some((path, query)) => (path, query),
        None => (template, ""),
    };

    let mut uri_params = BTreeMap::new();
    let mut query: Vec<(String, String)> = static_query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|param| {
            let (k, v) = param.split_once('=').unwrap_or((param, ""));
            (k.to_string(), v.to_string())
        })
        .collect();
    let mut headers = Headers::new();
    let mut body = Map::new();

    for (name, member) in &shape.members {
        let Some(value) = obj.get(name) else { continue };
        let key = member.location_name.clone().unwrap_or_else(|| name.clone());
        match member.location.as_deref() {
            Some("uri") => {
                uri_params.insert(
                    key,
                    shape::leaf_to_string(service, member, value, LeafContext::Query)?,
                );
            }
            Some("querystring") => {
                let member_shape = service.resolve(member)?;
                match member_shape.kind.as_str() {
                    "list" => {
                        let element = shape::list_member(member_shape, member)?;
                        for item in shape::as_array(value)? {
                            query.push((
                                key.clone(),
                                shape::leaf_to_string(service, element, item, LeafContext::Query)?,
                            ));
                        }
                    }
                    "map" => {
                        let value_ref = shape::map_value(member_shape, member)?;
                        for (k, v) in shape::as_object(value)? {
                            query.push((
                                k.clone(),
                                shape::leaf_to_string(service, value_ref, v, LeafContext::Query)?,
                            ));
                        }
                    }
                    _ => query.push((
                        key,
                        shape::leaf_to_string(service, member, value, LeafContext::Query)?,
                    )),
                }
            }
            Some("header") => {
                headers.insert(
                    key,
                    shape::leaf_to_string(service, member, value, LeafContext::Header)?,
                );
            }
            Some("headers") => {
                let prefix = member.location_name.as_deref().unwrap_or("");
                let member_shape = service.resolve(member)?;
                let value_ref = shape::map_value(member_shape, member)?;
                for (k, v) in shape::as_object(value)? {
                    headers.insert(
                        format!("{prefix}{k}"),
                        shape::leaf_to_string(service, value_ref, v, LeafContext::Header)?,
                    );
                }
            }
            Some("statusCode") => {}
            _ => {
                body.insert(name.clone(), value.clone());
            }
        }
    }

    // The payload member is delivered whole by the caller, not as part of
    // the body remainder.
    if let Some(payload) = &shape.payload {
        body.remove(payload);
    }

    let path = serialize_uri(path_template, &uri_params)?;
    Ok(RoutedInput {
        uri: assemble_uri(&path, &query),
        headers,
        body,
        payload: shape.payload.clone(),
    })
}

/// Appends the query pairs to the path, URL-encoding keys and values.
pub(crate) fn assemble_uri(path: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let encoded = query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{encoded}")
}

/// Decodes a leaf wire string back to its value representation.
pub(crate) fn leaf_from_string(
    service: &Service,
    shape_ref: &ShapeRef,
    text: &str,
) -> Result<Value, Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "string" | "blob" => Ok(Value::String(text.to_string())),
        "integer" | "long" => text
            .parse::<i64>()
            .map(|n| json!(n))
            .map_err(|_| Anomaly::incorrect(format!("bad integer {text:?}"))),
        "double" | "float" => text
            .parse::<f64>()
            .map(|n| json!(n))
            .map_err(|_| Anomaly::incorrect(format!("bad number {text:?}"))),
        "boolean" => Ok(Value::Bool(text == "true")),
        "timestamp" => Ok(json!(
            shape::to_instant(&Value::String(text.to_string()))?.timestamp()
        )),
        kind => Err(Anomaly::incorrect(format!("{kind} is not a leaf"))),
    }
}

/// Fills output members bound to headers and the status code.
pub(crate) fn apply_output_bindings(
    service: &Service,
    output_ref: &ShapeRef,
    response: &HttpResponse,
    out: &mut Map<String, Value>,
) -> Result<(), Anomaly> {
    let shape = service.resolve(output_ref)?;
    for (name, member) in &shape.members {
        match member.location.as_deref() {
            Some("header") => {
                let key = member.location_name.as_deref().unwrap_or(name);
                if let Some(value) = response.headers.get(key) {
                    out.insert(name.clone(), leaf_from_string(service, member, value)?);
                }
            }
            Some("headers") => {
                let prefix = member.location_name.as_deref().unwrap_or("").to_lowercase();
                let mut collected = Map::new();
                for (header_name, header_value) in response.headers.iter() {
                    if let Some(suffix) = header_name.strip_prefix(&prefix) {
                        if !prefix.is_empty() {
                            collected
                                .insert(suffix.to_string(), Value::String(header_value.into()));
                        }
                    }
                }
                if !collected.is_empty() {
                    out.insert(name.clone(), Value::Object(collected));
                }
            }
            Some("statusCode") => {
                out.insert(name.clone(), json!(response.status));
            }
            _ => {}
        }
    }
    Ok(())
}
