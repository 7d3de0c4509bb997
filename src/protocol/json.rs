//! The AWS JSON-RPC protocol family (json versions 1.0 / 1.1).
//!
//! Every operation is a POST to `/` with the target operation named in
//! `x-amz-target`; request and response bodies are JSON documents encoded
//! against the input/output shapes.

use serde_json::{Map, Value, json};

use crate::anomaly::{Anomaly, MAX_BODY_CHARS, categorize, truncate_str};
use crate::http::{HttpRequest, HttpResponse};
use crate::service::Service;
use crate::shape;

use super::{Protocol, base_headers, operation};

#[derive(Debug)]
pub struct JsonProtocol;

impl Protocol for JsonProtocol {
    fn build_http_request(
        &self,
        service: &Service,
        op_name: &str,
        request: &Value,
    ) -> Result<HttpRequest, Anomaly> {
        let op = operation(service, op_name)?;
        let mut http_request = HttpRequest::new("POST", "/");
        http_request.headers = base_headers(service, op_name);

        http_request.body = match &op.input {
            Some(input_ref) => {
                let value = if request.is_null() {
                    Value::Object(Map::new())
                } else {
                    request.clone()
                };
                let encoded = shape::json_encode(service, input_ref, &value)?;
                serde_json::to_vec(&encoded).map_err(Anomaly::fault_from)?
            }
            None => b"{}".to_vec(),
        };
        Ok(http_request)
    }

    fn parse_response(
        &self,
        service: &Service,
        op_name: &str,
        response: &HttpResponse,
    ) -> Result<Value, Anomaly> {
        let op = operation(service, op_name)?;
        let Some(output_ref) = &op.output else {
            return Ok(json!({}));
        };
        let text = response.body_text();
        // An empty body against a declared output shape is an empty
        // structure, not an anomaly.
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        let wire: Value = serde_json::from_str(&text)
            .map_err(|e| Anomaly::incorrect(format!("bad JSON response: {e}")))?;
        shape::json_decode(service, output_ref, &wire)
    }

    fn parse_error(&self, _service: &Service, _op_name: &str, response: &HttpResponse) -> Anomaly {
        parse_json_error(response)
    }
}

/// Decodes the JSON error envelope shared by the json and rest-json
/// families: code from `__type` / `code` / the `x-amzn-errortype` header,
/// message from `message`.
pub(crate) fn parse_json_error(response: &HttpResponse) -> Anomaly {
    let text = response.body_text();
    let body: Option<Value> = serde_json::from_str(&text).ok();

    let header_code = response
        .headers
        .get("x-amzn-errortype")
        .map(|raw| raw.split([':', ';']).next().unwrap_or(raw).to_string());
    let body_code = body.as_ref().and_then(|b| {
        b.get("__type")
            .or_else(|| b.get("code"))
            .or_else(|| b.get("Code"))
            .and_then(Value::as_str)
            .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
    });
    let code = header_code.or(body_code);

    let message = body
        .as_ref()
        .and_then(|b| {
            b.get("message")
                .or_else(|| b.get("Message"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "HTTP {} with body: {}",
                response.status,
                truncate_str(&text, MAX_BODY_CHARS)
            )
        });

    let mut anomaly = Anomaly::of(categorize(response.status, code.as_deref()), message)
        .with_status(response.status);
    if let Some(code) = code {
        anomaly = anomaly.with_code(code);
    }
    anomaly
}
