//! Wire protocol dispatch.
//!
//! Each protocol family translates between shape-typed values and HTTP
//! bytes. Implementations are selected from a static registry keyed by
//! `metadata.protocol` at client construction; an unknown protocol fails
//! fast.

use std::sync::Arc;

use serde_json::Value;

use crate::anomaly::Anomaly;
use crate::http::{Headers, HttpRequest, HttpResponse};
use crate::service::{Operation, Service};

pub mod json;
pub mod query;
pub(crate) mod rest;
pub mod rest_json;
pub mod rest_xml;
pub(crate) mod xml;

/// One wire encoding: builds requests from values and parses responses back.
pub trait Protocol: Send + Sync + std::fmt::Debug {
    fn build_http_request(
        &self,
        service: &Service,
        op_name: &str,
        request: &Value,
    ) -> Result<HttpRequest, Anomaly>;

    /// Decodes a success response (`status < 400`).
    fn parse_response(
        &self,
        service: &Service,
        op_name: &str,
        response: &HttpResponse,
    ) -> Result<Value, Anomaly>;

    /// Decodes an error response into an anomaly.
    fn parse_error(&self, service: &Service, op_name: &str, response: &HttpResponse) -> Anomaly;
}

/// Resolves the protocol implementation for a descriptor's protocol name.
pub fn for_name(name: &str) -> Result<Arc<dyn Protocol>, Anomaly> {
    match name {
        "json" => Ok(Arc::new(json::JsonProtocol)),
        "rest-json" => Ok(Arc::new(rest_json::RestJsonProtocol)),
        "rest-xml" => Ok(Arc::new(rest_xml::RestXmlProtocol)),
        "query" => Ok(Arc::new(query::QueryProtocol::query())),
        "ec2" => Ok(Arc::new(query::QueryProtocol::ec2())),
        other => Err(Anomaly::incorrect(format!("unknown protocol {other:?}"))),
    }
}

/// Base headers common to a protocol family: content type, `x-amz-target`
/// for the JSON RPC family, and the API version.
pub(crate) fn base_headers(service: &Service, op_name: &str) -> Headers {
    let meta = &service.metadata;
    let mut headers = Headers::new();
    match meta.protocol.as_str() {
        "json" => {
            let version = meta.json_version.as_deref().unwrap_or("1.0");
            headers.insert("content-type", format!("application/x-amz-json-{version}"));
            if let Some(prefix) = &meta.target_prefix {
                headers.insert("x-amz-target", format!("{prefix}.{op_name}"));
            }
        }
        "query" | "ec2" => {
            headers.insert("content-type", "application/x-www-form-urlencoded");
            headers.insert("x-amz-api-version", meta.api_version.clone());
        }
        "rest-json" => headers.insert("content-type", "application/json"),
        "rest-xml" => headers.insert("content-type", "application/xml"),
        _ => {}
    }
    headers
}

pub(crate) fn operation<'a>(service: &'a Service, op_name: &str) -> Result<&'a Operation, Anomaly> {
    service
        .operation(op_name)
        .ok_or_else(Anomaly::unsupported_operation)
}
