//! The rest-xml protocol family (S3, Route 53, CloudFront): REST member
//! routing with XML bodies.

use serde_json::{Map, Value};

use crate::anomaly::{Anomaly, MAX_BODY_CHARS, categorize, truncate_str};
use crate::http::{HttpRequest, HttpResponse};
use crate::service::Service;

use super::rest::{apply_output_bindings, route_input};
use super::xml;
use super::{Protocol, base_headers, operation};

#[derive(Debug)]
pub struct RestXmlProtocol;

impl Protocol for RestXmlProtocol {
    fn build_http_request(
        &self,
        service: &Service,
        op_name: &str,
        request: &Value,
    ) -> Result<HttpRequest, Anomaly> {
        let op = operation(service, op_name)?;
        let method = op.http.as_ref().map(|h| h.method.as_str()).unwrap_or("POST");
        let template = op
            .http
            .as_ref()
            .map(|h| h.request_uri.as_str())
            .unwrap_or("/");

        let mut http_request = HttpRequest::new(method, template);
        http_request.headers = base_headers(service, op_name);

        let Some(input_ref) = &op.input else {
            return Ok(http_request);
        };

        let routed = route_input(service, input_ref, request, template)?;
        http_request.uri = routed.uri;
        for (name, value) in routed.headers.iter() {
            http_request.headers.insert(name, value);
        }

        if let Some(payload_name) = &routed.payload {
            let input_shape = service.resolve(input_ref)?;
            let member = input_shape.members.get(payload_name).ok_or_else(|| {
                Anomaly::incorrect(format!("payload names unknown member {payload_name:?}"))
            })?;
            if let Some(value) = request.get(payload_name) {
                let member_shape = service.resolve(member)?;
                http_request.body = match member_shape.kind.as_str() {
                    "blob" | "string" => value
                        .as_str()
                        .map(|s| s.as_bytes().to_vec())
                        .ok_or_else(|| Anomaly::incorrect("payload must be a string"))?,
                    _ => {
                        let root = member.location_name.as_deref().unwrap_or(payload_name);
                        xml::encode(service, member, root, value)?
                    }
                };
            }
        } else if !routed.body.is_empty() {
            let input_shape = service.resolve(input_ref)?;
            let root = input_ref
                .location_name
                .as_deref()
                .or(input_shape.location_name.as_deref())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{op_name}Request"));
            http_request.body = xml::encode(
                service,
                input_ref,
                &root,
                &Value::Object(routed.body),
            )?;
        }
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
            return Ok(Value::Object(Map::new()));
        };
        let output_shape = service.resolve(output_ref)?;

        let mut out = Map::new();
        if let Some(payload_name) = &output_shape.payload {
            let member = output_shape.members.get(payload_name).ok_or_else(|| {
                Anomaly::incorrect(format!("payload names unknown member {payload_name:?}"))
            })?;
            let member_shape = service.resolve(member)?;
            match member_shape.kind.as_str() {
                "blob" | "string" => {
                    out.insert(payload_name.clone(), Value::String(response.body_text()));
                }
                _ => {
                    if !response.body.is_empty() {
                        let root = xml::parse(&response.body)?;
                        out.insert(
                            payload_name.clone(),
                            xml::node_to_value(service, member, &root)?,
                        );
                    }
                }
            }
        } else if !response.body.is_empty() {
            let root = xml::parse(&response.body)?;
            if let Value::Object(decoded) = xml::node_to_value(service, output_ref, &root)? {
                out = decoded;
            }
        }

        apply_output_bindings(service, output_ref, response, &mut out)?;
        Ok(Value::Object(out))
    }

    fn parse_error(&self, _service: &Service, _op_name: &str, response: &HttpResponse) -> Anomaly {
        parse_xml_error(response)
    }
}

/// Decodes the XML error envelopes shared by the rest-xml, query, and ec2
/// families.
pub(crate) fn parse_xml_error(response: &HttpResponse) -> Anomaly {
    let fields = xml::parse_error_fields(&response.body).unwrap_or_default();
    let message = fields.message.unwrap_or_else(|| {
        format!(
            "HTTP {} with body: {}",
            response.status,
            truncate_str(&response.body_text(), MAX_BODY_CHARS)
        )
    });
    let mut anomaly = Anomaly::of(
        categorize(response.status, fields.code.as_deref()),
        message,
    )
    .with_status(response.status);
    if let Some(code) = fields.code {
        anomaly = anomaly.with_code(code);
    }
    anomaly
}
