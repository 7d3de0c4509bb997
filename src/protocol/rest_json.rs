//! The rest-json protocol family: operation-declared methods and paths, JSON
//! bodies, members routed by location.

use serde_json::{Map, Value};

use crate::anomaly::Anomaly;
use crate::http::{HttpRequest, HttpResponse};
use crate::service::Service;
use crate::shape;

use super::rest::{apply_output_bindings, route_input};
use super::{Protocol, base_headers, json::parse_json_error, operation};

#[derive(Debug)]
pub struct RestJsonProtocol;

impl Protocol for RestJsonProtocol {
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
                    _ => serde_json::to_vec(&shape::json_encode(service, member, value)?)
                        .map_err(Anomaly::fault_from)?,
                };
            }
        } else if !routed.body.is_empty() {
            let body_value = Value::Object(routed.body);
            http_request.body =
                serde_json::to_vec(&shape::json_encode(service, input_ref, &body_value)?)
                    .map_err(Anomaly::fault_from)?;
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
                    let text = response.body_text();
                    if !text.trim().is_empty() {
                        let wire: Value = serde_json::from_str(&text)
                            .map_err(|e| Anomaly::incorrect(format!("bad JSON response: {e}")))?;
                        out.insert(
                            payload_name.clone(),
                            shape::json_decode(service, member, &wire)?,
                        );
                    }
                }
            }
        } else {
            let text = response.body_text();
            if !text.trim().is_empty() {
                let wire: Value = serde_json::from_str(&text)
                    .map_err(|e| Anomaly::incorrect(format!("bad JSON response: {e}")))?;
                if let Value::Object(decoded) =
                    shape::json_decode(service, output_ref, &wire)?
                {
                    out = decoded;
                }
            }
        }

        apply_output_bindings(service, output_ref, response, &mut out)?;
        Ok(Value::Object(out))
    }

    fn parse_error(&self, _service: &Service, _op_name: &str, response: &HttpResponse) -> Anomaly {
        parse_json_error(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;
    use serde_json::json;

    fn svc() -> Service {
        Service::from_json(
            r#"{
              "metadata": {"protocol": "rest-json", "apiVersion": "2017-10-17", "endpointPrefix": "w"},
              "operations": {
                "PutWidget": {
                  "http": {"method": "PUT", "requestUri": "/widgets/{Id}"},
                  "input": {"shape": "PutWidgetInput"},
                  "output": {"shape": "PutWidgetOutput"}
                },
                "GetBlob": {
                  "http": {"method": "GET", "requestUri": "/blobs/{Id}"},
                  "input": {"shape": "GetBlobInput"},
                  "output": {"shape": "GetBlobOutput"}
                }
              },
              "shapes": {
                "PutWidgetInput": {
                  "type": "structure",
                  "required": ["Id"],
                  "members": {
                    "Id": {"shape": "Str", "location": "uri", "locationName": "Id"},
                    "Color": {"shape": "Str"},
                    "Size": {"shape": "Int"}
                  }
                },
                "PutWidgetOutput": {
                  "type": "structure",
                  "members": {
                    "Version": {"shape": "Str", "location": "header", "locationName": "x-w-version"},
                    "Color": {"shape": "Str"}
                  }
                },
                "GetBlobInput": {
                  "type": "structure",
                  "required": ["Id"],
                  "members": {"Id": {"shape": "Str", "location": "uri", "locationName": "Id"}}
                },
                "GetBlobOutput": {
                  "type": "structure",
                  "payload": "Data",
                  "members": {"Data": {"shape": "Blob"}}
                },
                "Str": {"type": "string"},
                "Int": {"type": "integer"},
                "Blob": {"type": "blob"}
              }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn build_routes_uri_and_body() {
        let svc = svc();
        let req = RestJsonProtocol
            .build_http_request(&svc, "PutWidget", &json!({"Id": "w1", "Color": "red", "Size": 3}))
            .unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.uri, "/widgets/w1");
        assert_eq!(
            serde_json::from_slice::<Value>(&req.body).unwrap(),
            json!({"Color": "red", "Size": 3})
        );
    }

    #[test]
    fn missing_required_uri_member_fails() {
        let svc = svc();
        let err = RestJsonProtocol
            .build_http_request(&svc, "PutWidget", &json!({"Color": "red"}))
            .unwrap_err();
        assert_eq!(err.category, crate::anomaly::Category::Incorrect);
        assert!(err.message.as_deref().unwrap().contains("missing"));
    }

    #[test]
    fn parse_merges_body_and_header_bindings() {
        let svc = svc();
        let mut response = HttpResponse::new(200);
        response.headers = Headers::from([("x-w-version", "7")]);
        response.body = br#"{"Color": "red"}"#.to_vec();
        let value = RestJsonProtocol
            .parse_response(&svc, "PutWidget", &response)
            .unwrap();
        assert_eq!(value, json!({"Color": "red", "Version": "7"}));
    }

    #[test]
    fn blob_payload_output_is_raw_body() {
        let svc = svc();
        let mut response = HttpResponse::new(200);
        response.body = b"raw-bytes-not-json".to_vec();
        let value = RestJsonProtocol
            .parse_response(&svc, "GetBlob", &response)
            .unwrap();
        assert_eq!(value, json!({"Data": "raw-bytes-not-json"}));
    }

    #[test]
    fn empty_body_with_output_shape_is_empty_structure() {
        let svc = svc();
        let response = HttpResponse::new(200);
        let value = RestJsonProtocol
            .parse_response(&svc, "PutWidget", &response)
            .unwrap();
        assert_eq!(value, json!({}));
    }
}
