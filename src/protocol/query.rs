//! The query and ec2 protocol families: classic POST form encoding with XML
//! responses.
//!
//! Members flatten to dotted form fields (`Filter.member.1.Name`); the ec2
//! variant always flattens lists, numbers them directly, and capitalizes
//! member names from `queryName` / `locationName`.

use serde_json::{Value, json};

use crate::anomaly::Anomaly;
use crate::http::{HttpRequest, HttpResponse};
use crate::service::{Service, ShapeRef};
use crate::shape::{self, LeafContext};
use crate::sign::uri_encode;

use super::rest_xml::parse_xml_error;
use super::xml;
use super::{Protocol, base_headers, operation};

#[derive(Debug)]
pub struct QueryProtocol {
    ec2: bool,
}

impl QueryProtocol {
    pub fn query() -> Self {
        Self { ec2: false }
    }

    pub fn ec2() -> Self {
        Self { ec2: true }
    }
}

impl Protocol for QueryProtocol {
    fn build_http_request(
        &self,
        service: &Service,
        op_name: &str,
        request: &Value,
    ) -> Result<HttpRequest, Anomaly> {
        let op = operation(service, op_name)?;
        let mut params: Vec<(String, String)> = vec![
            ("Action".to_string(), op_name.to_string()),
            ("Version".to_string(), service.metadata.api_version.clone()),
        ];
        if let Some(input_ref) = &op.input {
            if !request.is_null() {
                flatten_params(service, input_ref, request, "", &mut params, self.ec2)?;
            }
        }

        let mut http_request = HttpRequest::new("POST", "/");
        http_request.headers = base_headers(service, op_name);
        http_request.body = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
            .collect::<Vec<_>>()
            .join("&")
            .into_bytes();
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
        if response.body.is_empty() {
            return Ok(json!({}));
        }
        let root = xml::parse(&response.body)?;
        // The payload sits inside the result wrapper when one is declared
        // (`<OpNameResponse><OpNameResult>…`).
        let node = output_ref
            .result_wrapper
            .as_deref()
            .and_then(|wrapper| root.child(wrapper))
            .unwrap_or(&root);
        xml::node_to_value(service, output_ref, node)
    }

    fn parse_error(&self, _service: &Service, _op_name: &str, response: &HttpResponse) -> Anomaly {
        parse_xml_error(response)
    }
}

/// Flattens a value into dotted form fields.
fn flatten_params(
    service: &Service,
    shape_ref: &ShapeRef,
    value: &Value,
    prefix: &str,
    out: &mut Vec<(String, String)>,
    ec2: bool,
) -> Result<(), Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "structure" => {
            let obj = shape::as_object(value)?;
            for (name, member) in &shape.members {
                let Some(v) = obj.get(name) else { continue };
                let key = member_field_name(name, member, ec2);
                let child_prefix = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_params(service, member, v, &child_prefix, out, ec2)?;
            }
            Ok(())
        }
        "list" => {
            let element = shape::list_member(shape, shape_ref)?;
            let items = shape::as_array(value)?;
            let flattened = ec2 || shape.flattened || shape_ref.flattened;
            for (i, item) in items.iter().enumerate() {
                let base = if flattened {
                    format!("{prefix}.{}", i + 1)
                } else {
                    let element_name = element.location_name.as_deref().unwrap_or("member");
                    format!("{prefix}.{element_name}.{}", i + 1)
                };
                flatten_params(service, element, item, &base, out, ec2)?;
            }
            Ok(())
        }
        "map" => {
            let value_ref = shape::map_value(shape, shape_ref)?;
            let obj = shape::as_object(value)?;
            let flattened = shape.flattened || shape_ref.flattened;
            for (i, (k, v)) in obj.iter().enumerate() {
                let base = if flattened {
                    format!("{prefix}.{}", i + 1)
                } else {
                    format!("{prefix}.entry.{}", i + 1)
                };
                out.push((format!("{base}.key"), k.clone()));
                flatten_params(service, value_ref, v, &format!("{base}.value"), out, ec2)?;
            }
            Ok(())
        }
        _ => {
            out.push((
                prefix.to_string(),
                shape::leaf_to_string(service, shape_ref, value, LeafContext::XmlBody)?,
            ));
            Ok(())
        }
    }
}

fn member_field_name(name: &str, member: &ShapeRef, ec2: bool) -> String {
    if ec2 {
        member.query_name.clone().unwrap_or_else(|| {
            capitalize(member.location_name.as_deref().unwrap_or(name))
        })
    } else {
        member.location_name.clone().unwrap_or_else(|| name.to_string())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query_svc() -> Service {
        Service::from_json(
            r#"{
              "metadata": {"protocol": "query", "apiVersion": "2010-05-08", "endpointPrefix": "iam"},
              "operations": {
                "ListUsers": {
                  "input": {"shape": "ListUsersInput"},
                  "output": {"shape": "ListUsersOutput", "resultWrapper": "ListUsersResult"}
                },
                "TagUser": {"input": {"shape": "TagUserInput"}}
              },
              "shapes": {
                "ListUsersInput": {
                  "type": "structure",
                  "members": {
                    "PathPrefix": {"shape": "Str"},
                    "MaxItems": {"shape": "Int"}
                  }
                },
                "ListUsersOutput": {
                  "type": "structure",
                  "members": {
                    "Users": {"shape": "UserList"},
                    "IsTruncated": {"shape": "Bool"}
                  }
                },
                "TagUserInput": {
                  "type": "structure",
                  "members": {
                    "UserName": {"shape": "Str"},
                    "Tags": {"shape": "TagList"}
                  }
                },
                "TagList": {"type": "list", "member": {"shape": "Tag"}},
                "Tag": {
                  "type": "structure",
                  "members": {"Key": {"shape": "Str"}, "Value": {"shape": "Str"}}
                },
                "UserList": {"type": "list", "member": {"shape": "User"}},
                "User": {
                  "type": "structure",
                  "members": {"UserName": {"shape": "Str"}, "UserId": {"shape": "Str"}}
                },
                "Str": {"type": "string"},
                "Int": {"type": "integer"},
                "Bool": {"type": "boolean"}
              }
            }"#,
        )
        .unwrap()
    }

    fn ec2_svc() -> Service {
        Service::from_json(
            r#"{
              "metadata": {"protocol": "ec2", "apiVersion": "2016-11-15", "endpointPrefix": "ec2"},
              "operations": {
                "DescribeInstances": {"input": {"shape": "DescribeInstancesInput"}}
              },
              "shapes": {
                "DescribeInstancesInput": {
                  "type": "structure",
                  "members": {
                    "InstanceIds": {"shape": "IdList", "locationName": "instanceId"},
                    "DryRun": {"shape": "Bool", "locationName": "dryRun"}
                  }
                },
                "IdList": {"type": "list", "member": {"shape": "Str"}},
                "Str": {"type": "string"},
                "Bool": {"type": "boolean"}
              }
            }"#,
        )
        .unwrap()
    }

    fn body_text(req: &HttpRequest) -> String {
        String::from_utf8(req.body.clone()).unwrap()
    }

    #[test]
    fn action_and_version_always_present() {
        let svc = query_svc();
        let req = QueryProtocol::query()
            .build_http_request(&svc, "ListUsers", &json!({"PathPrefix": "/eng/", "MaxItems": 5}))
            .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/");
        let body = body_text(&req);
        assert!(body.starts_with("Action=ListUsers&Version=2010-05-08"));
        assert!(body.contains("PathPrefix=%2Feng%2F"));
        assert!(body.contains("MaxItems=5"));
    }

    #[test]
    fn nested_list_flattens_with_member_prefix() {
        let svc = query_svc();
        let req = QueryProtocol::query()
            .build_http_request(
                &svc,
                "TagUser",
                &json!({"UserName": "bob", "Tags": [{"Key": "team", "Value": "eng"}]}),
            )
            .unwrap();
        let body = body_text(&req);
        assert!(body.contains("UserName=bob"));
        assert!(body.contains("Tags.member.1.Key=team"));
        assert!(body.contains("Tags.member.1.Value=eng"));
    }

    #[test]
    fn ec2_lists_number_directly_and_capitalize() {
        let svc = ec2_svc();
        let req = QueryProtocol::ec2()
            .build_http_request(
                &svc,
                "DescribeInstances",
                &json!({"InstanceIds": ["i-1", "i-2"], "DryRun": true}),
            )
            .unwrap();
        let body = body_text(&req);
        assert!(body.contains("InstanceId.1=i-1"));
        assert!(body.contains("InstanceId.2=i-2"));
        assert!(body.contains("DryRun=true"));
        assert!(!body.contains("member"));
    }

    #[test]
    fn response_unwraps_result_wrapper() {
        let svc = query_svc();
        let mut response = HttpResponse::new(200);
        response.body = br#"<ListUsersResponse>
              <ListUsersResult>
                <Users>
                  <member><UserName>bob</UserName><UserId>u-1</UserId></member>
                </Users>
                <IsTruncated>false</IsTruncated>
              </ListUsersResult>
              <ResponseMetadata><RequestId>req</RequestId></ResponseMetadata>
            </ListUsersResponse>"#
            .to_vec();
        let value = QueryProtocol::query()
            .parse_response(&svc, "ListUsers", &response)
            .unwrap();
        assert_eq!(
            value,
            json!({
                "Users": [{"UserName": "bob", "UserId": "u-1"}],
                "IsTruncated": false
            })
        );
    }
}
