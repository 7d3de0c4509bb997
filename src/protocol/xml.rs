//! Shape-directed XML reading and writing for the rest-xml, query, and ec2
//! families.
//!
//! Responses are first parsed into a small element tree, then converted
//! against the output shape; requests are written directly with `quick_xml`.

use std::io::{self, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesText, Event};
use serde_json::{Map, Value, json};

use crate::anomaly::Anomaly;
use crate::http::strip_bom;
use crate::service::{Service, ShapeRef};
use crate::shape::{self, LeafContext};

/// One parsed XML element: name (namespace-stripped), accumulated text, and
/// child elements in document order.
#[derive(Debug, Clone, Default)]
pub(crate) struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(name: String) -> Self {
        Self {
            name,
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        self.children.iter().filter(|c| c.name == name).collect()
    }
}

/// Parses an XML document into its root element. A leading UTF-8 BOM is
/// stripped before decoding.
pub(crate) fn parse(bytes: &[u8]) -> Result<XmlNode, Anomaly> {
    let text = String::from_utf8_lossy(strip_bom(bytes)).into_owned();
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                stack.push(XmlNode::new(name));
            }
            Ok(Event::Empty(empty)) => {
                let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                attach(XmlNode::new(name), &mut stack, &mut root);
            }
            Ok(Event::Text(text)) => {
                if let Some(top) = stack.last_mut() {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| Anomaly::incorrect(format!("bad XML text: {e}")))?;
                    top.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&cdata));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Anomaly::incorrect("unbalanced XML"))?;
                attach(node, &mut stack, &mut root);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Anomaly::incorrect(format!("bad XML: {e}"))),
        }
    }

    root.ok_or_else(|| Anomaly::incorrect("empty XML document"))
}

fn attach(node: XmlNode, stack: &mut Vec<XmlNode>, root: &mut Option<XmlNode>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

/// Converts an element tree into a value against the given shape.
pub(crate) fn node_to_value(
    service: &Service,
    shape_ref: &ShapeRef,
    node: &XmlNode,
) -> Result<Value, Anomaly> {
    let shape = service.resolve(shape_ref)?;
    match shape.kind.as_str() {
        "structure" => {
            let mut out = Map::new();
            for (name, member) in &shape.members {
                let key = member.location_name.as_deref().unwrap_or(name);
                let member_shape = service.resolve(member)?;
                let flattened_list =
                    member_shape.kind == "list" && (member.flattened || member_shape.flattened);
                if flattened_list {
                    let element = shape::list_member(member_shape, member)?;
                    let matches = node.children_named(key);
                    if !matches.is_empty() {
                        let items = matches
                            .iter()
                            .map(|child| node_to_value(service, element, child))
                            .collect::<Result<Vec<_>, _>>()?;
                        out.insert(name.clone(), Value::Array(items));
                    }
                } else if let Some(child) = node.child(key) {
                    out.insert(name.clone(), node_to_value(service, member, child)?);
                }
            }
            Ok(Value::Object(out))
        }
        "list" => {
            let element = shape::list_member(shape, shape_ref)?;
            let element_name = element.location_name.as_deref().unwrap_or("member");
            let items = node
                .children_named(element_name)
                .iter()
                .map(|child| node_to_value(service, element, child))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(items))
        }
        "map" => {
            let key_ref = shape
                .key
                .as_deref()
                .ok_or_else(|| Anomaly::incorrect("map shape lacks a key"))?;
            let value_ref = shape::map_value(shape, shape_ref)?;
            let key_name = key_ref.location_name.as_deref().unwrap_or("key");
            let value_name = value_ref.location_name.as_deref().unwrap_or("value");
            let entries: Vec<&XmlNode> = match node.children_named("entry") {
                entries if !entries.is_empty() => entries,
                _ => vec![node],
            };
            let mut out = Map::new();
            for entry in entries {
                let (Some(k), Some(v)) = (entry.child(key_name), entry.child(value_name)) else {
                    continue;
                };
                out.insert(k.text.clone(), node_to_value(service, value_ref, v)?);
            }
            Ok(Value::Object(out))
        }
        "string" => Ok(Value::String(node.text.clone())),
        "integer" | "long" => node
            .text
            .parse::<i64>()
            .map(|n| json!(n))
            .map_err(|_| Anomaly::incorrect(format!("bad integer {:?}", node.text))),
        "double" | "float" => node
            .text
            .parse::<f64>()
            .map(|n| json!(n))
            .map_err(|_| Anomaly::incorrect(format!("bad number {:?}", node.text))),
        "boolean" => Ok(Value::Bool(node.text == "true")),
        "timestamp" => Ok(json!(
            shape::to_instant(&Value::String(node.text.clone()))?.timestamp()
        )),
        "blob" => {
            let bytes = BASE64
                .decode(node.text.as_bytes())
                .map_err(|e| Anomaly::incorrect(format!("bad base64 blob: {e}")))?;
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        kind => Err(Anomaly::incorrect(format!("cannot decode XML as {kind}"))),
    }
}

/// Writes a value as an XML document rooted at `root`.
pub(crate) fn encode(
    service: &Service,
    shape_ref: &ShapeRef,
    root: &str,
    value: &Value,
) -> Result<Vec<u8>, Anomaly> {
    let mut buf = Vec::with_capacity(256);
    let mut writer = Writer::new(&mut buf);
    write_value(&mut writer, service, shape_ref, root, value)
        .map_err(|e| Anomaly::incorrect(format!("XML encode: {e}")))?;
    Ok(buf)
}

fn write_value<W: Write>(
    writer: &mut Writer<W>,
    service: &Service,
    shape_ref: &ShapeRef,
    name: &str,
    value: &Value,
) -> io::Result<()> {
    let shape = service
        .shape(&shape_ref.shape)
        .ok_or_else(|| io::Error::other(format!("unknown shape {:?}", shape_ref.shape)))?;
    match shape.kind.as_str() {
        "structure" => {
            let obj = value
                .as_object()
                .ok_or_else(|| io::Error::other("expected a map"))?;
            writer.create_element(name).write_inner_content(|w| {
                for (member_name, member) in &shape.members {
                    if let Some(v) = obj.get(member_name) {
                        let key = member.location_name.as_deref().unwrap_or(member_name);
                        write_value(w, service, member, key, v)?;
                    }
                }
                Ok(())
            })?;
            Ok(())
        }
        "list" => {
            let element = shape
                .member
                .as_deref()
                .ok_or_else(|| io::Error::other("list shape lacks a member"))?;
            let items = value
                .as_array()
                .ok_or_else(|| io::Error::other("expected a list"))?;
            if shape.flattened || shape_ref.flattened {
                for item in items {
                    write_value(writer, service, element, name, item)?;
                }
                Ok(())
            } else {
                let element_name = element.location_name.as_deref().unwrap_or("member");
                writer.create_element(name).write_inner_content(|w| {
                    for item in items {
                        write_value(w, service, element, element_name, item)?;
                    }
                    Ok(())
                })?;
                Ok(())
            }
        }
        "map" => {
            let value_ref = shape
                .value
                .as_deref()
                .ok_or_else(|| io::Error::other("map shape lacks a value"))?;
            let obj = value
                .as_object()
                .ok_or_else(|| io::Error::other("expected a map"))?;
            writer.create_element(name).write_inner_content(|w| {
                for (k, v) in obj {
                    w.create_element("entry").write_inner_content(|entry| {
                        entry
                            .create_element("key")
                            .write_text_content(BytesText::new(k))?;
                        write_value(entry, service, value_ref, "value", v)?;
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            Ok(())
        }
        _ => {
            let text = shape::leaf_to_string(service, shape_ref, value, LeafContext::XmlBody)
                .map_err(|e| io::Error::other(e.to_string()))?;
            writer
                .create_element(name)
                .write_text_content(BytesText::new(&text))?;
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct XmlErrorFields {
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

/// Extracts error fields from the XML error envelopes in the wild:
/// `<ErrorResponse><Error>…`, a bare `<Error>` root (S3), and
/// `<Response><Errors><Error>…` (EC2).
pub(crate) fn parse_error_fields(bytes: &[u8]) -> Option<XmlErrorFields> {
    let root = parse(bytes).ok()?;
    let error = if root.name == "Error" {
        root.clone()
    } else if let Some(error) = root.child("Error") {
        error.clone()
    } else if let Some(error) = root.child("Errors").and_then(|errors| errors.child("Error")) {
        error.clone()
    } else {
        return None;
    };

    let request_id = root
        .child("RequestId")
        .or_else(|| root.child("RequestID"))
        .or_else(|| error.child("RequestId"))
        .map(|n| n.text.clone());

    Some(XmlErrorFields {
        code: error.child("Code").map(|n| n.text.clone()),
        message: error.child("Message").map(|n| n.text.clone()),
        request_id,
    })
}
