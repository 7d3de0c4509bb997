//! Service descriptor model and loader.
//!
//! A descriptor is the machine-readable definition of one AWS service:
//! protocol family, signing metadata, the operation registry, and the shape
//! table. Descriptors are immutable after load and safe to share; content
//! matches the AWS SDK model files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::anomaly::{Anomaly, Category};

/// Environment variable naming the descriptor resource root.
pub const DESCRIPTOR_PATH_VAR: &str = "AWS_API_DESCRIPTOR_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub metadata: Metadata,
    #[serde(default)]
    pub operations: BTreeMap<String, Operation>,
    #[serde(default)]
    pub shapes: HashMap<String, Shape>,
    #[serde(default)]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Wire protocol family: `json`, `query`, `rest-json`, `rest-xml`, `ec2`.
    pub protocol: String,
    pub api_version: String,
    pub endpoint_prefix: String,
    #[serde(default)]
    pub signature_version: Option<String>,
    #[serde(default)]
    pub signing_name: Option<String>,
    #[serde(default)]
    pub target_prefix: Option<String>,
    #[serde(default)]
    pub json_version: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub service_full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub http: Option<HttpBinding>,
    #[serde(default)]
    pub input: Option<ShapeRef>,
    #[serde(default)]
    pub output: Option<ShapeRef>,
    #[serde(default)]
    pub errors: Vec<ShapeRef>,
    #[serde(default)]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBinding {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_uri")]
    pub request_uri: String,
    #[serde(default)]
    pub response_code: Option<u16>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_uri() -> String {
    "/".to_string()
}

/// A reference to a named shape, as used for operation inputs/outputs and
/// structure members. Carries the member-level binding attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeRef {
    pub shape: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub result_wrapper: Option<String>,
    #[serde(default)]
    pub flattened: bool,
    #[serde(default)]
    pub query_name: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
}

impl ShapeRef {
    pub fn named(shape: impl Into<String>) -> Self {
        Self {
            shape: shape.into(),
            location: None,
            location_name: None,
            result_wrapper: None,
            flattened: false,
            query_name: None,
            documentation: None,
        }
    }
}

/// A tagged shape definition. `kind` holds the type tag from the model file
/// (`structure`, `list`, `map`, `string`, `integer`, `long`, `double`,
/// `float`, `boolean`, `timestamp`, `blob`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub members: BTreeMap<String, ShapeRef>,
    /// List element shape.
    #[serde(default)]
    pub member: Option<Box<ShapeRef>>,
    /// Map key/value shapes.
    #[serde(default)]
    pub key: Option<Box<ShapeRef>>,
    #[serde(default)]
    pub value: Option<Box<ShapeRef>>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub flattened: bool,
    /// Name of the member that is the HTTP payload, when declared.
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub timestamp_format: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
}

impl Service {
    /// Parses a descriptor from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, Anomaly> {
        serde_json::from_str(text)
            .map_err(|e| Anomaly::of(Category::Incorrect, format!("bad service descriptor: {e}")))
    }

    /// Loads the descriptor for `api` from the resource root: an explicit
    /// directory, or the one named by `AWS_API_DESCRIPTOR_PATH`.
    pub fn load(api: &str, root: Option<&Path>) -> Result<Self, Anomaly> {
        let root = match root {
            Some(p) => p.to_path_buf(),
            None => std::env::var(DESCRIPTOR_PATH_VAR)
                .map(PathBuf::from)
                .map_err(|_| {
                    Anomaly::incorrect(format!(
                        "no descriptor root: set {DESCRIPTOR_PATH_VAR} or supply a path"
                    ))
                })?,
        };
        let path = root.join(format!("{api}.json"));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Anomaly::incorrect(format!("cannot read descriptor {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    pub fn shape(&self, name: &str) -> Option<&Shape> {
        self.shapes.get(name)
    }

    /// Resolves a shape ref, or fails with `fault` when the descriptor is
    /// internally inconsistent.
    pub fn resolve(&self, shape_ref: &ShapeRef) -> Result<&Shape, Anomaly> {
        self.shape(&shape_ref.shape).ok_or_else(|| {
            Anomaly::of(
                Category::Fault,
                format!("descriptor references unknown shape {:?}", shape_ref.shape),
            )
        })
    }

    /// The name used in the credential scope: `signingName` when present,
    /// else the endpoint prefix.
    pub fn signing_name(&self) -> &str {
        self.metadata
            .signing_name
            .as_deref()
            .unwrap_or(&self.metadata.endpoint_prefix)
    }

    /// Per-operation documentation records for the reflection surface.
    pub fn ops(&self) -> BTreeMap<String, OpDoc> {
        self.operations
            .iter()
            .map(|(name, op)| {
                (
                    name.clone(),
                    OpDoc {
                        name: name.clone(),
                        documentation: op.documentation.clone(),
                        request_shape: op.input.as_ref().map(|r| r.shape.clone()),
                        response_shape: op.output.as_ref().map(|r| r.shape.clone()),
                        errors: op.errors.iter().map(|r| r.shape.clone()).collect(),
                    },
                )
            })
            .collect()
    }

    /// Renders a printable documentation string for one operation.
    pub fn doc(&self, op_name: &str) -> Option<String> {
        let op = self.operation(op_name)?;
        let mut out = String::new();
        out.push_str("-------------------------\n");
        out.push_str(op_name);
        out.push('\n');
        if let Some(doc) = &op.documentation {
            out.push('\n');
            out.push_str(&strip_html(doc));
            out.push('\n');
        }
        if let Some(input) = &op.input {
            out.push_str("\nRequest: ");
            out.push_str(&input.shape);
            if let Some(shape) = self.shape(&input.shape) {
                render_members(&mut out, shape);
            }
            out.push('\n');
        }
        if let Some(output) = &op.output {
            out.push_str("\nResponse: ");
            out.push_str(&output.shape);
            if let Some(shape) = self.shape(&output.shape) {
                render_members(&mut out, shape);
            }
            out.push('\n');
        }
        Some(out)
    }
}

/// Summary record describing one operation.
#[derive(Debug, Clone)]
pub struct OpDoc {
    pub name: String,
    pub documentation: Option<String>,
    pub request_shape: Option<String>,
    pub response_shape: Option<String>,
    pub errors: Vec<String>,
}

fn render_members(out: &mut String, shape: &Shape) {
    if shape.members.is_empty() {
        return;
    }
    out.push_str(" {");
    for (name, member) in &shape.members {
        out.push_str("\n  ");
        out.push_str(name);
        out.push_str(": ");
        out.push_str(&member.shape);
        if shape.required.iter().any(|r| r == name) {
            out.push_str(" (required)");
        }
    }
    out.push_str("\n}");
}

/// Strips HTML tags from descriptor documentation strings.
fn strip_html(doc: &str) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut in_tag = false;
    for ch in doc.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}
