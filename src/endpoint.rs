//! Endpoint resolution from the bundled partitions document.
//!
//! Per-service hostname templates keyed by region, with partition-level
//! fallbacks: an unknown service/region pair resolves through the partition's
//! generic template. Overrides replace any of protocol, hostname, port, path.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::anomaly::Anomaly;
use crate::service::Service;

const PARTITIONS_JSON: &str = include_str!("data/endpoints.json");

/// A resolved endpoint for one service in one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub signature_versions: Vec<String>,
    pub credential_scope: Option<CredentialScope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialScope {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

/// Structured endpoint override; any present field replaces the resolved
/// value. The deprecated string form is not supported.
#[derive(Debug, Clone, Default)]
pub struct EndpointOverride {
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

/// Computes the endpoint for a service in a region.
pub trait EndpointProvider: Send + Sync {
    fn fetch(&self, service: &Service, region: &str) -> Result<Endpoint, Anomaly>;
}

#[derive(Debug, Deserialize)]
struct PartitionsDoc {
    partitions: Vec<Partition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Partition {
    partition: String,
    dns_suffix: String,
    #[serde(default)]
    region_regex: Option<String>,
    defaults: EndpointEntry,
    #[serde(default)]
    regions: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    services: BTreeMap<String, PartitionService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionService {
    #[serde(default)]
    defaults: Option<EndpointEntry>,
    #[serde(default)]
    endpoints: BTreeMap<String, EndpointEntry>,
    #[serde(default)]
    partition_endpoint: Option<String>,
    #[serde(default)]
    is_regionalized: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointEntry {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    protocols: Option<Vec<String>>,
    #[serde(default)]
    signature_versions: Option<Vec<String>>,
    #[serde(default)]
    credential_scope: Option<CredentialScope>,
}

impl EndpointEntry {
    fn merge_from(&mut self, other: &EndpointEntry) {
        if other.hostname.is_some() {
            self.hostname = other.hostname.clone();
        }
        if other.protocols.is_some() {
            self.protocols = other.protocols.clone();
        }
        if other.signature_versions.is_some() {
            self.signature_versions = other.signature_versions.clone();
        }
        if other.credential_scope.is_some() {
            self.credential_scope = other.credential_scope.clone();
        }
    }
}

/// The default provider: bundled partitions document plus an optional
/// override.
pub struct DefaultEndpointProvider {
    doc: PartitionsDoc,
    endpoint_override: Option<EndpointOverride>,
}

impl DefaultEndpointProvider {
    pub fn new() -> Result<Self, Anomaly> {
        let doc: PartitionsDoc =
            serde_json::from_str(PARTITIONS_JSON).map_err(Anomaly::fault_from)?;
        Ok(Self {
            doc,
            endpoint_override: None,
        })
    }

    pub fn with_override(mut self, endpoint_override: EndpointOverride) -> Self {
        self.endpoint_override = Some(endpoint_override);
        self
    }

    fn partition_for(&self, region: &str) -> &Partition {
        self.doc
            .partitions
            .iter()
            .find(|p| {
                p.regions.contains_key(region)
                    || p.region_regex
                        .as_deref()
                        .and_then(|re| regex::Regex::new(re).ok())
                        .is_some_and(|re| re.is_match(region))
            })
            .unwrap_or(&self.doc.partitions[0])
    }
}

impl EndpointProvider for DefaultEndpointProvider {
    fn fetch(&self, service: &Service, region: &str) -> Result<Endpoint, Anomaly> {
        let prefix = &service.metadata.endpoint_prefix;
        let partition = self.partition_for(region);

        let mut merged = partition.defaults.clone();
        let mut endpoint_region = region.to_string();

        if let Some(partition_service) = partition.services.get(prefix) {
            if let Some(defaults) = &partition_service.defaults {
                merged.merge_from(defaults);
            }
            // Non-regionalized services route every region to the partition
            // endpoint.
            if partition_service.is_regionalized == Some(false) {
                if let Some(global) = &partition_service.partition_endpoint {
                    endpoint_region = global.clone();
                }
            }
            if let Some(entry) = partition_service.endpoints.get(&endpoint_region) {
                merged.merge_from(entry);
            }
        }

        let template = merged
            .hostname
            .as_deref()
            .unwrap_or("{service}.{region}.{dnsSuffix}");
        let hostname = template
            .replace("{service}", prefix)
            .replace("{region}", &endpoint_region)
            .replace("{dnsSuffix}", &partition.dns_suffix);

        let protocol = merged
            .protocols
            .as_ref()
            .and_then(|p| p.first().cloned())
            .unwrap_or_else(|| "https".to_string());
        // Prefer https when the entry lists both.
        let protocol = if merged
            .protocols
            .as_ref()
            .is_some_and(|p| p.iter().any(|x| x == "https"))
        {
            "https".to_string()
        } else {
            protocol
        };

        let mut endpoint = Endpoint {
            protocol,
            hostname,
            port: None,
            path: None,
            signature_versions: merged
                .signature_versions
                .unwrap_or_else(|| vec!["v4".to_string()]),
            credential_scope: merged.credential_scope,
        };

        if let Some(o) = &self.endpoint_override {
            if let Some(protocol) = &o.protocol {
                endpoint.protocol = protocol.clone();
            }
            if let Some(hostname) = &o.hostname {
                endpoint.hostname = hostname.clone();
            }
            if o.port.is_some() {
                endpoint.port = o.port;
            }
            if let Some(path) = &o.path {
                endpoint.path = Some(path.clone());
            }
        }

        Ok(endpoint)
    }
}
