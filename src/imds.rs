//! EC2 Instance Metadata Service client (IMDSv2).
//!
//! Token-first: every metadata read fetches a session token with a PUT and
//! presents it on the GET. The client is blocking by design; provider
//! fetches run on the blocking pool.

use std::env;
use std::time::Duration;

use crate::anomaly::{Anomaly, Category};

const DEFAULT_BASE: &str = "http://169.254.169.254";
const TOKEN_TTL_SECONDS: &str = "21600";

pub struct ImdsClient {
    base: String,
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ImdsClient {
    pub fn new() -> Self {
        Self {
            base: DEFAULT_BASE.to_string(),
        }
    }

    /// Points the client at a non-default endpoint (tests).
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn http() -> Result<reqwest::blocking::Client, Anomaly> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(1))
            .build()
            .map_err(Anomaly::fault_from)
    }

    fn token(&self) -> Result<String, Anomaly> {
        let http = Self::http()?;
        let response = http
            .put(format!("{}/latest/api/token", self.base))
            .header("x-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .map_err(|e| Anomaly::of(Category::Unavailable, format!("IMDS token: {e}")))?;
        if !response.status().is_success() {
            return Err(Anomaly::of(
                Category::Unavailable,
                format!("IMDS token returned {}", response.status()),
            ));
        }
        response.text().map_err(Anomaly::fault_from)
    }

    /// Reads one metadata path, e.g. `/latest/meta-data/placement/region`.
    pub fn get(&self, path: &str) -> Result<String, Anomaly> {
        if disabled() {
            return Err(Anomaly::of(
                Category::Unavailable,
                "EC2 metadata disabled by AWS_EC2_METADATA_DISABLED",
            ));
        }
        let token = self.token()?;
        let http = Self::http()?;
        let response = http
            .get(format!("{}{}", self.base, path))
            .header("x-aws-ec2-metadata-token", token)
            .send()
            .map_err(|e| Anomaly::of(Category::Unavailable, format!("IMDS: {e}")))?;
        if !response.status().is_success() {
            return Err(Anomaly::of(
                Category::Unavailable,
                format!("IMDS {path} returned {}", response.status()),
            ));
        }
        response.text().map_err(Anomaly::fault_from)
    }

    pub fn region(&self) -> Result<String, Anomaly> {
        let region = self.get("/latest/meta-data/placement/region")?;
        let region = region.trim();
        if region.is_empty() {
            return Err(Anomaly::of(Category::NotFound, "IMDS returned empty region"));
        }
        Ok(region.to_string())
    }
}

/// True when `AWS_EC2_METADATA_DISABLED` is set truthy.
pub(crate) fn disabled() -> bool {
    matches!(
        env::var("AWS_EC2_METADATA_DISABLED").as_deref(),
        Ok("true") | Ok("TRUE") | Ok("True") | Ok("1")
    )
}
