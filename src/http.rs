//! Engine-internal HTTP types and the pluggable transport.
//!
//! The transport contract is asynchronous submit plus stop. A process-wide
//! reqwest-backed transport is shared across client handles by default;
//! handles only release a transport they were explicitly given.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::anomaly::{Anomaly, Category};

/// Case-insensitive header map. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Inserts only if the header is not already present.
    pub fn insert_if_absent(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let key = name.as_ref().to_ascii_lowercase();
        self.0.entry(key).or_insert_with(|| value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>, V: Into<String>, const N: usize> From<[(S, V); N]> for Headers {
    fn from(pairs: [(S, V); N]) -> Self {
        let mut h = Headers::new();
        for (k, v) in pairs {
            let name: String = k.into();
            h.insert(name, v);
        }
        h
    }
}

/// An HTTP request as the engine sees it, before and after signing.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    /// Path plus optional `?query`, already percent-encoded.
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            scheme: "https".to_string(),
            hostname: String::new(),
            port: None,
            uri: uri.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// The path component of `uri`, without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// The query component of `uri`, empty when absent.
    pub fn query(&self) -> &str {
        match self.uri.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }

    pub fn url(&self) -> String {
        match self.port {
            Some(p) => format!("{}://{}:{}{}", self.scheme, self.hostname, p, self.uri),
            None => format!("{}://{}{}", self.scheme, self.hostname, self.uri),
        }
    }
}

/// An HTTP response as delivered by the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Body as UTF-8 text, with a leading BOM stripped.
    pub fn body_text(&self) -> String {
        let bytes = strip_bom(&self.body);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Strips a leading UTF-8 byte-order mark.
pub(crate) fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes)
}

/// Asynchronous HTTP transport contract.
///
/// Implementations must not block the cooperative threads; transport failures
/// come back as anomalies, never as panics.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn submit(&self, request: HttpRequest) -> Result<HttpResponse, Anomaly>;

    /// Releases transport resources. Idempotent; the shared transport treats
    /// this as a no-op.
    fn stop(&self) {}
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, Anomaly> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(Anomaly::fault_from)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn submit(&self, request: HttpRequest) -> Result<HttpResponse, Anomaly> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Anomaly::incorrect(format!("bad HTTP method {:?}", request.method)))?;

        let mut builder = self.http.request(method, request.url());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(anomaly_from_reqwest)?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str(), v);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(anomaly_from_reqwest)?
            .to_vec();

        debug!(status, body_len = body.len(), "transport exchange complete");
        Ok(HttpResponse { status, headers, body })
    }
}

/// Classifies a transport-level failure: timeouts are `interrupted`,
/// connection problems are `unavailable`, the rest is `fault`.
fn anomaly_from_reqwest(err: reqwest::Error) -> Anomaly {
    let category = if err.is_timeout() {
        Category::Interrupted
    } else if err.is_connect() || err.is_request() {
        Category::Unavailable
    } else {
        Category::Fault
    };
    let mut a = Anomaly::of(category, err.to_string());
    a.source = Some(Arc::new(err));
    a
}

static SHARED: OnceLock<Arc<ReqwestTransport>> = OnceLock::new();

/// The process-wide shared transport. Client handles that were not given an
/// explicit transport use this one and never stop it.
pub fn shared_transport() -> Arc<ReqwestTransport> {
    SHARED
        .get_or_init(|| {
            Arc::new(ReqwestTransport::new().expect("default reqwest client must build"))
        })
        .clone()
}
