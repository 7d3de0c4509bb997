//! The invocation pipeline: one attempt from provider resolution to a parsed
//! result.
//!
//! Region and credential fetches run concurrently; the endpoint fetch
//! observes the region; signing observes endpoint and credentials;
//! submission observes signing. Every failure is an anomaly value.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::anomaly::{Anomaly, Outcome};
use crate::client::ClientInner;
use crate::credentials::{Credentials, CredentialsProvider};
use crate::endpoint::Endpoint;
use crate::http::HttpRequest;
use crate::region::RegionProvider;
use crate::sign;

pub(crate) async fn one_attempt(
    client: &Arc<ClientInner>,
    op_name: &str,
    request: &Value,
) -> Outcome {
    let (region, credentials) = tokio::join!(
        fetch_region(client.region_provider.clone()),
        fetch_credentials(client.credentials_provider.clone()),
    );
    let region = region?;
    let credentials = credentials?;

    let endpoint = client.endpoint_provider.fetch(&client.service, &region)?;

    let mut http_request =
        client
            .protocol
            .build_http_request(&client.service, op_name, request)?;
    apply_endpoint(&mut http_request, &endpoint);
    http_request
        .headers
        .insert_if_absent("amz-sdk-invocation-id", Uuid::new_v4().to_string());

    let http_request = match &client.interceptor {
        Some(interceptor) => interceptor(&client.service, op_name, request, http_request),
        None => http_request,
    };

    // A global endpoint pins the scope region (e.g. IAM signs as us-east-1).
    let signing_region = endpoint
        .credential_scope
        .as_ref()
        .and_then(|scope| scope.region.clone())
        .unwrap_or(region);
    let signed = sign::sign_request(&client.service, &signing_region, &credentials, http_request)?;

    debug!(op = op_name, url = %signed.url(), "submitting request");
    let response = client.transport.submit(signed).await?;
    debug!(op = op_name, status = response.status, "response received");

    if response.status < 400 {
        client
            .protocol
            .parse_response(&client.service, op_name, &response)
    } else {
        Err(client
            .protocol
            .parse_error(&client.service, op_name, &response))
    }
}

/// Provider fetches are synchronous by contract; run them on the blocking
/// pool. A join failure converts to `fault` like any other internal error.
async fn fetch_region(provider: Arc<dyn RegionProvider>) -> Result<String, Anomaly> {
    tokio::task::spawn_blocking(move || provider.fetch())
        .await
        .unwrap_or_else(|e| Err(Anomaly::fault_from(e)))
}

async fn fetch_credentials(
    provider: Arc<dyn CredentialsProvider>,
) -> Result<Credentials, Anomaly> {
    tokio::task::spawn_blocking(move || provider.fetch())
        .await
        .unwrap_or_else(|e| Err(Anomaly::fault_from(e)))
}

/// Overlays the resolved endpoint onto a built request: host header, scheme,
/// port, and path prefix.
pub(crate) fn apply_endpoint(request: &mut HttpRequest, endpoint: &Endpoint) {
    request.scheme = endpoint.protocol.clone();
    request.hostname = endpoint.hostname.clone();
    request.port = endpoint.port;
    let host = match endpoint.port {
        Some(port) => format!("{}:{port}", endpoint.hostname),
        None => endpoint.hostname.clone(),
    };
    request.headers.insert("host", host);
    if let Some(path) = &endpoint.path {
        request.uri = format!("{}{}", path.trim_end_matches('/'), request.uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            protocol: "http".into(),
            hostname: "localhost".into(),
            port: Some(4566),
            path: Some("/aws/".into()),
            signature_versions: vec!["v4".into()],
            credential_scope: None,
        }
    }

    #[test]
    fn endpoint_overlay_sets_host_scheme_port_path() {
        let mut request = HttpRequest::new("GET", "/widgets/w1");
        apply_endpoint(&mut request, &endpoint());
        assert_eq!(request.scheme, "http");
        assert_eq!(request.hostname, "localhost");
        assert_eq!(request.port, Some(4566));
        assert_eq!(request.headers.get("host"), Some("localhost:4566"));
        assert_eq!(request.uri, "/aws/widgets/w1");
    }

    #[test]
    fn endpoint_overlay_without_port_or_path() {
        let mut request = HttpRequest::new("GET", "/");
        let mut ep = endpoint();
        ep.port = None;
        ep.path = None;
        ep.protocol = "https".into();
        ep.hostname = "ec2.us-east-1.amazonaws.com".into();
        apply_endpoint(&mut request, &ep);
        assert_eq!(request.headers.get("host"), Some("ec2.us-east-1.amazonaws.com"));
        assert_eq!(request.uri, "/");
    }
}
