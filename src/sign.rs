//! AWS Signature Version 4 request signing, including the S3 variant.
//!
//! The flavours differ in two places: standard v4 percent-encodes the
//! (already-encoded) URI a second time and only signs a payload hash header
//! that is already present, while `s3v4` takes the URI as-is and always
//! carries `x-amz-content-sha256` (or the literal `UNSIGNED-PAYLOAD`).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::anomaly::Anomaly;
use crate::credentials::Credentials;
use crate::http::HttpRequest;
use crate::service::Service;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Sentinel payload hash for S3 requests whose body is not signed.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// RFC 3986 unreserved characters survive; everything else is encoded.
const STRICT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Same set, but `/` is preserved (URI path contexts).
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encodes per the AWS rules. `encode_slash` is off only in URI path
/// contexts; query strings always encode `/`.
pub(crate) fn uri_encode(s: &str, encode_slash: bool) -> String {
    let set = if encode_slash { STRICT_ENCODE_SET } else { PATH_ENCODE_SET };
    utf8_percent_encode(s, set).to_string()
}

/// Signs `request` with the current time.
pub fn sign_request(
    service: &Service,
    region: &str,
    credentials: &Credentials,
    request: HttpRequest,
) -> Result<HttpRequest, Anomaly> {
    sign_request_at(service, region, credentials, request, Utc::now())
}

/// Signs `request` as of `now`. An existing `x-amz-date` header wins over
/// `now` so replayed requests sign deterministically.
pub fn sign_request_at(
    service: &Service,
    region: &str,
    credentials: &Credentials,
    mut request: HttpRequest,
    now: DateTime<Utc>,
) -> Result<HttpRequest, Anomaly> {
    let s3_style = is_s3_style(service);

    request
        .headers
        .insert_if_absent("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string());
    let amz_date = request
        .headers
        .get("x-amz-date")
        .map(str::to_owned)
        .unwrap_or_default();
    if amz_date.len() < 8 {
        return Err(Anomaly::incorrect(format!("bad x-amz-date {amz_date:?}")));
    }
    let date = amz_date[..8].to_string();

    if let Some(token) = &credentials.session_token {
        request
            .headers
            .insert_if_absent("x-amz-security-token", token.clone());
    }

    // Payload hash: the pre-set header wins (carries the UNSIGNED-PAYLOAD
    // sentinel for S3 unsigned bodies), else SHA-256 of the body.
    let payload_hash = match request.headers.get("x-amz-content-sha256") {
        Some(preset) => preset.to_string(),
        None => hex::encode(Sha256::digest(&request.body)),
    };
    if s3_style {
        request
            .headers
            .insert_if_absent("x-amz-content-sha256", payload_hash.clone());
    }

    let canonical_uri = canonical_uri(request.path(), s3_style);
    let canonical_query = canonical_query_string(request.query());
    let signable = signable_headers(&request);
    let canonical_headers = signable
        .iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let signed_headers = signable
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n\n{}\n{}",
        request.method.to_uppercase(),
        canonical_uri,
        canonical_query,
        canonical_headers,
        signed_headers,
        payload_hash,
    );
    trace!(canonical_request, "built canonical request");

    let signing_name = service.signing_name();
    let scope = format!("{date}/{region}/{signing_name}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes())),
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, signing_name)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    request.headers.insert(
        "authorization",
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    );
    Ok(request)
}

fn is_s3_style(service: &Service) -> bool {
    matches!(
        service.metadata.signature_version.as_deref(),
        Some("s3") | Some("s3v4")
    )
}

/// Canonical URI. The request path arrives percent-encoded once from the
/// builder; standard v4 encodes it a second time, s3v4 takes it as-is.
pub(crate) fn canonical_uri(path: &str, s3_style: bool) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if s3_style {
        path.to_string()
    } else {
        uri_encode(path, false)
    }
}

/// Canonical query string: decode, sort by key then value, re-encode with
/// the slash exception off. Bare keys emit `key=`. Idempotent.
pub(crate) fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|param| {
            let (k, v) = param.split_once('=').unwrap_or((param, ""));
            (decode(k), decode(v))
        })
        .collect();
    params.sort();
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// The headers included in the signature: `host`, `x-amz-date`, and every
/// `x-amz-*` header except `x-amz-client-context`. Values are trimmed with
/// internal whitespace collapsed; the result is sorted by name.
fn signable_headers(request: &HttpRequest) -> Vec<(String, String)> {
    let mut picked: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| {
            *name == "host" || (name.starts_with("x-amz-") && *name != "x-amz-client-context")
        })
        .map(|(name, value)| (name.to_string(), collapse_whitespace(value.trim())))
        .collect();
    picked.sort();
    picked
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
            }
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out
}

/// Derives the signing key: a four-step HMAC chain over date, region,
/// service, and the `aws4_request` terminator.
pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service_name: &str,
) -> Result<Vec<u8>, Anomaly> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service_name.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Anomaly> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Anomaly::incorrect(format!("HMAC key error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
