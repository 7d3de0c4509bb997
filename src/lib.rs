//! Data-driven AWS service client.
//!
//! One engine serves every AWS service: behaviour is a function of the
//! loaded service descriptor (operations, shapes, wire protocol family,
//! signing metadata), not hand-written per-service code. Given a descriptor,
//! [`Client::invoke`] packages a request into a signed HTTP call, submits
//! it, parses the response or error back into a structured value, and
//! transparently retries transient failures.
//!
//! # Quick start
//!
//! ```no_run
//! use rs_aws_api::{Client, Config, Credentials, OpRequest};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), rs_aws_api::Anomaly> {
//! let client = Client::new(
//!     Config::new("dynamodb")
//!         .with_region("us-east-1")
//!         .with_credentials(Credentials::new("akid", "secret")),
//! )?;
//!
//! let item = client
//!     .invoke(OpRequest::new(
//!         "GetItem",
//!         json!({"TableName": "widgets", "Key": {"Id": {"S": "w-1"}}}),
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every terminal outcome is a value: success carries the parsed response
//! and failure carries an [`Anomaly`] with a closed-set category tag.

pub mod anomaly;
pub mod client;
pub mod credentials;
pub mod endpoint;
mod engine;
pub mod http;
pub mod imds;
pub mod profile;
pub mod protocol;
pub mod region;
pub mod retry;
pub mod service;
pub mod shape;
pub mod sign;
pub mod test_double;

pub use anomaly::{Anomaly, Category, Outcome};
pub use client::{Client, Config, Interceptor, OpRequest};
pub use credentials::{Credentials, CredentialsProvider};
pub use endpoint::{Endpoint, EndpointOverride, EndpointProvider};
pub use http::{HttpRequest, HttpResponse, HttpTransport};
pub use region::RegionProvider;
pub use retry::{Backoff, Retriable};
pub use service::Service;

// Compile-time assertions: key types must be Send + Sync for use across
// threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Client>;
    let _ = assert_send_sync::<Anomaly>;
    let _ = assert_send_sync::<Credentials>;
    let _ = assert_send_sync::<Service>;
};
