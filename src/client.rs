//! Client handle: binds configuration to a loaded service descriptor and
//! exposes the invoke surface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::anomaly::{Anomaly, Category, Outcome};
use crate::credentials::{self, Credentials, CredentialsProvider, StaticCredentialsProvider};
use crate::endpoint::{DefaultEndpointProvider, Endpoint, EndpointOverride, EndpointProvider};
use crate::engine;
use crate::http::{HttpRequest, HttpTransport, shared_transport};
use crate::protocol::{self, Protocol};
use crate::region::{self, RegionProvider, StaticRegionProvider};
use crate::retry::{self, Backoff, Retriable};
use crate::service::{OpDoc, Service};
use crate::shape;

/// Per-service request adjustment hook, run after the endpoint overlay and
/// before signing (e.g. S3 virtual-host addressing).
pub type Interceptor = Arc<dyn Fn(&Service, &str, &Value, HttpRequest) -> HttpRequest + Send + Sync>;

/// Configuration for constructing a [`Client`].
///
/// Only `api` is required; everything else falls back to the process-wide
/// defaults (shared transport, shared provider chains, bundled endpoints).
pub struct Config {
    pub api: String,
    pub region: Option<String>,
    pub descriptor_path: Option<PathBuf>,
    pub region_provider: Option<Arc<dyn RegionProvider>>,
    pub credentials_provider: Option<Arc<dyn CredentialsProvider>>,
    pub endpoint_override: Option<EndpointOverride>,
    pub http_transport: Option<Arc<dyn HttpTransport>>,
    pub retriable: Option<Retriable>,
    pub backoff: Option<Backoff>,
    pub interceptor: Option<Interceptor>,
    pub validate_requests: bool,
}

impl Config {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            region: None,
            descriptor_path: None,
            region_provider: None,
            credentials_provider: None,
            endpoint_override: None,
            http_transport: None,
            retriable: None,
            backoff: None,
            interceptor: None,
            validate_requests: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_descriptor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_path = Some(path.into());
        self
    }

    pub fn with_region_provider(mut self, provider: Arc<dyn RegionProvider>) -> Self {
        self.region_provider = Some(provider);
        self
    }

    pub fn with_credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.with_credentials_provider(Arc::new(StaticCredentialsProvider::new(credentials)))
    }

    pub fn with_endpoint_override(mut self, endpoint_override: EndpointOverride) -> Self {
        self.endpoint_override = Some(endpoint_override);
        self
    }

    pub fn with_http_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http_transport = Some(transport);
        self
    }

    pub fn with_retriable(mut self, retriable: Retriable) -> Self {
        self.retriable = Some(retriable);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_validate_requests(mut self, enabled: bool) -> Self {
        self.validate_requests = enabled;
        self
    }
}

/// An operation request: the operation name, its input value, and optional
/// per-request retry behaviour.
pub struct OpRequest {
    pub op: String,
    pub request: Value,
    pub retriable: Option<Retriable>,
    pub backoff: Option<Backoff>,
}

impl OpRequest {
    pub fn new(op: impl Into<String>, request: Value) -> Self {
        Self {
            op: op.into(),
            request,
            retriable: None,
            backoff: None,
        }
    }

    pub fn with_retriable(mut self, retriable: Retriable) -> Self {
        self.retriable = Some(retriable);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

pub(crate) struct ClientInner {
    pub(crate) service: Service,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) transport: Arc<dyn HttpTransport>,
    /// True when the transport was supplied explicitly; only then does
    /// `stop` release it.
    owns_transport: bool,
    pub(crate) region_provider: Arc<dyn RegionProvider>,
    pub(crate) credentials_provider: Arc<dyn CredentialsProvider>,
    pub(crate) endpoint_provider: Arc<dyn EndpointProvider>,
    pub(crate) interceptor: Option<Interceptor>,
    retriable: Retriable,
    backoff: Backoff,
    validate: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to one service. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Loads the descriptor for `config.api` and builds a client.
    pub fn new(config: Config) -> Result<Self, Anomaly> {
        let service = Service::load(&config.api, config.descriptor_path.as_deref())?;
        Self::from_service(service, config)
    }

    /// Builds a client from an already-parsed descriptor. The protocol
    /// implementation is resolved eagerly so an unknown protocol fails here.
    pub fn from_service(service: Service, config: Config) -> Result<Self, Anomaly> {
        let protocol = protocol::for_name(&service.metadata.protocol)?;

        let (transport, owns_transport): (Arc<dyn HttpTransport>, bool) =
            match config.http_transport {
                Some(transport) => (transport, true),
                None => (shared_transport(), false),
            };

        let region_provider: Arc<dyn RegionProvider> = match (config.region_provider, config.region)
        {
            (Some(provider), _) => provider,
            (None, Some(region)) => Arc::new(StaticRegionProvider::new(region)),
            (None, None) => region::default_provider(),
        };

        let credentials_provider: Arc<dyn CredentialsProvider> = match config.credentials_provider
        {
            Some(provider) => provider,
            None => credentials::default_provider(),
        };

        let mut endpoint_provider = DefaultEndpointProvider::new()?;
        if let Some(endpoint_override) = config.endpoint_override {
            endpoint_provider = endpoint_provider.with_override(endpoint_override);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                service,
                protocol,
                transport,
                owns_transport,
                region_provider,
                credentials_provider,
                endpoint_provider: Arc::new(endpoint_provider),
                interceptor: config.interceptor,
                retriable: config.retriable.unwrap_or_else(retry::default_retriable),
                backoff: config.backoff.unwrap_or_else(retry::default_backoff),
                validate: AtomicBool::new(config.validate_requests),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Starts an invocation and returns its one-shot result channel.
    /// Dropping the receiver cancels outstanding retries.
    pub fn invoke_async(&self, op_request: OpRequest) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();

        let Some(op) = self.inner.service.operation(&op_request.op) else {
            let _ = tx.send(Err(Anomaly::unsupported_operation()));
            return rx;
        };

        // The flag is read once per invoke.
        if self.inner.validate.load(Ordering::Relaxed) {
            if let Some(input_ref) = &op.input {
                let problems = shape::validate(&self.inner.service, input_ref, &op_request.request);
                if !problems.is_empty() {
                    let _ = tx.send(Err(Anomaly::incorrect("Request validation failed")
                        .with_problems(problems)));
                    return rx;
                }
            }
        }

        let retriable = op_request
            .retriable
            .unwrap_or_else(|| self.inner.retriable.clone());
        let backoff = op_request
            .backoff
            .unwrap_or_else(|| self.inner.backoff.clone());
        let inner = self.inner.clone();
        let op_name = op_request.op;
        let request = op_request.request;

        tokio::spawn(async move {
            let attempt_inner = inner;
            retry::with_retry(
                move || {
                    let inner = attempt_inner.clone();
                    let op_name = op_name.clone();
                    let request = request.clone();
                    async move { engine::one_attempt(&inner, &op_name, &request).await }
                },
                tx,
                retriable,
                backoff,
            )
            .await;
        });
        rx
    }

    /// Invokes an operation and awaits its result. Never panics; every
    /// terminal outcome is a value.
    pub async fn invoke(&self, op_request: OpRequest) -> Outcome {
        match self.invoke_async(op_request).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Anomaly::of(Category::Interrupted, "result channel closed")),
        }
    }

    /// Toggles request validation for subsequent invokes.
    pub fn validate_requests(&self, enabled: bool) {
        self.inner.validate.store(enabled, Ordering::Relaxed);
    }

    /// Per-operation documentation records.
    pub fn ops(&self) -> BTreeMap<String, OpDoc> {
        self.inner.service.ops()
    }

    /// Rendered documentation for one operation.
    pub fn doc(&self, op: &str) -> Option<String> {
        self.inner.service.doc(op)
    }

    /// The schema key (shape name) validating an operation's request.
    pub fn request_shape(&self, op: &str) -> Option<String> {
        self.inner
            .service
            .operation(op)
            .and_then(|o| o.input.as_ref())
            .map(|r| r.shape.clone())
    }

    /// The schema key (shape name) describing an operation's response.
    pub fn response_shape(&self, op: &str) -> Option<String> {
        self.inner
            .service
            .operation(op)
            .and_then(|o| o.output.as_ref())
            .map(|r| r.shape.clone())
    }

    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// Debug shortcut: resolves the region this client would use. Blocking.
    pub fn region(&self) -> Result<String, Anomaly> {
        self.inner.region_provider.fetch()
    }

    /// Debug shortcut: resolves current credentials. Blocking.
    pub fn credentials(&self) -> Result<Credentials, Anomaly> {
        self.inner.credentials_provider.fetch()
    }

    /// Debug shortcut: resolves the endpoint for the current region.
    /// Blocking.
    pub fn endpoint(&self) -> Result<Endpoint, Anomaly> {
        let region = self.region()?;
        self.inner.endpoint_provider.fetch(&self.inner.service, &region)
    }

    /// Releases the transport if this handle owns one. Idempotent; a handle
    /// on the process-shared transport never stops it.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.owns_transport {
            self.inner.transport.stop();
        }
    }
}
