//! Credential resolution: layered providers with caching and expiry refresh.
//!
//! A provider exposes a synchronous `fetch`; the engine runs providers on the
//! blocking pool. Chain members that fail are skipped silently (traced at
//! debug level) and the first success wins.

use std::env;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::anomaly::{Anomaly, Category};
use crate::imds::ImdsClient;
use crate::profile;

/// How long before the stated expiration credentials count as expired.
pub(crate) fn expiry_window() -> Duration {
    Duration::minutes(5)
}

/// AWS access credentials.
///
/// The `Debug` implementation redacts `secret_access_key` and
/// `session_token` to prevent accidental leakage in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Absolute expiry instant; `None` means non-expiring.
    pub expiration: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expired when `now` is within the refresh window of the expiration.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => now >= expiration - expiry_window(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"****")
            .field("session_token", &self.session_token.as_ref().map(|_| "****"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Resolves [`Credentials`] from a specific source.
pub trait CredentialsProvider: Send + Sync {
    /// Attempt to resolve credentials from this provider.
    fn fetch(&self) -> Result<Credentials, Anomaly>;
}

/// Provides credentials from explicitly specified values.
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        Ok(self.credentials.clone())
    }
}

/// Provides credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
/// (plus `AWS_SESSION_TOKEN` when set).
pub struct EnvCredentialsProvider;

impl CredentialsProvider for EnvCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        let id = env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Anomaly::of(Category::NotFound, "AWS_ACCESS_KEY_ID not set"))?;
        let secret = env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Anomaly::of(Category::NotFound, "AWS_SECRET_ACCESS_KEY not set"))?;
        if id.is_empty() || secret.is_empty() {
            return Err(Anomaly::of(
                Category::NotFound,
                "AWS_ACCESS_KEY_ID or AWS_SECRET_ACCESS_KEY is empty",
            ));
        }
        let mut credentials = Credentials::new(id, secret);
        if let Ok(token) = env::var("AWS_SESSION_TOKEN") {
            if !token.is_empty() {
                credentials = credentials.with_session_token(token);
            }
        }
        Ok(credentials)
    }
}

/// Provides credentials from the shared config/credentials files, honoring
/// `AWS_PROFILE`, `AWS_CONFIG_FILE`, and `AWS_SHARED_CREDENTIALS_FILE`.
/// Profiles with a `credential_process` entry execute the process and parse
/// its JSON output.
pub struct ProfileCredentialsProvider {
    profile_name: Option<String>,
}

impl Default for ProfileCredentialsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileCredentialsProvider {
    pub fn new() -> Self {
        Self { profile_name: None }
    }

    pub fn with_profile(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }
}

impl CredentialsProvider for ProfileCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        let name = self
            .profile_name
            .clone()
            .unwrap_or_else(profile::selected_profile);
        let values = profile::profile_values(&name)?;

        if let Some(command) = values.get("credential_process") {
            return run_credential_process(command);
        }

        let id = values
            .get("aws_access_key_id")
            .ok_or_else(|| Anomaly::of(Category::NotFound, "profile has no aws_access_key_id"))?;
        let secret = values.get("aws_secret_access_key").ok_or_else(|| {
            Anomaly::of(Category::NotFound, "profile has no aws_secret_access_key")
        })?;
        let mut credentials = Credentials::new(id.clone(), secret.clone());
        if let Some(token) = values.get("aws_session_token") {
            credentials = credentials.with_session_token(token.clone());
        }
        Ok(credentials)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

fn run_credential_process(command: &str) -> Result<Credentials, Anomaly> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(Anomaly::fault_from)?;
    if !output.status.success() {
        return Err(Anomaly::of(
            Category::Fault,
            format!("credential_process exited with {}", output.status),
        ));
    }
    parse_process_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_process_output(text: &str) -> Result<Credentials, Anomaly> {
    let parsed: ProcessCredentials = serde_json::from_str(text)
        .map_err(|e| Anomaly::of(Category::Fault, format!("bad credential_process output: {e}")))?;
    let mut credentials = Credentials::new(parsed.access_key_id, parsed.secret_access_key);
    if let Some(token) = parsed.session_token {
        credentials = credentials.with_session_token(token);
    }
    if let Some(expiration) = parsed.expiration {
        let instant = DateTime::parse_from_rfc3339(&expiration)
            .map_err(|e| Anomaly::of(Category::Fault, format!("bad expiration: {e}")))?;
        credentials = credentials.with_expiration(instant.with_timezone(&Utc));
    }
    Ok(credentials)
}

/// JSON document served by both the ECS credentials endpoint and the IMDS
/// role-credentials path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

pub(crate) fn parse_container_credentials(text: &str) -> Result<Credentials, Anomaly> {
    let parsed: ContainerCredentials = serde_json::from_str(text)
        .map_err(|e| Anomaly::of(Category::Fault, format!("bad credentials document: {e}")))?;
    let mut credentials = Credentials::new(parsed.access_key_id, parsed.secret_access_key);
    if let Some(token) = parsed.token {
        credentials = credentials.with_session_token(token);
    }
    if let Some(expiration) = parsed.expiration {
        if let Ok(instant) = DateTime::parse_from_rfc3339(&expiration) {
            credentials = credentials.with_expiration(instant.with_timezone(&Utc));
        }
    }
    Ok(credentials)
}

/// Provides credentials from the ECS container endpoint, via
/// `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or
/// `AWS_CONTAINER_CREDENTIALS_FULL_URI`.
pub struct EcsCredentialsProvider;

const ECS_CREDENTIALS_HOST: &str = "http://169.254.170.2";

impl EcsCredentialsProvider {
    fn credentials_uri() -> Result<String, Anomaly> {
        if let Ok(relative) = env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            return Ok(format!("{ECS_CREDENTIALS_HOST}{relative}"));
        }
        if let Ok(full) = env::var("AWS_CONTAINER_CREDENTIALS_FULL_URI") {
            return Ok(full);
        }
        Err(Anomaly::of(
            Category::NotFound,
            "no container credentials URI configured",
        ))
    }
}

impl CredentialsProvider for EcsCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        let uri = Self::credentials_uri()?;
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .map_err(Anomaly::fault_from)?;
        let response = http.get(&uri).send().map_err(|e| {
            Anomaly::of(Category::Unavailable, format!("container endpoint: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(Anomaly::of(
                Category::Unavailable,
                format!("container endpoint returned {}", response.status()),
            ));
        }
        let text = response.text().map_err(Anomaly::fault_from)?;
        parse_container_credentials(&text)
    }
}

/// Provides credentials from the EC2 instance role via IMDSv2.
pub struct ImdsCredentialsProvider {
    imds: ImdsClient,
}

impl Default for ImdsCredentialsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImdsCredentialsProvider {
    pub fn new() -> Self {
        Self {
            imds: ImdsClient::new(),
        }
    }

    pub fn with_client(imds: ImdsClient) -> Self {
        Self { imds }
    }
}

impl CredentialsProvider for ImdsCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        let roles = self.imds.get("/latest/meta-data/iam/security-credentials/")?;
        let role = roles
            .lines()
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Anomaly::of(Category::NotFound, "no instance role"))?;
        let doc = self
            .imds
            .get(&format!("/latest/meta-data/iam/security-credentials/{role}"))?;
        parse_container_credentials(&doc)
    }
}

/// Tries providers in order; the first success wins, failures are silent.
pub struct ChainCredentialsProvider {
    providers: Vec<Arc<dyn CredentialsProvider>>,
}

impl ChainCredentialsProvider {
    pub fn new(providers: Vec<Arc<dyn CredentialsProvider>>) -> Self {
        Self { providers }
    }

    /// The default chain: environment → profile files → ECS container → IMDS.
    pub fn default_chain() -> Self {
        Self::new(vec![
            Arc::new(EnvCredentialsProvider),
            Arc::new(ProfileCredentialsProvider::new()),
            Arc::new(EcsCredentialsProvider),
            Arc::new(ImdsCredentialsProvider::new()),
        ])
    }
}

impl CredentialsProvider for ChainCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        for provider in &self.providers {
            match provider.fetch() {
                Ok(credentials) => return Ok(credentials),
                Err(anomaly) => {
                    debug!(%anomaly, "credentials provider skipped");
                }
            }
        }
        Err(Anomaly::of(
            Category::Fault,
            "no credentials found in provider chain",
        ))
    }
}

/// Caches another provider's result and refreshes it inside the expiry
/// window. Concurrent refreshes are deduplicated: one caller performs the
/// upstream fetch while the rest wait on it and reuse the stored value.
pub struct CachedCredentialsProvider {
    inner: Arc<dyn CredentialsProvider>,
    slot: Mutex<Option<Credentials>>,
    refresh: Mutex<()>,
}

impl CachedCredentialsProvider {
    pub fn new(inner: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            inner,
            slot: Mutex::new(None),
            refresh: Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<Credentials> {
        self.slot
            .lock()
            .expect("credentials cache poisoned")
            .clone()
            .filter(|c| !c.is_expired())
    }
}

impl CredentialsProvider for CachedCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, Anomaly> {
        if let Some(credentials) = self.fresh() {
            return Ok(credentials);
        }
        let _refreshing = self.refresh.lock().expect("credentials refresh poisoned");
        // Another caller may have refreshed while this one waited.
        if let Some(credentials) = self.fresh() {
            return Ok(credentials);
        }
        let credentials = self.inner.fetch()?;
        *self.slot.lock().expect("credentials cache poisoned") = Some(credentials.clone());
        Ok(credentials)
    }
}

static DEFAULT_PROVIDER: OnceLock<Arc<CachedCredentialsProvider>> = OnceLock::new();

/// The process-wide default provider: the default chain behind a cache.
pub fn default_provider() -> Arc<CachedCredentialsProvider> {
    DEFAULT_PROVIDER
        .get_or_init(|| {
            Arc::new(CachedCredentialsProvider::new(Arc::new(
                ChainCredentialsProvider::default_chain(),
            )))
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        expiration: Option<DateTime<Utc>>,
    }

    impl CountingProvider {
        fn new(expiration: Option<DateTime<Utc>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expiration,
            }
        }
    }

    impl CredentialsProvider for CountingProvider {
        fn fetch(&self) -> Result<Credentials, Anomaly> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut c = Credentials::new("AKID", "secret");
            c.expiration = self.expiration;
            Ok(c)
        }
    }

    struct FailingProvider;

    impl CredentialsProvider for FailingProvider {
        fn fetch(&self) -> Result<Credentials, Anomaly> {
            Err(Anomaly::of(Category::NotFound, "nothing here"))
        }
    }

    #[test]
    fn static_provider_returns_credentials() {
        let provider = StaticCredentialsProvider::new(Credentials::new("id", "secret"));
        let credentials = provider.fetch().unwrap();
        assert_eq!(credentials.access_key_id, "id");
    }

    #[test]
    fn debug_redacts_secrets() {
        let credentials = Credentials::new("AKIDEXAMPLE", "super-secret")
            .with_session_token("session-secret");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(debug.contains("****"));
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("session-secret"));
    }

    #[test]
    fn expiry_inside_window() {
        let now = Utc::now();
        let soon = Credentials::new("a", "b").with_expiration(now + Duration::minutes(4));
        let later = Credentials::new("a", "b").with_expiration(now + Duration::minutes(6));
        let never = Credentials::new("a", "b");
        assert!(soon.is_expired_at(now));
        assert!(!later.is_expired_at(now));
        assert!(!never.is_expired_at(now));
    }

    #[test]
    fn chain_returns_first_success() {
        let chain = ChainCredentialsProvider::new(vec![
            Arc::new(FailingProvider),
            Arc::new(StaticCredentialsProvider::new(Credentials::new("one", "s"))),
            Arc::new(StaticCredentialsProvider::new(Credentials::new("two", "s"))),
        ]);
        assert_eq!(chain.fetch().unwrap().access_key_id, "one");
    }

    #[test]
    fn exhausted_chain_is_fault() {
        let chain = ChainCredentialsProvider::new(vec![Arc::new(FailingProvider)]);
        let anomaly = chain.fetch().unwrap_err();
        assert_eq!(anomaly.category, Category::Fault);
    }

    #[test]
    fn cache_fetches_once_for_non_expiring() {
        let counting = Arc::new(CountingProvider::new(None));
        let cache = CachedCredentialsProvider::new(counting.clone());
        for _ in 0..5 {
            cache.fetch().unwrap();
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_refreshes_expired() {
        let counting = Arc::new(CountingProvider::new(Some(Utc::now())));
        let cache = CachedCredentialsProvider::new(counting.clone());
        cache.fetch().unwrap();
        cache.fetch().unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_fetches_share_one_upstream_call() {
        let counting = Arc::new(CountingProvider::new(None));
        let cache = Arc::new(CachedCredentialsProvider::new(counting.clone()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.fetch().unwrap())
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(values.iter().all(|c| c.access_key_id == "AKID"));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_credential_process_output() {
        let credentials = parse_process_output(
            r#"{"Version": 1, "AccessKeyId": "AKID", "SecretAccessKey": "sk",
                "SessionToken": "tok", "Expiration": "2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
        assert_eq!(credentials.session_token.as_deref(), Some("tok"));
        assert!(credentials.expiration.is_some());
    }

    #[test]
    fn parses_container_credentials_document() {
        let credentials = parse_container_credentials(
            r#"{"AccessKeyId": "AKID", "SecretAccessKey": "sk", "Token": "tok",
                "Expiration": "2030-01-01T00:00:00Z", "Code": "Success"}"#,
        )
        .unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
        assert_eq!(credentials.session_token.as_deref(), Some("tok"));
    }
}
