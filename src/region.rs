//! Region resolution: the same chain shape as credentials, without expiry.
//!
//! The instance-metadata member is memoizing: concurrent fetches all observe
//! the first successful result and exactly one upstream HTTP call is made.

use std::env;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::anomaly::{Anomaly, Category};
use crate::imds::ImdsClient;
use crate::profile;

/// Resolves the region to use for requests.
pub trait RegionProvider: Send + Sync {
    fn fetch(&self) -> Result<String, Anomaly>;
}

/// Provides an explicitly configured region.
pub struct StaticRegionProvider {
    region: String,
}

impl StaticRegionProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

impl RegionProvider for StaticRegionProvider {
    fn fetch(&self) -> Result<String, Anomaly> {
        Ok(self.region.clone())
    }
}

/// Provides the region from `AWS_REGION`, falling back to
/// `AWS_DEFAULT_REGION`.
pub struct EnvRegionProvider;

impl RegionProvider for EnvRegionProvider {
    fn fetch(&self) -> Result<String, Anomaly> {
        env::var("AWS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .ok()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Anomaly::of(Category::NotFound, "no region in environment"))
    }
}

/// Provides the region from the selected shared-config profile.
pub struct ProfileRegionProvider {
    profile_name: Option<String>,
}

impl Default for ProfileRegionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegionProvider {
    pub fn new() -> Self {
        Self { profile_name: None }
    }

    pub fn with_profile(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }
}

impl RegionProvider for ProfileRegionProvider {
    fn fetch(&self) -> Result<String, Anomaly> {
        let name = self
            .profile_name
            .clone()
            .unwrap_or_else(profile::selected_profile);
        let values = profile::profile_values(&name)?;
        values
            .get("region")
            .cloned()
            .ok_or_else(|| Anomaly::of(Category::NotFound, "profile has no region"))
    }
}

/// Provides the region from the EC2 instance placement document.
pub struct ImdsRegionProvider {
    imds: ImdsClient,
}

impl Default for ImdsRegionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImdsRegionProvider {
    pub fn new() -> Self {
        Self {
            imds: ImdsClient::new(),
        }
    }

    pub fn with_client(imds: ImdsClient) -> Self {
        Self { imds }
    }
}

impl RegionProvider for ImdsRegionProvider {
    fn fetch(&self) -> Result<String, Anomaly> {
        self.imds.region()
    }
}

/// Memoizes another provider's first successful result. Concurrent callers
/// serialize on the refresh guard, so the upstream fetch runs exactly once.
pub struct MemoizedRegionProvider<P> {
    inner: P,
    slot: Mutex<Option<String>>,
    refresh: Mutex<()>,
}

impl<P: RegionProvider> MemoizedRegionProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            slot: Mutex::new(None),
            refresh: Mutex::new(()),
        }
    }
}

impl<P: RegionProvider> RegionProvider for MemoizedRegionProvider<P> {
    fn fetch(&self) -> Result<String, Anomaly> {
        if let Some(region) = self.slot.lock().expect("region cache poisoned").clone() {
            return Ok(region);
        }
        let _refreshing = self.refresh.lock().expect("region refresh poisoned");
        if let Some(region) = self.slot.lock().expect("region cache poisoned").clone() {
            return Ok(region);
        }
        let region = self.inner.fetch()?;
        *self.slot.lock().expect("region cache poisoned") = Some(region.clone());
        Ok(region)
    }
}

/// Tries providers in order; exhaustion is a `fault`.
pub struct ChainRegionProvider {
    providers: Vec<Arc<dyn RegionProvider>>,
}

impl ChainRegionProvider {
    pub fn new(providers: Vec<Arc<dyn RegionProvider>>) -> Self {
        Self { providers }
    }

    /// The default chain: environment → profile file → instance metadata.
    pub fn default_chain() -> Self {
        Self::new(vec![
            Arc::new(EnvRegionProvider),
            Arc::new(ProfileRegionProvider::new()),
            Arc::new(MemoizedRegionProvider::new(ImdsRegionProvider::new())),
        ])
    }
}

impl RegionProvider for ChainRegionProvider {
    fn fetch(&self) -> Result<String, Anomaly> {
        for provider in &self.providers {
            match provider.fetch() {
                Ok(region) => return Ok(region),
                Err(anomaly) => {
                    debug!(%anomaly, "region provider skipped");
                }
            }
        }
        Err(Anomaly::of(Category::Fault, "No region found"))
    }
}

static DEFAULT_PROVIDER: OnceLock<Arc<ChainRegionProvider>> = OnceLock::new();

/// The process-wide default region provider chain.
pub fn default_provider() -> Arc<ChainRegionProvider> {
    DEFAULT_PROVIDER
        .get_or_init(|| Arc::new(ChainRegionProvider::default_chain()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl RegionProvider for CountingProvider {
        fn fetch(&self) -> Result<String, Anomaly> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("eu-central-1".to_string())
        }
    }

    struct FailingProvider;

    impl RegionProvider for FailingProvider {
        fn fetch(&self) -> Result<String, Anomaly> {
            Err(Anomaly::of(Category::NotFound, "nope"))
        }
    }

    #[test]
    fn static_provider_returns_region() {
        assert_eq!(
            StaticRegionProvider::new("us-west-2").fetch().unwrap(),
            "us-west-2"
        );
    }

    #[test]
    fn chain_returns_first_success() {
        let chain = ChainRegionProvider::new(vec![
            Arc::new(FailingProvider),
            Arc::new(StaticRegionProvider::new("ap-southeast-2")),
        ]);
        assert_eq!(chain.fetch().unwrap(), "ap-southeast-2");
    }

    #[test]
    fn exhausted_chain_reports_no_region_found() {
        let chain = ChainRegionProvider::new(vec![Arc::new(FailingProvider)]);
        let anomaly = chain.fetch().unwrap_err();
        assert_eq!(anomaly.category, Category::Fault);
        assert_eq!(anomaly.message.as_deref(), Some("No region found"));
    }

    #[test]
    fn memoized_provider_fetches_upstream_once() {
        let memo = Arc::new(MemoizedRegionProvider::new(CountingProvider {
            calls: AtomicUsize::new(0),
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let memo = memo.clone();
                std::thread::spawn(move || memo.fetch().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "eu-central-1");
        }
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn env_provider_prefers_aws_region() {
        let saved_region = env::var("AWS_REGION").ok();
        let saved_default = env::var("AWS_DEFAULT_REGION").ok();
        unsafe {
            env::set_var("AWS_REGION", "us-east-2");
            env::set_var("AWS_DEFAULT_REGION", "us-west-1");
        }
        assert_eq!(EnvRegionProvider.fetch().unwrap(), "us-east-2");
        unsafe {
            env::remove_var("AWS_REGION");
        }
        assert_eq!(EnvRegionProvider.fetch().unwrap(), "us-west-1");
        unsafe {
            match saved_region {
                Some(v) => env::set_var("AWS_REGION", v),
                None => env::remove_var("AWS_REGION"),
            }
            match saved_default {
                Some(v) => env::set_var("AWS_DEFAULT_REGION", v),
                None => env::remove_var("AWS_DEFAULT_REGION"),
            }
        }
    }
}
