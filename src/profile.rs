use crate::config::ProfileConfig;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

#[derive(Error, Debug, Clone)]
pub enum ProfileError {
    #[error("Instrumentation key must not be empty")]
    EmptyKey,
    #[error("Profile endpoint is invalid: {0}")]
    InvalidEndpoint(String),
    #[error("Profile request failed: {0}")]
    Request(String),
    #[error("Backend returned an empty application id")]
    EmptyAppId,
    #[error("Retry cap reached for this key, waiting for reset")]
    RetriesExhausted,
}

type SharedFetch = Shared<BoxFuture<'static, Result<String, ProfileError>>>;

/// Resolves instrumentation keys to application ids.
///
/// Concurrent callers for the same key are coalesced onto a single in-flight
/// request; completion, success or failure, removes the entry. Keys that keep
/// failing are refused until the periodic purge clears the counters.
pub struct AppIdResolver {
    client: Client,
    endpoint: Url,
    max_instant_retries: u32,
    tasks: Mutex<HashMap<String, SharedFetch>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl AppIdResolver {
    pub fn new(config: &ProfileConfig) -> Result<Self, ProfileError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| ProfileError::InvalidEndpoint(e.to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProfileError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            max_instant_retries: config.max_instant_retries,
            tasks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub async fn fetch_app_id(&self, instrumentation_key: &str) -> Result<String, ProfileError> {
        if instrumentation_key.trim().is_empty() {
            return Err(ProfileError::EmptyKey);
        }

        let failure_count = self
            .failures
            .lock()
            .get(instrumentation_key)
            .copied()
            .unwrap_or(0);
        if failure_count >= self.max_instant_retries {
            debug!(
                key = instrumentation_key,
                "profile fetch refused, retry cap reached"
            );
            return Err(ProfileError::RetriesExhausted);
        }

        let url = self.profile_url(instrumentation_key)?;

        // Join an in-flight lookup for this key, or publish a new one.
        let fetch = {
            let mut tasks = self.tasks.lock();
            match tasks.get(instrumentation_key) {
                Some(existing) => existing.clone(),
                None => {
                    let fetch = Self::run_fetch(self.client.clone(), url).boxed().shared();
                    tasks.insert(instrumentation_key.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.await;
        self.tasks.lock().remove(instrumentation_key);

        match result {
            Ok(app_id) if app_id.trim().is_empty() => {
                self.record_failure(instrumentation_key);
                Err(ProfileError::EmptyAppId)
            }
            Ok(app_id) => Ok(app_id),
            Err(e) => {
                self.record_failure(instrumentation_key);
                Err(e)
            }
        }
    }

    /// Clears failure counters and pending lookups.
    pub fn purge(&self) {
        self.tasks.lock().clear();
        self.failures.lock().clear();
    }

    /// Spawns the periodic purge sweep; must be called within a tokio runtime.
    /// The task ends when the resolver is dropped.
    pub fn spawn_purge_task(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;
                match resolver.upgrade() {
                    Some(resolver) => {
                        resolver.purge();
                        trace!("cleared profile retry counters and pending lookups");
                    }
                    None => break,
                }
            }
        })
    }

    fn profile_url(&self, instrumentation_key: &str) -> Result<Url, ProfileError> {
        self.endpoint
            .join(&format!("api/profiles/{instrumentation_key}/appId"))
            .map_err(|e| ProfileError::InvalidEndpoint(e.to_string()))
    }

    async fn run_fetch(client: Client, url: Url) -> Result<String, ProfileError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProfileError::Request(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))
    }

    fn record_failure(&self, instrumentation_key: &str) {
        let mut failures = self.failures.lock();
        *failures
            .entry(instrumentation_key.to_string())
            .or_insert(0) += 1;
    }
}
