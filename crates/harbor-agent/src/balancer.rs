//! Load-balanced gRPC channels fed from Consul.
//!
//! tonic's [`Channel::balance_channel`] hands back a sender through which
//! endpoint changes are announced. A watcher task resolves the target's
//! service against Consul's health endpoint and reports the difference
//! between consecutive answers as `Insert`/`Remove` changes; tower's balancer
//! spreads requests across whatever endpoints are ready.

use std::collections::HashSet;
use std::time::Duration;

use harbor_core::time::format_duration;
use harbor_core::{RegistryConfig, RegistryError, ResolveOptions, ResolveTarget, resolver_target};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};
use url::Url;

use crate::consul::HealthEntry;
use crate::errors::AgentError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);
const MIN_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Scheme used to dial resolved instances.
    pub endpoint_scheme: String,
    pub connect_timeout: Duration,
    /// Capacity of the change queue between watcher and channel.
    pub buffer: usize,
    /// Re-query delay when the registry answers without a blocking-query index.
    pub poll_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            endpoint_scheme: "http".to_string(),
            connect_timeout: Duration::from_secs(5),
            buffer: 1024,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// A round-robin channel over the healthy instances behind a resolver target.
/// Dropping it stops the watcher.
pub struct BalancedChannel {
    channel: Channel,
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

impl BalancedChannel {
    /// Must be called from within a tokio runtime.
    pub fn connect(target: &str, config: BalancerConfig, parent: &CancellationToken) -> Result<Self, AgentError> {
        let target = ResolveTarget::parse(target)?;
        let watcher = Watcher::new(&target, &config)?;
        let (channel, changes) = Channel::balance_channel(config.buffer);
        let token = parent.child_token();

        info!(service = %target.service_name, registry = %target.registry.address(), "Creating load-balanced gRPC channel");
        let watcher = tokio::spawn(watcher.run(changes, token.clone()));
        Ok(Self {
            channel,
            token,
            watcher,
        })
    }

    /// Builds the resolver target for `service_name` and connects to it.
    pub fn for_service(
        registry: &RegistryConfig,
        service_name: &str,
        options: &ResolveOptions,
        config: BalancerConfig,
        parent: &CancellationToken,
    ) -> Result<Self, AgentError> {
        let target = resolver_target(registry, service_name, options)?;
        Self::connect(&target, config, parent)
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn is_watching(&self) -> bool {
        !self.watcher.is_finished()
    }
}

impl Drop for BalancedChannel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Consul holds a blocking query for up to `wait + wait/16`, so the wait must
/// leave room inside the client timeout. Without a usable `wait` half the
/// timeout is used.
fn blocking_wait(wait: Option<Duration>, timeout: Duration) -> Duration {
    let fallback = timeout / 2;
    match wait {
        Some(wait) if wait + wait / 16 < timeout => wait,
        Some(wait) => {
            warn!(wait = ?wait, timeout = ?timeout, "Blocking query wait does not fit the timeout, using {:?}", fallback);
            fallback
        }
        None => fallback,
    }
}

pub(crate) struct Watcher {
    client: reqwest::Client,
    service_name: String,
    url: Url,
    credentials: Option<(String, String)>,
    acl_token: Option<String>,
    limit: Option<usize>,
    /// Always sent with blocking queries; stays below the client timeout.
    wait: Duration,
    max_backoff: Duration,
    poll_interval: Duration,
    endpoint_scheme: String,
    connect_timeout: Duration,
}

impl Watcher {
    pub(crate) fn new(target: &ResolveTarget, config: &BalancerConfig) -> Result<Self, AgentError> {
        let options = &target.options;
        let scheme = if options.insecure() == Some(false) { "https" } else { "http" };
        let mut url = Url::parse(&format!("{scheme}://{}", target.registry.address())).map_err(|e| {
            RegistryError::Configuration(format!("invalid registry address {}: {e}", target.registry.address()))
        })?;
        url.path_segments_mut()
            .map_err(|_| RegistryError::Configuration("registry address cannot be a base url".into()))?
            .extend(["v1", "health", "service", target.service_name.as_str()]);
        {
            let mut query = url.query_pairs_mut();
            if options.healthy() == Some(true) {
                query.append_pair("passing", "true");
            }
            if let Some(tag) = options.tag() {
                query.append_pair("tag", tag);
            }
            if let Some(near) = options.near() {
                query.append_pair("near", near.as_str());
            }
            if let Some(dc) = options.dc() {
                query.append_pair("dc", dc);
            }
            if options.allow_stale() == Some(true) {
                query.append_pair("stale", "");
            }
            if options.require_consistent() == Some(true) {
                query.append_pair("consistent", "");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let timeout = options.timeout().unwrap_or(DEFAULT_TIMEOUT);
        let wait = blocking_wait(options.wait(), timeout);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            service_name: target.service_name.clone(),
            url,
            credentials: target
                .registry
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            acl_token: options.token().map(str::to_string),
            limit: options.limit().map(|limit| usize::try_from(limit).unwrap_or(usize::MAX)),
            wait,
            max_backoff: options.max_backoff().unwrap_or(DEFAULT_MAX_BACKOFF),
            poll_interval: config.poll_interval,
            endpoint_scheme: config.endpoint_scheme.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    /// One health query. `index` > 0 turns it into a blocking query.
    async fn fetch(&self, index: u64) -> Result<(Vec<String>, Option<u64>), AgentError> {
        let mut url = self.url.clone();
        if index > 0 {
            let mut query = url.query_pairs_mut();
            query.append_pair("index", &index.to_string());
            query.append_pair("wait", &format_duration(self.wait));
        }

        let mut request = self.client.get(url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        if let Some(token) = &self.acl_token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Registration(format!(
                "health query for {} rejected with {}",
                self.service_name,
                response.status()
            ))
            .into());
        }
        let next_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let entries: Vec<HealthEntry> = response.json().await?;

        let mut addresses: Vec<String> = entries.iter().map(HealthEntry::address).collect();
        if let Some(limit) = self.limit {
            addresses.truncate(limit);
        }
        Ok((addresses, next_index))
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, AgentError> {
        Endpoint::from_shared(format!("{}://{}", self.endpoint_scheme, address))
            .map(|endpoint| endpoint.connect_timeout(self.connect_timeout))
            .map_err(|e| AgentError::Endpoint {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    /// Announces the difference between `current` and `addresses`.
    /// Returns `false` once the channel side has gone away.
    async fn apply(
        &self,
        current: &mut HashSet<String>,
        addresses: Vec<String>,
        changes: &Sender<Change<String, Endpoint>>,
    ) -> bool {
        let mut next: HashSet<String> = addresses.into_iter().collect();

        for gone in current.difference(&next) {
            debug!(service = %self.service_name, address = %gone, "Removing endpoint");
            if changes.send(Change::Remove(gone.clone())).await.is_err() {
                return false;
            }
        }

        let added: Vec<String> = next.difference(current).cloned().collect();
        for address in added {
            match self.endpoint(&address) {
                Ok(endpoint) => {
                    debug!(service = %self.service_name, address = %address, "Inserting endpoint");
                    if changes.send(Change::Insert(address, endpoint)).await.is_err() {
                        return false;
                    }
                }
                Err(err) => {
                    warn!(service = %self.service_name, error = %err, "Skipping endpoint");
                    next.remove(&address);
                }
            }
        }

        *current = next;
        true
    }

    pub(crate) async fn run(self, changes: Sender<Change<String, Endpoint>>, token: CancellationToken) {
        info!(service = %self.service_name, "Watching registry for endpoint changes");
        let mut current = HashSet::new();
        let mut index = 0u64;
        let mut backoff = MIN_BACKOFF;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                fetched = self.fetch(index) => fetched,
            };

            let pause = match fetched {
                Ok((addresses, next_index)) => {
                    backoff = MIN_BACKOFF;
                    if !self.apply(&mut current, addresses, &changes).await {
                        debug!(service = %self.service_name, "Balanced channel dropped");
                        break;
                    }
                    match next_index {
                        Some(next) if next >= index => {
                            index = next;
                            Duration::ZERO
                        }
                        // index went backwards; start over with a plain query
                        Some(_) => {
                            index = 0;
                            Duration::ZERO
                        }
                        None => {
                            index = 0;
                            self.poll_interval
                        }
                    }
                }
                Err(err) => {
                    warn!(service = %self.service_name, error = %err, retry_in = ?backoff, "Health query failed");
                    let pause = backoff;
                    backoff = backoff.saturating_mul(2).min(self.max_backoff);
                    pause
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(service = %self.service_name, "Stopped watching registry");
    }
}
