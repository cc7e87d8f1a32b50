//! Resolver targets: `consul://[user:pass@]host:port/service?params`.
//!
//! A target tells a gRPC client where the registry lives and which subset of a
//! service's instances to balance over. Only options that were explicitly set
//! are encoded; everything else is left to the resolver's defaults.

use std::time::Duration;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::time::{format_duration, parse_duration};
use crate::{RegistryConfig, RegistryError};

pub const SCHEME: &str = "consul";

/// Node to sort results near, using Consul's network coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Near {
    /// Nearest to the agent serving the request (`_agent`).
    Agent,
    /// Nearest to the node associated with the caller's source IP (`_ip`).
    Ip,
    /// Nearest to a named node.
    Node(String),
}

impl Near {
    pub fn as_str(&self) -> &str {
        match self {
            Near::Agent => "_agent",
            Near::Ip => "_ip",
            Near::Node(node) => node,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "_agent" => Near::Agent,
            "_ip" => Near::Ip,
            node => Near::Node(node.to_string()),
        }
    }
}

/// Sparse query options for a resolver target.
///
/// Every field stays `None` until a setter records a value that differs from
/// the resolver's default, so absence and "explicitly false/zero" never blur.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    tag: Option<String>,
    healthy: Option<bool>,
    wait: Option<Duration>,
    insecure: Option<bool>,
    near: Option<Near>,
    limit: Option<i64>,
    timeout: Option<Duration>,
    max_backoff: Option<Duration>,
    token: Option<String>,
    dc: Option<String>,
    allow_stale: Option<bool>,
    require_consistent: Option<bool>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select only endpoints carrying this tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.is_empty() {
            self.tag = Some(tag);
        }
        self
    }

    /// Return only endpoints passing all health checks. Default: false.
    pub fn with_healthy(mut self, healthy: bool) -> Self {
        if healthy {
            self.healthy = Some(true);
        }
        self
    }

    /// Blocking-query wait time.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        if !wait.is_zero() {
            self.wait = Some(wait);
        }
        self
    }

    /// Allow plain-text communication with Consul. Default: true.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        if !insecure {
            self.insecure = Some(false);
        }
        self
    }

    pub fn with_near(mut self, near: Near) -> Self {
        if !near.as_str().is_empty() {
            self.near = Some(near);
        }
        self
    }

    /// Cap on the number of endpoints. Negative values fail at target construction.
    pub fn with_limit(mut self, limit: i64) -> Self {
        if limit != 0 {
            self.limit = Some(limit);
        }
        self
    }

    /// HTTP client timeout against Consul. Default: 60s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = Some(timeout);
        }
        self
    }

    /// Upper bound for reconnect backoff, which starts at 10ms and doubles. Default: 1s.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        if !max_backoff.is_zero() {
            self.max_backoff = Some(max_backoff);
        }
        self
    }

    /// ACL token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        if !token.is_empty() {
            self.token = Some(token);
        }
        self
    }

    pub fn with_dc(mut self, dc: impl Into<String>) -> Self {
        let dc = dc.into();
        if !dc.is_empty() {
            self.dc = Some(dc);
        }
        self
    }

    pub fn with_allow_stale(mut self, stale: bool) -> Self {
        self.allow_stale = Some(stale);
        self
    }

    pub fn with_require_consistent(mut self, require: bool) -> Self {
        self.require_consistent = Some(require);
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn healthy(&self) -> Option<bool> {
        self.healthy
    }

    pub fn wait(&self) -> Option<Duration> {
        self.wait
    }

    pub fn insecure(&self) -> Option<bool> {
        self.insecure
    }

    pub fn near(&self) -> Option<&Near> {
        self.near.as_ref()
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_backoff(&self) -> Option<Duration> {
        self.max_backoff
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn dc(&self) -> Option<&str> {
        self.dc.as_deref()
    }

    pub fn allow_stale(&self) -> Option<bool> {
        self.allow_stale
    }

    pub fn require_consistent(&self) -> Option<bool> {
        self.require_consistent
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(limit) = self.limit {
            if limit < 0 {
                return Err(RegistryError::Configuration(format!(
                    "limit cannot be less than zero, got {limit}"
                )));
            }
        }
        if self.allow_stale == Some(true) && self.require_consistent == Some(true) {
            return Err(RegistryError::Configuration(
                "allow-stale and require-consistent are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Query pairs for every explicitly set option, sorted by key.
    pub fn query_pairs(&self) -> Result<Vec<(&'static str, String)>, RegistryError> {
        self.validate()?;

        let mut pairs = Vec::new();
        if let Some(stale) = self.allow_stale {
            pairs.push(("allow-stale", stale.to_string()));
        }
        if let Some(dc) = &self.dc {
            pairs.push(("dc", dc.clone()));
        }
        if let Some(healthy) = self.healthy {
            pairs.push(("healthy", healthy.to_string()));
        }
        if let Some(insecure) = self.insecure {
            pairs.push(("insecure", insecure.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(max_backoff) = self.max_backoff {
            pairs.push(("max-backoff", format_duration(max_backoff)));
        }
        if let Some(near) = &self.near {
            pairs.push(("near", near.as_str().to_string()));
        }
        if let Some(require) = self.require_consistent {
            pairs.push(("require-consistent", require.to_string()));
        }
        if let Some(tag) = &self.tag {
            pairs.push(("tag", tag.clone()));
        }
        if let Some(timeout) = self.timeout {
            pairs.push(("timeout", format_duration(timeout)));
        }
        if let Some(token) = &self.token {
            pairs.push(("token", token.clone()));
        }
        if let Some(wait) = self.wait {
            pairs.push(("wait", format_duration(wait)));
        }
        Ok(pairs)
    }
}

/// Builds the resolver target for `service_name`. Performs no I/O.
pub fn resolver_target(
    config: &RegistryConfig,
    service_name: &str,
    options: &ResolveOptions,
) -> Result<String, RegistryError> {
    if service_name.trim().is_empty() {
        return Err(RegistryError::Configuration("service name is empty".into()));
    }
    let pairs = options.query_pairs()?;

    let mut target = Url::parse(&format!("{SCHEME}://{}/", config.address())).map_err(|e| {
        RegistryError::Configuration(format!("invalid registry address {}: {e}", config.address()))
    })?;
    if let Some((user, pass)) = config.credentials() {
        target
            .set_username(user)
            .and_then(|_| target.set_password(Some(pass)))
            .map_err(|_| RegistryError::Configuration("registry address cannot carry credentials".into()))?;
    }
    target
        .path_segments_mut()
        .map_err(|_| RegistryError::Configuration("registry address cannot be a base url".into()))?
        .clear()
        .push(service_name);
    if !pairs.is_empty() {
        target
            .query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(key, value)| (*key, value.as_str())));
    }
    Ok(target.into())
}

/// A decoded resolver target, as consumed by a balancing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveTarget {
    pub registry: RegistryConfig,
    pub service_name: String,
    pub options: ResolveOptions,
}

impl ResolveTarget {
    pub fn parse(target: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::Configuration(format!("invalid target {target:?}: {reason}"));

        let url = Url::parse(target).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(invalid(format!("scheme must be {SCHEME}")));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing registry host".into()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let mut registry = RegistryConfig::new(host, url.port().unwrap_or(crate::config::DEFAULT_PORT));
        if !url.username().is_empty() {
            let user = percent_decode_str(url.username()).decode_utf8_lossy().into_owned();
            let pass = url
                .password()
                .map(|pass| percent_decode_str(pass).decode_utf8_lossy().into_owned())
                .unwrap_or_default();
            registry = registry.with_credentials(user, pass);
        }

        let service_name = percent_decode_str(url.path().trim_start_matches('/'))
            .decode_utf8_lossy()
            .into_owned();
        if service_name.is_empty() {
            return Err(invalid("missing service name".into()));
        }

        let mut options = ResolveOptions::new();
        for (key, value) in url.query_pairs() {
            let duration = || parse_duration(&value).ok_or_else(|| invalid(format!("{key} is not a duration: {value}")));
            let flag = || value.parse::<bool>().map_err(|_| invalid(format!("{key} is not a boolean: {value}")));
            options = match &*key {
                "tag" => options.with_tag(&*value),
                "healthy" => options.with_healthy(flag()?),
                "wait" => options.with_wait(duration()?),
                "insecure" => options.with_insecure(flag()?),
                "near" => options.with_near(Near::parse(&value)),
                "limit" => options.with_limit(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("limit is not an integer: {value}")))?,
                ),
                "timeout" => options.with_timeout(duration()?),
                "max-backoff" => options.with_max_backoff(duration()?),
                "token" => options.with_token(&*value),
                "dc" => options.with_dc(&*value),
                "allow-stale" => options.with_allow_stale(flag()?),
                "require-consistent" => options.with_require_consistent(flag()?),
                other => return Err(invalid(format!("unknown parameter {other}"))),
            };
        }
        options.validate()?;

        Ok(Self {
            registry,
            service_name,
            options,
        })
    }
}
