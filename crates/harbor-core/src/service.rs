use serde::{Deserialize, Serialize};

use crate::errors::RegistryError;

/// Registration intent for one deployable instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tags: Vec::new(),
        }
    }

    /// Parses `host:port`, e.g. `localhost:8081`.
    pub fn from_host_port(name: impl Into<String>, host_port: &str) -> Result<Self, RegistryError> {
        let (host, port) = host_port
            .split_once(':')
            .filter(|(host, port)| !host.is_empty() && !port.contains(':'))
            .ok_or_else(|| {
                RegistryError::Configuration(format!(
                    "address must be in a form of <host>:<port>, example: localhost:8081, got {host_port:?}"
                ))
            })?;
        let port = port
            .parse::<u16>()
            .map_err(|e| RegistryError::Configuration(format!("invalid port {port:?}: {e}")))?;
        Ok(Self::new(name, host, port))
    }

    /// Tags behave as a set; repeats are dropped.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_tags<I, T>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        tags.into_iter().fold(self, |service, tag| service.with_tag(tag))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Configuration("service name is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RegistryError::Configuration(format!("service {} has no host", self.name)));
        }
        if self.port == 0 {
            return Err(RegistryError::Configuration(format!("service {} has port 0", self.name)));
        }
        Ok(())
    }
}
