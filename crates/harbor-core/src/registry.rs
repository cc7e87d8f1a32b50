use std::time::Duration;

use async_trait::async_trait;

use crate::{CheckStatus, InstanceHandle, RegistryError, ServiceDescriptor};

/// TTL attached to every registered instance's liveness check.
pub const CHECK_TTL: Duration = Duration::from_secs(5);

/// How often a registered instance must confirm liveness to stay inside `CHECK_TTL`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Registry: Send + Sync {
    /// Registers the instance together with a TTL check of `CHECK_TTL`.
    async fn register(&self, service: &ServiceDescriptor) -> Result<InstanceHandle, RegistryError>;

    /// Removes the instance record. A repeated call may yield `InstanceNotFound`.
    async fn deregister(&self, handle: &InstanceHandle) -> Result<(), RegistryError>;

    /// `host:port` of every instance currently passing all health checks.
    async fn service_addresses(&self, service_name: &str) -> Result<Vec<String>, RegistryError>;

    async fn report_heartbeat(&self, handle: &InstanceHandle, status: CheckStatus) -> Result<(), RegistryError>;
}
