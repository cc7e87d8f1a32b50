//! In-memory registry (for testing/development)
//!
//! Mirrors the parts of Consul this workspace relies on: instances start with a
//! critical TTL check, turn passing on a heartbeat and fall back to critical once
//! no heartbeat arrived within `CHECK_TTL`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::registry::CHECK_TTL;
use crate::time::{Clock, SystemClock};
use crate::{CheckStatus, InstanceHandle, Registry, RegistryError, ServiceDescriptor};

#[derive(Debug, Clone)]
struct Entry {
    handle: InstanceHandle,
    service: ServiceDescriptor,
    status: CheckStatus,
    last_report: u64,
    reports: usize,
}

#[derive(Clone)]
pub struct MemoryRegistry {
    entries: Arc<RwLock<Vec<Entry>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates losing the registry: every call fails with `Registration` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of registered instances, healthy or not.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Handles of every registered instance, in registration order.
    pub async fn instances(&self) -> Vec<InstanceHandle> {
        self.entries.read().await.iter().map(|entry| entry.handle.clone()).collect()
    }

    /// Heartbeats accepted for `handle` so far.
    pub async fn reports(&self, handle: &InstanceHandle) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.handle == *handle)
            .map_or(0, |entry| entry.reports)
    }

    fn ensure_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RegistryError::Registration("registry unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn is_passing(&self, entry: &Entry, now: u64) -> bool {
        entry.status == CheckStatus::Passing
            && now.saturating_sub(entry.last_report) <= CHECK_TTL.as_millis() as u64
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &ServiceDescriptor) -> Result<InstanceHandle, RegistryError> {
        service.validate()?;
        self.ensure_available()?;

        let handle = InstanceHandle::generate(&service.name);
        self.entries.write().await.push(Entry {
            handle: handle.clone(),
            service: service.clone(),
            status: CheckStatus::Critical,
            last_report: self.clock.now_millis(),
            reports: 0,
        });
        Ok(handle)
    }

    async fn deregister(&self, handle: &InstanceHandle) -> Result<(), RegistryError> {
        self.ensure_available()?;

        let mut entries = self.entries.write().await;
        let position = entries
            .iter()
            .position(|entry| entry.handle == *handle)
            .ok_or_else(|| RegistryError::InstanceNotFound(handle.id().to_string()))?;
        entries.remove(position);
        Ok(())
    }

    async fn service_addresses(&self, service_name: &str) -> Result<Vec<String>, RegistryError> {
        self.ensure_available()?;

        let now = self.clock.now_millis();
        let addresses: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.service.name == service_name && self.is_passing(entry, now))
            .map(|entry| entry.service.address())
            .collect();

        if addresses.is_empty() {
            Err(RegistryError::NoAddressesFound(service_name.to_string()))
        } else {
            Ok(addresses)
        }
    }

    async fn report_heartbeat(&self, handle: &InstanceHandle, status: CheckStatus) -> Result<(), RegistryError> {
        self.ensure_available()?;

        let now = self.clock.now_millis();
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.handle == *handle)
            .ok_or_else(|| RegistryError::Registration(format!("unknown check id {}", handle.check_id())))?;
        entry.status = status;
        entry.last_report = now;
        entry.reports += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::time::ManualClock;

    fn orders() -> ServiceDescriptor {
        ServiceDescriptor::new("orders", "10.0.0.5", 9000).with_tag("v2")
    }

    #[tokio::test]
    async fn instances_are_hidden_until_first_heartbeat() {
        let registry = MemoryRegistry::new();
        let handle = registry.register(&orders()).await.unwrap();

        assert_eq!(
            registry.service_addresses("orders").await,
            Err(RegistryError::NoAddressesFound("orders".into()))
        );

        registry.report_heartbeat(&handle, CheckStatus::Passing).await.unwrap();
        assert_eq!(registry.service_addresses("orders").await.unwrap(), vec!["10.0.0.5:9000"]);
        assert_eq!(registry.reports(&handle).await, 1);
    }

    #[tokio::test]
    async fn missed_ttl_marks_instance_failing() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = MemoryRegistry::with_clock(clock.clone());
        let handle = registry.register(&orders()).await.unwrap();
        registry.report_heartbeat(&handle, CheckStatus::Passing).await.unwrap();

        clock.advance(Duration::from_secs(4));
        assert!(registry.service_addresses("orders").await.is_ok());

        clock.advance(Duration::from_secs(2));
        assert!(matches!(
            registry.service_addresses("orders").await,
            Err(RegistryError::NoAddressesFound(_))
        ));
    }

    #[tokio::test]
    async fn second_deregister_reports_not_found() {
        let registry = MemoryRegistry::new();
        let handle = registry.register(&orders()).await.unwrap();

        assert_eq!(registry.instances().await, vec![handle.clone()]);
        registry.deregister(&handle).await.unwrap();
        assert!(matches!(
            registry.deregister(&handle).await,
            Err(RegistryError::InstanceNotFound(_))
        ));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn unavailable_registry_rejects_everything() {
        let registry = MemoryRegistry::new();
        registry.set_unavailable(true);
        assert!(matches!(
            registry.register(&orders()).await,
            Err(RegistryError::Registration(_))
        ));

        registry.set_unavailable(false);
        assert!(registry.register(&orders()).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_descriptor_fails_before_registry_contact() {
        let registry = MemoryRegistry::new();
        registry.set_unavailable(true);
        let err = registry
            .register(&ServiceDescriptor::new("orders", "", 9000))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Configuration(_)));
    }
}
