use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registry-assigned identity of one registered instance.
///
/// The TTL check registered alongside the instance shares its id, so the
/// same handle addresses both the service record and its liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    service_name: String,
    id: String,
}

impl InstanceHandle {
    /// Mints a fresh `<name>-<uuid>` id. Meant for `Registry` implementations;
    /// callers receive handles from `Registry::register`.
    pub fn generate(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let id = format!("{}-{}", service_name, Uuid::new_v4());
        Self { service_name, id }
    }

    /// Re-attaches to an instance registered elsewhere, e.g. by a previous process.
    pub fn from_parts(service_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn check_id(&self) -> &str {
        &self.id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
