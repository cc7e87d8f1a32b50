/// Errors surfaced by registry clients, the heartbeat loop and the retry wrapper.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Invalid service descriptor, malformed `host:port` or resolve option.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The registry rejected a call or could not be reached.
    #[error("registry call failed: {0}")]
    Registration(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The query succeeded but no healthy entries exist.
    #[error("no service addresses found for {0}")]
    NoAddressesFound(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RegistryError {
    /// Only registry-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Registration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_registration_failures_are_retryable() {
        assert!(RegistryError::Registration("connection refused".into()).is_retryable());
        assert!(!RegistryError::Configuration("bad port".into()).is_retryable());
        assert!(!RegistryError::Cancelled.is_retryable());
        assert!(!RegistryError::NoAddressesFound("orders".into()).is_retryable());
    }
}
