use harbor_core::RegistryError;

/// Errors for the agent-side surfaces that go beyond the `Registry` trait.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid endpoint {address}: {reason}")]
    Endpoint { address: String, reason: String },
}
