//! Client-side plumbing around a Consul agent.
//!
//! - [`ConsulRegistry`] registers instances with a TTL check, pushes heartbeats,
//!   queries healthy addresses and deregisters.
//! - [`heartbeat`] keeps one registration alive until cancelled or until a
//!   report fails.
//! - [`Retry`] wraps "register and start heartbeating" in exponential backoff.
//! - [`BalancedChannel`] turns a `consul://` resolver target into a
//!   round-robin tonic channel.
//!
//! ```rust,ignore
//! use harbor_agent::*;
//! use harbor_core::{RegistryConfig, ServiceDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let service = ServiceDescriptor::from_host_port("orders", "10.0.0.5:9000")?.with_tag("v2");
//! let registration = Retry::new(consul_effector(HeartbeatConfig::default(), None))
//!     .max_attempts(5)
//!     .run(&token, &service, &RegistryConfig::default())
//!     .await?;
//! // ... serve ...
//! registration.deregister().await?;
//! ```

pub mod balancer;
pub mod consul;
pub mod errors;
pub mod heartbeat;
pub mod registration;
pub mod retry;

pub use balancer::{BalancedChannel, BalancerConfig};
pub use consul::ConsulRegistry;
pub use errors::AgentError;
pub use heartbeat::{spawn_heartbeat, HeartbeatConfig, HeartbeatExit};
pub use registration::{consul_effector, keep_registered, registration_effector, Registration, RegistrationFuture};
pub use retry::{backoff_delay, Retry, BASE_DELAY};
