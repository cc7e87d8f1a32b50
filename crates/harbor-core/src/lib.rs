pub mod config;
pub mod service;
pub mod instance;
pub mod health;
pub mod registry;
pub mod errors;
pub mod feedback;
pub mod resolve;
pub mod memory;
pub mod time;

pub use config::RegistryConfig;
pub use service::ServiceDescriptor;
pub use instance::InstanceHandle;
pub use health::CheckStatus;
pub use registry::{Registry, CHECK_TTL, HEARTBEAT_INTERVAL};
pub use errors::RegistryError;
pub use feedback::{Feedback, FeedbackReceiver, FeedbackSender};
pub use resolve::{resolver_target, Near, ResolveOptions, ResolveTarget, SCHEME};
pub use memory::MemoryRegistry;
