use std::sync::Arc;

use futures::future::BoxFuture;
use harbor_core::{FeedbackSender, InstanceHandle, Registry, RegistryConfig, RegistryError, ServiceDescriptor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consul::ConsulRegistry;
use crate::heartbeat::{spawn_heartbeat, HeartbeatConfig, HeartbeatExit};
use crate::retry::Retry;

/// A live registration: the client that made it, its handle and the heartbeat
/// loop keeping it healthy. Dropping it stops the heartbeat but leaves the
/// record in the registry; call `deregister` for a clean shutdown.
pub struct Registration {
    registry: Arc<dyn Registry>,
    handle: InstanceHandle,
    heartbeat_token: CancellationToken,
    heartbeat: Option<JoinHandle<HeartbeatExit>>,
    exit: Option<HeartbeatExit>,
}

impl Registration {
    /// Registers `service` and starts its heartbeat under a child of `parent`.
    pub async fn register(
        registry: Arc<dyn Registry>,
        service: &ServiceDescriptor,
        parent: &CancellationToken,
        heartbeat: HeartbeatConfig,
        feedback: Option<FeedbackSender>,
    ) -> Result<Self, RegistryError> {
        let handle = registry.register(service).await?;
        let heartbeat_token = parent.child_token();
        let task = spawn_heartbeat(
            registry.clone(),
            handle.clone(),
            heartbeat,
            heartbeat_token.clone(),
            feedback,
        );
        Ok(Self {
            registry,
            handle,
            heartbeat_token,
            heartbeat: Some(task),
            exit: None,
        })
    }

    pub fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn heartbeat_finished(&self) -> bool {
        self.exit.is_some() || self.heartbeat.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Waits for the heartbeat loop to stop and reports why.
    pub async fn wait_heartbeat(&mut self) -> HeartbeatExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.heartbeat.as_mut() {
            Some(task) => match task.await {
                Ok(exit) => exit,
                Err(err) => HeartbeatExit::Failed(RegistryError::Registration(format!(
                    "heartbeat task aborted: {err}"
                ))),
            },
            None => HeartbeatExit::Cancelled,
        };
        self.heartbeat = None;
        self.exit = Some(exit.clone());
        exit
    }

    /// Stops the heartbeat, then removes the record. An already-removed record counts as success.
    pub async fn deregister(mut self) -> Result<(), RegistryError> {
        self.heartbeat_token.cancel();
        let exit = self.wait_heartbeat().await;
        debug!(instance = %self.handle, ?exit, "Heartbeat stopped before deregistration");

        match self.registry.deregister(&self.handle).await {
            Ok(()) => Ok(()),
            Err(RegistryError::InstanceNotFound(id)) => {
                info!(instance = %id, "Instance already gone from registry");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.heartbeat_token.cancel();
    }
}

pub type RegistrationFuture = BoxFuture<'static, Result<Registration, RegistryError>>;

/// Effector for `Retry`: obtain a registry for the config, register, start heartbeating.
pub fn registration_effector<C>(
    connect: C,
    heartbeat: HeartbeatConfig,
    feedback: Option<FeedbackSender>,
) -> impl Fn(CancellationToken, ServiceDescriptor, RegistryConfig) -> RegistrationFuture
where
    C: Fn(&RegistryConfig) -> Result<Arc<dyn Registry>, RegistryError>,
{
    move |token, service, config| {
        let registry = connect(&config);
        let heartbeat = heartbeat.clone();
        let feedback = feedback.clone();
        let registration: RegistrationFuture = Box::pin(async move {
            service.validate()?;
            Registration::register(registry?, &service, &token, heartbeat, feedback).await
        });
        registration
    }
}

/// The standard effector: a fresh `ConsulRegistry` per attempt.
pub fn consul_effector(
    heartbeat: HeartbeatConfig,
    feedback: Option<FeedbackSender>,
) -> impl Fn(CancellationToken, ServiceDescriptor, RegistryConfig) -> RegistrationFuture {
    registration_effector(
        |config: &RegistryConfig| {
            ConsulRegistry::new(config.clone()).map(|registry| Arc::new(registry) as Arc<dyn Registry>)
        },
        heartbeat,
        feedback,
    )
}

/// Keeps `service` registered until `token` is cancelled, then deregisters it.
///
/// A failed heartbeat is answered with a fresh registration through `retry`;
/// the stale instance is removed once the new one is in place, when the
/// registry is most likely reachable again.
pub async fn keep_registered<F>(
    retry: &Retry<F>,
    token: &CancellationToken,
    service: &ServiceDescriptor,
    config: &RegistryConfig,
) -> Result<(), RegistryError>
where
    F: Fn(CancellationToken, ServiceDescriptor, RegistryConfig) -> RegistrationFuture,
{
    let mut stale: Option<Registration> = None;
    loop {
        let outcome = retry.run(token, service, config).await;
        if let Some(previous) = stale.take() {
            retire(previous).await;
        }
        let mut registration = match outcome {
            Ok(registration) => registration,
            Err(RegistryError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        };
        info!(instance = %registration.handle(), "Instance registered");

        match registration.wait_heartbeat().await {
            HeartbeatExit::Cancelled => {
                let id = registration.handle().to_string();
                registration.deregister().await?;
                info!(instance = %id, "Instance deregistered");
                return Ok(());
            }
            HeartbeatExit::Failed(err) => {
                warn!(instance = %registration.handle(), error = %err, "Heartbeat lost, registering again");
                stale = Some(registration);
            }
        }
    }
}

async fn retire(registration: Registration) {
    let id = registration.handle().to_string();
    match registration.deregister().await {
        Ok(()) => info!(instance = %id, "Stale instance removed"),
        Err(err) => warn!(instance = %id, error = %err, "Could not remove stale instance"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harbor_core::{MemoryRegistry, RegistryError};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deregister_stops_heartbeat_and_tolerates_missing_record() {
        let memory = Arc::new(MemoryRegistry::new());
        let registry: Arc<dyn Registry> = memory.clone();
        let token = CancellationToken::new();

        let registration = Registration::register(
            registry,
            &ServiceDescriptor::new("orders", "10.0.0.5", 9000),
            &token,
            HeartbeatConfig::default(),
            None,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!registration.heartbeat_finished());

        memory.deregister(registration.handle()).await.unwrap();
        // record removed behind the registration's back
        registration.deregister().await.unwrap();
        assert_eq!(memory.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_heartbeat() {
        let memory = Arc::new(MemoryRegistry::new());
        let token = CancellationToken::new();
        let mut registration = Registration::register(
            memory.clone(),
            &ServiceDescriptor::new("orders", "10.0.0.5", 9000),
            &token,
            HeartbeatConfig::default(),
            None,
        )
        .await
        .unwrap();

        token.cancel();
        assert_eq!(registration.wait_heartbeat().await, HeartbeatExit::Cancelled);
        assert!(registration.heartbeat_finished());
    }

    #[tokio::test]
    async fn effector_reports_invalid_service_as_configuration_error() {
        let effector = registration_effector(
            |_config: &RegistryConfig| -> Result<Arc<dyn Registry>, RegistryError> {
                Err(RegistryError::Registration("should not be reached".into()))
            },
            HeartbeatConfig::default(),
            None,
        );
        let result = effector(
            CancellationToken::new(),
            ServiceDescriptor::new("", "10.0.0.5", 9000),
            RegistryConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(RegistryError::Configuration(_))));
    }
}
