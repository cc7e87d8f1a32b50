use std::sync::Arc;
use std::time::Duration;

use harbor_agent::{keep_registered, registration_effector, HeartbeatConfig, HeartbeatExit, Retry};
use harbor_core::feedback;
use harbor_core::{MemoryRegistry, Registry, RegistryConfig, RegistryError, ServiceDescriptor};
use tokio_util::sync::CancellationToken;

fn effector_for(
    memory: &Arc<MemoryRegistry>,
    sender: Option<feedback::FeedbackSender>,
) -> impl Fn(CancellationToken, ServiceDescriptor, RegistryConfig) -> harbor_agent::RegistrationFuture + use<> {
    let memory = memory.clone();
    registration_effector(
        move |_config: &RegistryConfig| Ok(memory.clone() as Arc<dyn Registry>),
        HeartbeatConfig::default(),
        sender,
    )
}

async fn eventually_addresses(memory: &MemoryRegistry, name: &str) -> Vec<String> {
    for _ in 0..50 {
        if let Ok(addresses) = memory.service_addresses(name).await {
            return addresses;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{name} never became healthy");
}

#[tokio::test(start_paused = true)]
async fn register_discover_deregister() {
    let memory = Arc::new(MemoryRegistry::new());
    let token = CancellationToken::new();
    let service = ServiceDescriptor::from_host_port("orders", "10.0.0.5:9000")
        .unwrap()
        .with_tags(["v2"]);

    let registration = Retry::new(effector_for(&memory, None))
        .run(&token, &service, &RegistryConfig::default())
        .await
        .unwrap();

    assert_eq!(eventually_addresses(&memory, "orders").await, vec!["10.0.0.5:9000"]);

    registration.deregister().await.unwrap();
    assert_eq!(
        memory.service_addresses("orders").await,
        Err(RegistryError::NoAddressesFound("orders".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn registration_rides_out_a_registry_outage() {
    let memory = Arc::new(MemoryRegistry::new());
    memory.set_unavailable(true);
    let (tx, mut rx) = feedback::channel();

    let outage = memory.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        outage.set_unavailable(false);
    });

    let token = CancellationToken::new();
    let service = ServiceDescriptor::new("orders", "10.0.0.5", 9000);
    let started = tokio::time::Instant::now();
    let registration = Retry::new(effector_for(&memory, Some(tx.clone())))
        .feedback(tx)
        .run(&token, &service, &RegistryConfig::default())
        .await
        .unwrap();

    // attempts at 0s, 2s and 6s; the outage ends at 5s
    assert_eq!(started.elapsed(), Duration::from_secs(6));

    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    assert_eq!(records.iter().filter(|record| record.is_error()).count(), 2);
    assert_eq!(records.last().unwrap().message, "retry attempt 3 successful");

    registration.deregister().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_registry_stops_heartbeat_with_single_failure() {
    let memory = Arc::new(MemoryRegistry::new());
    let (tx, mut rx) = feedback::channel();
    let token = CancellationToken::new();

    let mut registration = Retry::new(effector_for(&memory, Some(tx)))
        .run(&token, &ServiceDescriptor::new("orders", "10.0.0.5", 9000), &RegistryConfig::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let reports_before = memory.reports(registration.handle()).await;

    memory.set_unavailable(true);
    let exit = registration.wait_heartbeat().await;
    assert!(matches!(exit, HeartbeatExit::Failed(RegistryError::Registration(_))));

    memory.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(memory.reports(registration.handle()).await, reports_before);

    let failure = rx.recv().await.unwrap();
    assert!(failure.is_error());
    assert!(rx.try_recv().is_err());

    registration.deregister().await.unwrap();
    assert_eq!(memory.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_backoff_returns_cancelled() {
    let memory = Arc::new(MemoryRegistry::new());
    memory.set_unavailable(true);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let result = Retry::new(effector_for(&memory, None))
        .run(&token, &ServiceDescriptor::new("orders", "10.0.0.5", 9000), &RegistryConfig::default())
        .await;
    assert!(matches!(result, Err(RegistryError::Cancelled)));
    assert_eq!(memory.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn lost_heartbeat_is_answered_with_a_fresh_registration() {
    let memory = Arc::new(MemoryRegistry::new());
    let token = CancellationToken::new();
    let service = ServiceDescriptor::new("orders", "10.0.0.5", 9000);

    let retry = Retry::new(effector_for(&memory, None));
    let running = token.clone();
    let task = tokio::spawn(async move {
        keep_registered(&retry, &running, &service, &RegistryConfig::default()).await
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let first = memory.instances().await;
    assert_eq!(first.len(), 1);

    // heartbeat fails at 2s, the first re-registration attempt too; the
    // registry is back at 3s and the second attempt lands at 4s
    memory.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    memory.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = memory.instances().await;
    assert_eq!(second.len(), 1);
    assert_ne!(second[0], first[0]);
    assert!(memory.reports(&second[0]).await > 0);
    assert_eq!(memory.service_addresses("orders").await.unwrap(), vec!["10.0.0.5:9000"]);

    token.cancel();
    assert_eq!(task.await.unwrap(), Ok(()));
    assert_eq!(memory.count().await, 0);
}
