//! Integration Tests for the Whatshare pairing core
//!
//! These tests drive complete handshakes through the pairing service, the
//! relay and the registry, including cancellation and failure paths.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use whatshare_protocol::forward::{open_from_inbound, seal_for_outbound};
use whatshare_protocol::pairing::{PairingConfig, PairingEvent, PairingService, PairingState};
use whatshare_protocol::registry::{
    DeviceRegistry, DeviceSelector, JsonFileStore, MemoryStore, RegistrySnapshot,
};
use whatshare_protocol::relay::{InjectedFailure, MemoryRelay, RetryPolicy};
use whatshare_protocol::{
    DeviceRole, PairedDevice, PairingCode, PairingDescriptor, ProtocolError, RelayClient,
    Result, SharedSecret, ValidationError,
};

/// Relay that parks every call until released
struct GatedRelay {
    inner: MemoryRelay,
    entered: Notify,
    release: Notify,
}

impl GatedRelay {
    fn new(inner: MemoryRelay) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RelayClient for GatedRelay {
    async fn publish(&self, descriptor: &PairingDescriptor) -> Result<PairingCode> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.publish(descriptor).await
    }

    async fn resolve(&self, code: &PairingCode) -> Result<PairingDescriptor> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.resolve(code).await
    }
}

/// Helper to create a service with its own in-memory registry
fn create_service(device_type: &str, relay: Arc<dyn RelayClient>) -> PairingService {
    PairingService::new(
        PairingConfig::new(device_type),
        relay,
        Arc::new(DeviceRegistry::in_memory()),
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(4))
}

fn scenario_secret() -> SharedSecret {
    SharedSecret::from_words(vec![7, 42, 19])
}

fn sample_qr() -> String {
    PairingDescriptor::new("Desktop", SharedSecret::from_words(vec![7, 42, 19]))
        .to_qr_payload()
        .expect("Failed to encode QR payload")
}

/// Helper to reach the naming step of an inbound handshake
async fn scanned_inbound(service: &PairingService) {
    service.start_inbound().await.unwrap();
    service.submit_scan(&sample_qr()).await.unwrap();
}

#[tokio::test]
async fn test_outbound_pairing_scenario() {
    let relay = Arc::new(MemoryRelay::with_codes(["ab12"]));
    let descriptor = PairingDescriptor::new("Pixel", SharedSecret::from_words(vec![7, 42, 19]));

    let code = relay.publish(&descriptor).await.unwrap();
    assert_eq!(code.as_str(), "ab12");
    assert_eq!(relay.resolve(&code).await.unwrap(), descriptor);

    let service = create_service("Desktop", relay.clone());
    let shown = service
        .start_outbound_with(scenario_secret())
        .await
        .unwrap();
    assert_eq!(shown.device_type, "Desktop");

    let resolved = service.submit_code("ab12").await.unwrap();
    assert_eq!(resolved, descriptor);

    let outcome = service
        .submit_name(DeviceRole::Outbound, "kitchen-pc")
        .await
        .unwrap();
    assert!(outcome.code.is_none());

    let outbound = service.registry().list(DeviceRole::Outbound);
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].name, "kitchen-pc");
    assert_eq!(outbound[0].device_type, "Pixel");
    assert_eq!(outbound[0].secret.words(), &[7, 42, 19]);
    assert_eq!(
        service.state(DeviceRole::Outbound).await,
        PairingState::Committed
    );
}

#[tokio::test]
async fn test_two_devices_pair_and_exchange_payloads() {
    let relay: Arc<dyn RelayClient> = Arc::new(MemoryRelay::new());
    let phone = create_service("Pixel", relay.clone());
    let desktop = create_service("Desktop", relay);

    // Desktop shows its descriptor, the phone scans it
    let shown = desktop.start_outbound().await.unwrap();
    phone.start_inbound().await.unwrap();
    phone.submit_scan(&shown.to_qr_payload().unwrap()).await.unwrap();
    let inbound = phone
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap();
    let code = inbound.code.expect("inbound pairing issues a code");

    // The user types the code on the desktop
    let resolved = desktop.submit_code(code.as_str()).await.unwrap();
    assert_eq!(resolved.device_type, "Pixel");
    assert_eq!(resolved.secret, shown.secret);
    desktop
        .submit_name(DeviceRole::Outbound, "my phone")
        .await
        .unwrap();

    let sealed = seal_for_outbound(desktop.registry(), b"https://example.org/a").unwrap();
    let opened = open_from_inbound(phone.registry(), "office", &sealed).unwrap();
    assert_eq!(opened, b"https://example.org/a");
}

#[tokio::test]
async fn test_abort_while_publishing_commits_nothing() {
    let relay = Arc::new(GatedRelay::new(MemoryRelay::new()));
    let service = Arc::new(create_service("Pixel", relay.clone()));
    scanned_inbound(&service).await;

    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.submit_name(DeviceRole::Inbound, "office").await })
    };

    relay.entered.notified().await;
    assert_eq!(
        service.state(DeviceRole::Inbound).await,
        PairingState::PublishingOrResolving
    );
    assert!(service.cancel(DeviceRole::Inbound).await);
    relay.release.notify_one();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::Aborted(_)));
    assert!(service.registry().list(DeviceRole::Inbound).is_empty());
    assert_eq!(
        service.state(DeviceRole::Inbound).await,
        PairingState::Aborted
    );
}

#[tokio::test]
async fn test_superseded_resolve_is_discarded() {
    let inner = MemoryRelay::with_codes(["ab12"]);
    inner
        .publish(&PairingDescriptor::new(
            "Pixel",
            SharedSecret::from_words(vec![1, 2, 3]),
        ))
        .await
        .unwrap();

    let relay = Arc::new(GatedRelay::new(inner));
    let service = Arc::new(create_service("Desktop", relay.clone()));
    service
        .start_outbound_with(SharedSecret::from_words(vec![1, 2, 3]))
        .await
        .unwrap();

    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.submit_code("ab12").await })
    };

    relay.entered.notified().await;
    // Resolving is not an exchange yet; a new start supersedes it
    service.start_outbound().await.unwrap();
    relay.release.notify_one();

    assert!(matches!(
        task.await.unwrap(),
        Err(ProtocolError::Aborted(_))
    ));
    assert_eq!(
        service.state(DeviceRole::Outbound).await,
        PairingState::AwaitingScan
    );
    assert!(service.registry().outbound().is_none());
}

#[tokio::test]
async fn test_second_start_during_exchange_is_rejected() {
    let relay = Arc::new(GatedRelay::new(MemoryRelay::new()));
    let service = Arc::new(create_service("Pixel", relay.clone()));
    scanned_inbound(&service).await;

    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.submit_name(DeviceRole::Inbound, "office").await })
    };
    relay.entered.notified().await;

    let err = service.start_inbound().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::PairingInProgress(DeviceRole::Inbound)
    ));

    // The other role is independent
    service.start_outbound().await.unwrap();

    relay.release.notify_one();
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.device.name, "office");
}

#[tokio::test]
async fn test_empty_name_rejected_before_network() {
    let relay = Arc::new(MemoryRelay::new());
    let service = create_service("Pixel", relay.clone());
    scanned_inbound(&service).await;

    let err = service
        .submit_name(DeviceRole::Inbound, "")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Validation(ValidationError::Empty)
    ));
    assert_eq!(relay.publish_calls(), 0);
    assert_eq!(
        service.state(DeviceRole::Inbound).await,
        PairingState::NamingDevice
    );

    // Re-prompt succeeds
    service
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap();
    assert_eq!(relay.publish_calls(), 1);
}

#[tokio::test]
async fn test_name_in_use_is_reprompted() {
    let existing = PairedDevice::new(
        "Laptop",
        "office",
        DeviceRole::Inbound,
        SharedSecret::from_words(vec![9]),
    );
    let store = MemoryStore::with_snapshot(RegistrySnapshot {
        outbound: None,
        inbound: vec![existing],
    });
    let relay = Arc::new(MemoryRelay::new());
    let service = PairingService::new(
        PairingConfig::new("Pixel"),
        relay.clone(),
        Arc::new(DeviceRegistry::open(store).unwrap()),
    );
    scanned_inbound(&service).await;

    let err = service
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Validation(ValidationError::NameInUse(_))
    ));
    assert_eq!(relay.publish_calls(), 0);

    let inbound = service.registry().list(DeviceRole::Inbound);
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].device_type, "Laptop");
}

#[tokio::test]
async fn test_duplicate_inbound_name_in_registry() {
    let registry = DeviceRegistry::in_memory();
    let device = |secret: u32| {
        PairedDevice::new(
            "Desktop",
            "X",
            DeviceRole::Inbound,
            SharedSecret::from_words(vec![secret]),
        )
    };

    registry.insert_inbound(device(1)).unwrap();
    let err = registry.insert_inbound(device(2)).unwrap_err();

    assert!(matches!(err, ProtocolError::DuplicateName(_)));
    let named_x: Vec<_> = registry
        .list(DeviceRole::Inbound)
        .into_iter()
        .filter(|d| d.name == "X")
        .collect();
    assert_eq!(named_x.len(), 1);
    assert_eq!(named_x[0].secret.words(), &[1]);
}

#[tokio::test]
async fn test_repairing_outbound_replaces_record() {
    let relay = Arc::new(MemoryRelay::new());
    let service = create_service("Desktop", relay.clone());

    for (words, name) in [(vec![1u32], "first"), (vec![2u32], "second")] {
        let secret = SharedSecret::from_words(words);
        let code = relay
            .publish(&PairingDescriptor::new("Pixel", secret.clone()))
            .await
            .unwrap();
        service.start_outbound_with(secret).await.unwrap();
        service.submit_code(code.as_str()).await.unwrap();
        service
            .submit_name(DeviceRole::Outbound, name)
            .await
            .unwrap();
    }

    let outbound = service.registry().list(DeviceRole::Outbound);
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].name, "second");
}

#[tokio::test]
async fn test_failed_save_keeps_previous_outbound() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(DeviceRegistry::open(store.clone()).unwrap());
    registry
        .upsert_outbound(PairedDevice::new(
            "Pixel",
            "first",
            DeviceRole::Outbound,
            SharedSecret::from_words(vec![1]),
        ))
        .unwrap();

    let relay = Arc::new(MemoryRelay::new());
    let code = relay
        .publish(&PairingDescriptor::new(
            "Pixel",
            SharedSecret::from_words(vec![2]),
        ))
        .await
        .unwrap();

    let service = PairingService::new(PairingConfig::new("Desktop"), relay, registry.clone());
    let mut events = service.subscribe();
    service
        .start_outbound_with(SharedSecret::from_words(vec![2]))
        .await
        .unwrap();
    service.submit_code(code.as_str()).await.unwrap();

    store.fail_next_save();
    let err = service
        .submit_name(DeviceRole::Outbound, "second")
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Storage(_)));
    assert_eq!(registry.outbound().unwrap().name, "first");
    assert_eq!(store.stored().outbound.unwrap().name, "first");
    assert_eq!(
        service.state(DeviceRole::Outbound).await,
        PairingState::Aborted
    );

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= event.is_failed();
        assert!(!event.is_paired());
    }
    assert!(failed);
}

#[tokio::test]
async fn test_replayed_code_is_rejected() {
    let relay = Arc::new(MemoryRelay::new());
    let code = relay
        .publish(&PairingDescriptor::new(
            "Pixel",
            SharedSecret::from_words(vec![7, 42, 19]),
        ))
        .await
        .unwrap();
    let service = create_service("Desktop", relay.clone());

    service
        .start_outbound_with(scenario_secret())
        .await
        .unwrap();
    service.submit_code(code.as_str()).await.unwrap();
    service
        .submit_name(DeviceRole::Outbound, "kitchen-pc")
        .await
        .unwrap();

    service
        .start_outbound_with(scenario_secret())
        .await
        .unwrap();
    let err = service.submit_code(code.as_str()).await.unwrap_err();

    assert!(matches!(err, ProtocolError::CodeNotFound(_)));
    assert_eq!(relay.resolve_calls(), 1);
    assert_eq!(
        service.state(DeviceRole::Outbound).await,
        PairingState::Aborted
    );
}

#[tokio::test]
async fn test_unknown_code_aborts() {
    let relay = Arc::new(MemoryRelay::new());
    let service = create_service("Desktop", relay);
    let mut events = service.subscribe();

    service.start_outbound().await.unwrap();
    let err = service.submit_code("zzzz").await.unwrap_err();
    assert!(matches!(err, ProtocolError::CodeNotFound(_)));

    let mut retryable = None;
    while let Ok(event) = events.try_recv() {
        if let PairingEvent::Failed { retryable: r, .. } = event {
            retryable = Some(r);
        }
    }
    assert_eq!(retryable, Some(false));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let relay = Arc::new(MemoryRelay::with_codes(["ab12"]).with_retry(fast_retry()));
    let service = create_service("Pixel", relay.clone());
    scanned_inbound(&service).await;

    relay.fail_next(InjectedFailure::Transient);
    relay.fail_next(InjectedFailure::Transient);

    let outcome = service
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap();
    assert_eq!(outcome.code.unwrap().as_str(), "ab12");
    assert_eq!(relay.publish_calls(), 3);
}

#[tokio::test]
async fn test_unavailable_relay_aborts_as_retryable() {
    let relay = Arc::new(MemoryRelay::with_codes(["ab12"]));
    let service = create_service("Desktop", relay.clone());
    let mut events = service.subscribe();

    relay.fail_next(InjectedFailure::Transient);
    service.start_outbound().await.unwrap();
    let err = service.submit_code("ab12").await.unwrap_err();
    assert!(matches!(err, ProtocolError::RelayUnavailable(_)));

    let mut retryable = None;
    while let Ok(event) = events.try_recv() {
        if let PairingEvent::Failed { retryable: r, .. } = event {
            retryable = Some(r);
        }
    }
    assert_eq!(retryable, Some(true));

    // A code that never resolved is not consumed
    relay
        .publish(&PairingDescriptor::new(
            "Pixel",
            SharedSecret::from_words(vec![3]),
        ))
        .await
        .unwrap();
    service
        .start_outbound_with(SharedSecret::from_words(vec![3]))
        .await
        .unwrap();
    let resolved = service.submit_code("ab12").await.unwrap();
    assert_eq!(resolved.secret.words(), &[3]);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let relay = Arc::new(MemoryRelay::new().with_retry(fast_retry()));
    let service = create_service("Pixel", relay.clone());
    scanned_inbound(&service).await;

    relay.fail_next(InjectedFailure::Permanent);
    let err = service
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Relay(_)));
    assert_eq!(relay.publish_calls(), 1);
    assert!(service.registry().list(DeviceRole::Inbound).is_empty());
}

#[tokio::test]
async fn test_inbound_events_in_order() {
    let relay = Arc::new(MemoryRelay::with_codes(["ab12"]));
    let service = create_service("Pixel", relay);
    let mut events = service.subscribe();

    scanned_inbound(&service).await;
    service
        .submit_name(DeviceRole::Inbound, "office")
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    let code_at = seen
        .iter()
        .position(|e| matches!(e, PairingEvent::CodeIssued { code, .. } if code.as_str() == "ab12"))
        .expect("code issued");
    let paired_at = seen.iter().position(|e| e.is_paired()).expect("paired");
    assert!(code_at < paired_at);
    assert!(seen.iter().all(|e| e.role() == DeviceRole::Inbound));
}

#[tokio::test]
async fn test_foreign_code_fails_authentication() {
    let relay = Arc::new(MemoryRelay::new());
    let service = create_service("Desktop", relay.clone());
    let mut events = service.subscribe();

    let shown = service.start_outbound().await.unwrap();

    // Someone else's descriptor, published under a code the user was given
    let foreign = SharedSecret::generate().unwrap();
    assert!(!foreign.matches(&shown.secret));
    let code = relay
        .publish(&PairingDescriptor::new("Evil", foreign))
        .await
        .unwrap();

    let err = service.submit_code(code.as_str()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Authentication));
    assert_eq!(
        service.state(DeviceRole::Outbound).await,
        PairingState::Aborted
    );

    let err = service
        .submit_name(DeviceRole::Outbound, "desk")
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidState { .. }));
    assert!(service.registry().outbound().is_none());

    let mut retryable = None;
    while let Ok(event) = events.try_recv() {
        assert!(!event.is_paired());
        if let PairingEvent::Failed { retryable: r, .. } = event {
            retryable = Some(r);
        }
    }
    assert_eq!(retryable, Some(false));
}

#[tokio::test]
async fn test_name_taken_during_publish_is_reprompted() {
    let relay = Arc::new(GatedRelay::new(MemoryRelay::with_codes(["ab12"])));
    let service = Arc::new(create_service("Pixel", relay.clone()));
    let mut events = service.subscribe();
    scanned_inbound(&service).await;

    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.submit_name(DeviceRole::Inbound, "office").await })
    };

    // Another writer claims the name while the relay holds the publish
    relay.entered.notified().await;
    service
        .registry()
        .insert_inbound(PairedDevice::new(
            "Laptop",
            "office",
            DeviceRole::Inbound,
            SharedSecret::from_words(vec![9]),
        ))
        .unwrap();
    relay.release.notify_one();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Validation(ValidationError::NameInUse(ref name)) if name == "office"
    ));
    assert_eq!(
        service.state(DeviceRole::Inbound).await,
        PairingState::NamingDevice
    );

    // The issued code is kept; the relay is not called again
    let outcome = service
        .submit_name(DeviceRole::Inbound, "office-2")
        .await
        .unwrap();
    assert_eq!(outcome.code.unwrap().as_str(), "ab12");
    assert_eq!(outcome.device.device_type, "Desktop");
    assert_eq!(relay.inner.publish_calls(), 1);

    let laptop = service.registry().inbound("office").unwrap();
    assert_eq!(laptop.device_type, "Laptop");
    assert!(service.registry().is_paired(DeviceRole::Inbound, "office-2"));

    let mut name_in_use = false;
    while let Ok(event) = events.try_recv() {
        assert!(!event.is_failed());
        if let PairingEvent::ValidationFailed { error, .. } = event {
            name_in_use |= error == ValidationError::NameInUse("office".to_string());
        }
    }
    assert!(name_in_use);
}

#[tokio::test]
async fn test_registry_survives_reload() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("devices.json");

    {
        let registry = Arc::new(DeviceRegistry::open(JsonFileStore::new(&path)).unwrap());
        let service = PairingService::new(
            PairingConfig::new("Pixel"),
            Arc::new(MemoryRelay::new()),
            registry,
        );
        scanned_inbound(&service).await;
        service
            .submit_name(DeviceRole::Inbound, "office")
            .await
            .unwrap();
    }

    let registry = DeviceRegistry::open(JsonFileStore::new(&path)).unwrap();
    let device = registry.inbound("office").expect("reloaded");
    assert_eq!(device.device_type, "Desktop");
    assert_eq!(device.secret.words(), &[7, 42, 19]);

    registry
        .remove(&DeviceSelector::Inbound("office".into()))
        .unwrap();
    let registry = DeviceRegistry::open(JsonFileStore::new(&path)).unwrap();
    assert!(registry.list(DeviceRole::Inbound).is_empty());
}
