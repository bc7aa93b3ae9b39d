//! Connection-manager flow: provisioning handoff, topic prefixing and the
//! reconnect policy

use std::time::Duration;
use tracksim::connection::{
    ConnectError, ConnectionManager, ConnectionSettings, ManagerState, MAX_RECONNECT_ATTEMPTS,
};
use tracksim::testing::mocks::MockTransportFactory;
use tracksim::transport::{QosLevel, TlsIdentity, Transport};

fn provisioned_settings(dir: &tempfile::TempDir) -> ConnectionSettings {
    let device_dir = dir.path().join("123456789101112");
    std::fs::create_dir_all(&device_dir).unwrap();
    let chain = device_dir.join("device.chain.pem");
    let key = device_dir.join("device.key.pem");
    let ca = dir.path().join("ca.pem");
    for path in [&chain, &key, &ca] {
        std::fs::write(path, "-----BEGIN CERTIFICATE-----").unwrap();
    }

    ConnectionSettings::Provisioned {
        imei: "123456789101112".to_string(),
        id_scope: "0ne00FBC8CA".to_string(),
        tls: TlsIdentity {
            cert_path: chain,
            key_path: key,
            ca_path: ca,
            verify_server: true,
        },
        timeout: Duration::from_secs(120),
    }
}

async fn drive_to_connected(
    manager: &mut ConnectionManager<MockTransportFactory>,
    factory: &MockTransportFactory,
) {
    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Provisioning);

    let provisioning = &factory.created()[0];
    provisioning.inject(
        "$dps/registrations/res/202/?$rid=1",
        br#"{"status":"assigning","operationId":"op-9"}"#.to_vec(),
    );
    provisioning.inject(
        "$dps/registrations/res/200/?$rid=2",
        br#"{"status":"assigned","assignedHub":"hub.example.net","deviceId":"123456789101112"}"#
            .to_vec(),
    );

    manager.process_events().await;
    assert_eq!(manager.state(), ManagerState::Connected);
}

#[tokio::test(start_paused = true)]
async fn provisioning_handoff_opens_hub_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));

    drive_to_connected(&mut manager, &factory).await;

    // Two transports: provisioning (now closed) and the hub session
    assert_eq!(factory.created_count(), 2);
    let provisioning = &factory.created()[0];
    let hub = &factory.created()[1];
    assert!(!provisioning.is_connected());
    assert!(hub.is_connected());

    // Hub endpoint parameters
    let endpoint = &hub.endpoints()[0];
    assert_eq!(endpoint.host, "hub.example.net");
    assert_eq!(endpoint.port, 8883);
    assert_eq!(endpoint.client_id, "123456789101112");
    assert_eq!(
        endpoint.username(),
        "hub.example.net/123456789101112/?api-version=2021-04-12"
    );

    // Command subscription is active at QoS 1
    assert_eq!(
        hub.subscriptions(),
        vec![(
            "devices/123456789101112/messages/devicebound/#".to_string(),
            QosLevel::AtLeastOnce
        )]
    );

    let assignment = manager.assignment().unwrap();
    assert_eq!(assignment.assigned_hub, "hub.example.net");
    assert_eq!(assignment.device_id, "123456789101112");
}

#[tokio::test(start_paused = true)]
async fn relative_topics_are_prefixed_absolute_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));
    drive_to_connected(&mut manager, &factory).await;
    let hub = &factory.created()[1];

    manager
        .publish("", b"{}".to_vec(), QosLevel::AtLeastOnce, false)
        .await
        .unwrap();
    manager
        .publish(
            "devices/123456789101112/messages/events/custom",
            b"{}".to_vec(),
            QosLevel::AtLeastOnce,
            false,
        )
        .await
        .unwrap();

    let topics: Vec<String> = hub.published().iter().map(|m| m.topic.clone()).collect();
    assert_eq!(
        topics,
        vec![
            "devices/123456789101112/messages/events/".to_string(),
            "devices/123456789101112/messages/events/custom".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn provisioning_refusal_fails_terminally_before_first_connect() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));

    manager.connect().await.unwrap();
    factory.created()[0].inject(
        "$dps/registrations/res/401/?$rid=1",
        br#"{"status":"failed"}"#.to_vec(),
    );
    manager.process_events().await;

    assert_eq!(manager.state(), ManagerState::Failed);
    assert!(matches!(
        manager.failure(),
        Some(ConnectError::Provisioning(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn missing_certificates_fail_connect() {
    let factory = MockTransportFactory::new();
    let settings = ConnectionSettings::Provisioned {
        imei: "123456789101112".to_string(),
        id_scope: "0ne00FBC8CA".to_string(),
        tls: TlsIdentity {
            cert_path: "/nonexistent/device.chain.pem".into(),
            key_path: "/nonexistent/device.key.pem".into(),
            ca_path: "/nonexistent/ca.pem".into(),
            verify_server: true,
        },
        timeout: Duration::from_secs(120),
    };
    let mut manager = ConnectionManager::new(factory, settings);

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)));
    assert_eq!(manager.state(), ManagerState::Failed);
}

#[tokio::test(start_paused = true)]
async fn legacy_path_connects_directly_with_token() {
    let factory = MockTransportFactory::new();
    let settings = ConnectionSettings::Legacy {
        host: "hub.example.net".to_string(),
        device_id: "dev-7".to_string(),
        device_key_base64: "dGVzdGtleQ==".to_string(),
    };
    let mut manager = ConnectionManager::new(factory.clone(), settings);

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Connected);

    // One transport, straight to the hub, SAS token as password
    assert_eq!(factory.created_count(), 1);
    let endpoint = &factory.created()[0].endpoints()[0];
    assert_eq!(endpoint.host, "hub.example.net");
    assert_eq!(
        endpoint.username(),
        "hub.example.net/dev-7/?api-version=2021-04-12"
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_are_capped() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));
    drive_to_connected(&mut manager, &factory).await;
    let baseline = factory.created_count();

    // Lose the hub session and make every future connect fail
    factory.fail_all_connects(true);
    factory.created()[1].drop_connection();
    manager.process_events().await;
    assert_eq!(manager.state(), ManagerState::Disconnected);

    // Backoff gating: nothing happens before the first two-second delay
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.process_events().await;
    assert_eq!(factory.created_count(), baseline);

    tokio::time::advance(Duration::from_secs(1)).await;
    manager.process_events().await;
    assert_eq!(factory.created_count(), baseline + 1, "first attempt at ~2s");

    // Let the remaining attempts run their course
    let mut guard = 0;
    while manager.state() != ManagerState::Failed {
        tokio::time::advance(Duration::from_secs(70)).await;
        manager.process_events().await;
        guard += 1;
        assert!(guard < 30, "manager never reached terminal failure");
    }

    // Exactly the budgeted number of attempts were made
    assert_eq!(
        factory.created_count(),
        baseline + MAX_RECONNECT_ATTEMPTS as usize
    );
    assert!(matches!(
        manager.failure(),
        Some(ConnectError::PolicyExhausted {
            attempts: MAX_RECONNECT_ATTEMPTS
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn reconnect_succeeds_when_service_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));
    drive_to_connected(&mut manager, &factory).await;

    factory.created()[1].drop_connection();
    manager.process_events().await;
    assert_eq!(manager.state(), ManagerState::Disconnected);

    tokio::time::advance(Duration::from_secs(2)).await;
    manager.process_events().await;
    assert_eq!(manager.state(), ManagerState::Provisioning);

    // Service answers again; the manager lands back on the hub
    factory.created()[2].inject(
        "$dps/registrations/res/200/?$rid=1",
        br#"{"status":"assigned","assignedHub":"hub.example.net","deviceId":"123456789101112"}"#
            .to_vec(),
    );
    manager.process_events().await;
    assert_eq!(manager.state(), ManagerState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_total_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockTransportFactory::new();
    let mut manager = ConnectionManager::new(factory.clone(), provisioned_settings(&dir));
    drive_to_connected(&mut manager, &factory).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ManagerState::Disconnected);
    assert!(!factory.created()[1].is_connected());
    assert!(manager.assignment().is_none());

    // Second disconnect is a no-op
    manager.disconnect().await;
    assert_eq!(manager.state(), ManagerState::Disconnected);
}
