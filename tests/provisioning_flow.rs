//! Provisioning state-machine tests against a scripted transport

use std::time::Duration;
use tracksim::provisioning::{
    ProvisioningClient, ProvisioningConfig, ProvisioningError, ProvisioningState,
};
use tracksim::testing::mocks::MockTransport;
use tracksim::transport::{QosLevel, TlsIdentity, Transport};

fn tls_identity() -> TlsIdentity {
    // The mock transport never opens these
    TlsIdentity {
        cert_path: "/certs/device.chain.pem".into(),
        key_path: "/certs/device.key.pem".into(),
        ca_path: "/certs/ca.pem".into(),
        verify_server: true,
    }
}

fn client() -> (ProvisioningClient<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let handle = transport.clone();
    let config = ProvisioningConfig::new("0ne00FBC8CA", "123456789101112", tls_identity());
    (ProvisioningClient::new(transport, config), handle)
}

#[tokio::test(start_paused = true)]
async fn happy_path_yields_assignment_exactly_once() {
    let (mut client, handle) = client();

    client.start().await.unwrap();
    assert_eq!(client.state(), ProvisioningState::Registering);

    // Registration went out on the expected topic at QoS 1
    assert_eq!(
        handle.subscriptions(),
        vec![("$dps/registrations/res/#".to_string(), QosLevel::AtLeastOnce)]
    );
    let register = &handle.published()[0];
    assert_eq!(register.topic, "$dps/registrations/PUT/iotdps-register/?$rid=1");
    assert_eq!(
        register.payload_str(),
        r#"{"registrationId":"123456789101112"}"#
    );
    assert_eq!(register.qos, QosLevel::AtLeastOnce);

    // Service answers 202 assigning
    handle.inject(
        "$dps/registrations/res/202/?$rid=1",
        br#"{"status":"assigning","operationId":"op-1"}"#.to_vec(),
    );
    assert!(client.process_events().await.is_none());
    assert_eq!(client.state(), ProvisioningState::Polling);

    // A status poll goes out after the two-second cadence
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(client.process_events().await.is_none());
    let polls: Vec<_> = handle
        .published()
        .into_iter()
        .filter(|m| m.topic.contains("iotdps-get-operationstatus"))
        .collect();
    assert_eq!(polls.len(), 1);
    assert_eq!(
        polls[0].topic,
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId=op-1"
    );
    assert!(polls[0].payload.is_empty());

    // Poll response: assigned
    handle.inject(
        "$dps/registrations/res/200/?$rid=2",
        br#"{"status":"assigned","assignedHub":"hub.example.net","deviceId":"123456789101112"}"#
            .to_vec(),
    );
    let assignment = client.process_events().await.unwrap().unwrap();
    assert_eq!(assignment.assigned_hub, "hub.example.net");
    assert_eq!(assignment.device_id, "123456789101112");
    assert_eq!(client.state(), ProvisioningState::Completed);

    // Transport is released and the outcome is not delivered again
    assert!(!handle.is_connected());
    assert!(client.process_events().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn immediate_assignment_skips_polling() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    handle.inject(
        "$dps/registrations/res/200/?$rid=1",
        br#"{"status":"assigned","assignedHub":"hub-a.example.net","deviceId":"d1"}"#.to_vec(),
    );

    let assignment = client.process_events().await.unwrap().unwrap();
    assert_eq!(assignment.assigned_hub, "hub-a.example.net");
}

#[tokio::test(start_paused = true)]
async fn registration_is_never_retried() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    // No responses for a while; only the one registration publish exists
    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(client.process_events().await.is_none());
    }

    let registrations = handle
        .published()
        .iter()
        .filter(|m| m.topic.contains("iotdps-register"))
        .count();
    assert_eq!(registrations, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_times_out() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    tokio::time::advance(Duration::from_secs(121)).await;
    let outcome = client.process_events().await.unwrap();
    assert!(matches!(outcome, Err(ProvisioningError::Timeout(_))));
    assert_eq!(client.state(), ProvisioningState::Failed);
    assert!(!handle.is_connected());
}

#[tokio::test(start_paused = true)]
async fn refused_status_carries_the_status_string() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    handle.inject(
        "$dps/registrations/res/401/?$rid=1",
        br#"{"status":"failed","errorCode":401002}"#.to_vec(),
    );

    let outcome = client.process_events().await.unwrap();
    match outcome {
        Err(ProvisioningError::Refused { status }) => assert_eq!(status, "failed"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn assignment_without_hub_is_rejected() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    handle.inject(
        "$dps/registrations/res/200/?$rid=1",
        br#"{"status":"assigned","deviceId":"d1"}"#.to_vec(),
    );

    let outcome = client.process_events().await.unwrap();
    assert!(matches!(outcome, Err(ProvisioningError::MissingAssignment)));
}

#[tokio::test(start_paused = true)]
async fn cancel_disconnects_and_fails() {
    let (mut client, handle) = client();
    client.start().await.unwrap();

    client.cancel().await;
    assert_eq!(client.state(), ProvisioningState::Failed);
    assert!(!handle.is_connected());

    let outcome = client.process_events().await.unwrap();
    assert!(matches!(outcome, Err(ProvisioningError::Canceled)));
}

#[tokio::test(start_paused = true)]
async fn connect_failure_fails_the_run() {
    let transport = MockTransport::new();
    transport.fail_connects(true);
    let config = ProvisioningConfig::new("0ne00FBC8CA", "123456789101112", tls_identity());
    let mut client = ProvisioningClient::new(transport, config);

    assert!(client.start().await.is_err());
    assert_eq!(client.state(), ProvisioningState::Failed);
}
