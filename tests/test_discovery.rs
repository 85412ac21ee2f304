//! Discovery client integration tests against a mock HTTP server
//!
//! Covers the retry policy: transient failures (unparseable or empty
//! bodies, HTTP errors) are retried up to the configured attempt count,
//! server-side rejections end the process immediately.

use iotc_session::discovery::protocol::SyncOutcome;
use iotc_session::discovery::{DiscoveryClient, DiscoveryError};
use url::Url;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENV: &str = "avnetpoc";
const CPID: &str = "TESTCPID";
const DUID: &str = "test-device-01";

fn discovery_stage_path() -> String {
    format!("/api/sdk/cpid/{CPID}/lang/M_C/ver/2.0/env/{ENV}")
}

fn agent_body(server_uri: &str) -> String {
    format!(r#"{{"d":{{"bu":"{server_uri}/api/2.0/agent/"}}}}"#)
}

fn sync_ok_body() -> &'static str {
    r#"{"d":{"ec":0,"ct":200,"dtg":"dtg-77","p":{
        "h":"broker.example.com",
        "id":"TESTCPID-test-device-01",
        "un":"broker.example.com/TESTCPID-test-device-01",
        "pwd":"",
        "pub":"devices/TESTCPID-test-device-01/messages/events/",
        "sub":"devices/TESTCPID-test-device-01/messages/devicebound/#"}}}"#
}

async fn mount_agent_stage(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(discovery_stage_path()))
        .respond_with(ResponseTemplate::new(200).set_body_string(agent_body(&server.uri())))
        .mount(server)
        .await;
}

fn client_for(server: &MockServer) -> DiscoveryClient {
    DiscoveryClient::with_base_url(Url::parse(&server.uri()).unwrap()).unwrap()
}

#[tokio::test]
async fn test_successful_discovery_carries_all_broker_fields() {
    let server = MockServer::start().await;
    mount_agent_stage(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .and(body_json(serde_json::json!({
            "cpId": CPID,
            "uniqueId": DUID,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(sync_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = client_for(&server)
        .discover(ENV, CPID, DUID, 3)
        .await
        .unwrap();

    assert_eq!(descriptor.host, "broker.example.com");
    assert_eq!(descriptor.client_id, "TESTCPID-test-device-01");
    assert_eq!(
        descriptor.user_name,
        "broker.example.com/TESTCPID-test-device-01"
    );
    assert_eq!(descriptor.password, "");
    assert_eq!(
        descriptor.pub_topic,
        "devices/TESTCPID-test-device-01/messages/events/"
    );
    assert_eq!(
        descriptor.sub_topic,
        "devices/TESTCPID-test-device-01/messages/devicebound/#"
    );
    assert_eq!(descriptor.data_transfer_group, "dtg-77");
}

#[tokio::test]
async fn test_transient_parse_failures_are_retried() {
    let server = MockServer::start().await;
    mount_agent_stage(&server).await;

    // two truncated responses, then a good one
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"d":{"ec"#))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sync_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = client_for(&server)
        .discover(ENV, CPID, DUID, 3)
        .await
        .unwrap();
    assert_eq!(descriptor.host, "broker.example.com");
}

#[tokio::test]
async fn test_retries_stop_at_the_configured_attempt_count() {
    let server = MockServer::start().await;
    mount_agent_stage(&server).await;

    // expect(3) makes the server verify that no fourth attempt is made
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .discover(ENV, CPID, DUID, 3)
        .await
        .unwrap_err();

    match err {
        DiscoveryError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, DiscoveryError::Parse(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_body_is_a_transient_failure() {
    let server = MockServer::start().await;
    mount_agent_stage(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sync_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    let result = client_for(&server).discover(ENV, CPID, DUID, 2).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_server_rejection_is_terminal() {
    let server = MockServer::start().await;
    mount_agent_stage(&server).await;

    // the device exists but was disabled; retrying cannot change that
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"d":{"ec":4,"ct":200}}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .discover(ENV, CPID, DUID, 3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::Rejected(SyncOutcome::DeviceInactive)
    ));
}

#[tokio::test]
async fn test_http_error_in_stage_one_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(discovery_stage_path()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(discovery_stage_path()))
        .respond_with(ResponseTemplate::new(200).set_body_string(agent_body(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sync_ok_body()))
        .mount(&server)
        .await;

    let result = client_for(&server).discover(ENV, CPID, DUID, 2).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_junk_before_stage_one_json_is_tolerated() {
    let server = MockServer::start().await;

    // some gateways prepend chunk framing noise to the body
    let noisy = format!("2f\r\n{}", agent_body(&server.uri()));
    Mock::given(method("GET"))
        .and(path(discovery_stage_path()))
        .respond_with(ResponseTemplate::new(200).set_body_string(noisy))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/2.0/agent/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sync_ok_body()))
        .mount(&server)
        .await;

    let result = client_for(&server).discover(ENV, CPID, DUID, 1).await;
    assert!(result.is_ok());
}
