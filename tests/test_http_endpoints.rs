//! Integration tests for the registration and action-reply endpoints
//!
//! Tests behavioral contracts against a mock HTTP server:
//! - request shape (method, path, headers, body)
//! - credential decoding
//! - error classification (network, protocol, rejected)

use hubsession::credentials::{ConfigProvider, FetchError, HttpConfigProvider};
use hubsession::identity::DeviceIdentity;
use hubsession::reply::{ReplyClient, ReplyError};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn identity(base_url: &str) -> DeviceIdentity {
    DeviceIdentity::new("device-1", base_url, "42").unwrap()
}

fn provider() -> HttpConfigProvider {
    HttpConfigProvider::new("test-api-key", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_registration_returns_credential() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .and(header("tenantID", "42"))
        .and(header("apiKey", "test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "iot_host": "hub.example.net",
            "sas_token": "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdevice-1&sig=x&se=1",
            "expiry": 3600.0
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let credential = provider()
        .fetch(&identity(&mock_server.uri()))
        .await
        .unwrap();

    assert_eq!(credential.broker_host, "hub.example.net");
    assert!(credential.auth_token.starts_with("SharedAccessSignature"));
    assert_eq!(credential.expiry_seconds, 3600.0);
}

#[tokio::test]
async fn test_registration_tolerates_trailing_slash_in_base_url() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "iot_host": "hub.example.net",
            "sas_token": "token",
            "expiry": 60
        })))
        .mount(&mock_server)
        .await;

    let base = format!("{}/", mock_server.uri());
    let credential = provider().fetch(&identity(&base)).await.unwrap();
    assert_eq!(credential.expiry_seconds, 60.0);
}

#[tokio::test]
async fn test_registration_rejected_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&mock_server)
        .await;

    let result = provider().fetch(&identity(&mock_server.uri())).await;
    assert!(matches!(result, Err(FetchError::Rejected { status: 401 })));
}

#[tokio::test]
async fn test_registration_malformed_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let result = provider().fetch(&identity(&mock_server.uri())).await;
    assert!(matches!(result, Err(FetchError::Protocol(_))));
}

#[tokio::test]
async fn test_registration_missing_token_is_protocol_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "iot_host": "hub.example.net",
            "expiry": 3600
        })))
        .mount(&mock_server)
        .await;

    let result = provider().fetch(&identity(&mock_server.uri())).await;
    assert!(matches!(result, Err(FetchError::Protocol(_))));
}

#[tokio::test]
async fn test_registration_unreachable_is_network_error() {
    // Reserve a local port, then release it so nothing is listening there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let result = provider().fetch(&identity(&uri)).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
}

#[tokio::test]
async fn test_registration_timeout_is_network_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/watch/registration/device-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_string("{}"),
        )
        .mount(&mock_server)
        .await;

    let provider = HttpConfigProvider::new("test-api-key", Duration::from_millis(200)).unwrap();
    let result = provider.fetch(&identity(&mock_server.uri())).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
}

#[tokio::test]
async fn test_reply_posts_pressed_label() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/scratch/reply/7"))
        .and(header("tenantID", "42"))
        .and(body_json(serde_json::json!({ "pressed": "Snooze" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ReplyClient::new(identity(&mock_server.uri()), Duration::from_secs(5)).unwrap();
    client.send(7, "Snooze").await.unwrap();
}

#[tokio::test]
async fn test_reply_rejected_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/scratch/reply/7"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let client = ReplyClient::new(identity(&mock_server.uri()), Duration::from_secs(5)).unwrap();
    let result = client.send(7, "Ack").await;
    assert!(matches!(result, Err(ReplyError::Rejected { status: 500 })));
}
