//! Integration tests for the pipe client
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

use triage_plane::config::{LlmConfig, RequestConfig};
use triage_plane::error::LlmError;
use triage_plane::llm::{LlmOracle, Message, PipeClient, PipeRequest};

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str, api_key: Option<&str>, max_retries: u32) -> PipeClient {
    let config = LlmConfig {
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
        pipe: "cluster-triage-v1".to_string(),
    };

    let request_config = RequestConfig {
        timeout_ms: 5000,
        max_retries,
        retry_delay_ms: 10,
    };

    PipeClient::new(&config, request_config).expect("Failed to create client")
}

fn create_test_request(content: &str) -> PipeRequest {
    PipeRequest::new("cluster-triage-v1", vec![Message::user(content)])
}

fn completion(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "completion": text,
        "threadId": "thread-123"
    }))
}

struct NoAuthorization;

impl wiremock::Match for NoAuthorization {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("authorization")
    }
}

#[tokio::test]
async fn test_successful_pipe_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(header("Authorization", "Bearer test-api-key"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "completion": "TOOL: RUN_KUBECTL get pods -A",
            "threadId": "thread-123",
            "raw": {
                "model": "gpt-4o-mini",
                "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("test-api-key"), 0);
    let response = client
        .call_pipe(create_test_request("why is api down"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.completion, "TOOL: RUN_KUBECTL get pods -A");
}

#[tokio::test]
async fn test_no_authorization_without_api_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(NoAuthorization)
        .respond_with(completion("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), None, 0);
    assert!(client.call_pipe(create_test_request("hi")).await.is_ok());
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream overloaded"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .respond_with(completion("recovered"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("k"), 3);
    let response = client.call_pipe(create_test_request("q")).await.unwrap();
    assert_eq!(response.completion, "recovered");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("wrong"), 3);
    let err = client.call_pipe(create_test_request("q")).await.unwrap_err();

    match err {
        LlmError::Api { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "bad key");
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exhausted_retries_report_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("k"), 1);
    let err = client.call_pipe(create_test_request("q")).await.unwrap_err();

    match err {
        LlmError::Unavailable { message, retries } => {
            assert_eq!(retries, 2);
            assert!(message.contains("503"), "{message}");
        }
        other => panic!("expected unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsuccessful_body_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": false, "completion": ""})),
        )
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("k"), 0);
    let err = client.call_pipe(create_test_request("q")).await.unwrap_err();
    assert!(err.to_string().contains("success=false"), "{err}");
}

#[tokio::test]
async fn test_oracle_complete_sends_configured_pipe() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(body_partial_json(json!({
            "name": "cluster-triage-v1",
            "stream": false,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "why is dns failing"}
            ]
        })))
        .respond_with(completion("Root Cause: coredns OOM\nConfidence: HIGH"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server.uri(), Some("k"), 0);
    let text = client
        .complete(&[Message::system("be brief"), Message::user("why is dns failing")])
        .await
        .unwrap();
    assert_eq!(text, "Root Cause: coredns OOM\nConfidence: HIGH");
}
