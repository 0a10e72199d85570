use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use dog_mail::{EmailProvider, HttpEmailConfig, HttpEmailProvider, MailError, Notification};
use serde_json::Value;
use tokio::sync::Mutex;

/// Fake provider API: answers with a fixed status and records what it received
#[derive(Clone)]
struct FakeApi {
    status: StatusCode,
    received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn mail_send(State(api): State<FakeApi>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    api.received.lock().await.push((auth, body));

    let mut response_headers = HeaderMap::new();
    if api.status.is_success() {
        response_headers.insert("x-message-id", "msg-123".parse().unwrap());
    }
    (api.status, response_headers, format!("status {}", api.status.as_u16()))
}

async fn start_fake_api(status: StatusCode) -> (String, FakeApi) {
    let api = FakeApi {
        status,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v3/mail/send", post(mail_send))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/v3", addr), api)
}

fn provider(api_url: &str) -> HttpEmailProvider {
    let config = HttpEmailConfig::new("test-key", "noreply@example.com")
        .with_from_name("Example")
        .with_api_url(api_url);
    HttpEmailProvider::new(config).unwrap()
}

fn welcome() -> Notification {
    Notification::new("ada@example.com", "Welcome, Ada!", "Glad to have you.")
        .with_to_name("Ada")
        .with_reply_to("support@example.com")
}

#[tokio::test]
async fn accepted_send_returns_message_id() {
    let (url, api) = start_fake_api(StatusCode::ACCEPTED).await;

    let sent = provider(&url).send(&welcome()).await.unwrap();
    assert_eq!(sent.message_id.as_deref(), Some("msg-123"));

    let received = api.received.lock().await;
    assert_eq!(received.len(), 1);
    let (auth, body) = &received[0];
    assert_eq!(auth.as_deref(), Some("Bearer test-key"));
    assert_eq!(body["personalizations"][0]["to"][0]["email"], "ada@example.com");
    assert_eq!(body["from"]["name"], "Example");
    assert_eq!(body["reply_to"]["email"], "support@example.com");
    assert_eq!(body["subject"], "Welcome, Ada!");
    assert_eq!(body["content"][0]["type"], "text/plain");
    assert_eq!(body["content"][0]["value"], "Glad to have you.");
}

#[tokio::test]
async fn throttling_and_outages_are_retryable() {
    for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::INTERNAL_SERVER_ERROR, StatusCode::SERVICE_UNAVAILABLE] {
        let (url, _api) = start_fake_api(status).await;

        let err = provider(&url).send(&welcome()).await.unwrap_err();
        assert_eq!(err.status(), Some(status.as_u16()));
        assert!(err.is_retryable(), "{} should be retryable", status);
    }
}

#[tokio::test]
async fn client_errors_are_permanent() {
    for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED] {
        let (url, _api) = start_fake_api(status).await;

        let err = provider(&url).send(&welcome()).await.unwrap_err();
        assert!(matches!(err, MailError::Http { .. }));
        assert!(!err.is_retryable(), "{} should be permanent", status);
    }
}

#[tokio::test]
async fn invalid_recipient_makes_no_request() {
    let (url, api) = start_fake_api(StatusCode::ACCEPTED).await;

    let err = provider(&url)
        .send(&Notification::new("not-an-email", "Welcome", "Hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, MailError::InvalidRecipient(_)));
    assert!(api.received.lock().await.is_empty());
}

#[tokio::test]
async fn unreachable_provider_is_retryable() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = provider(&format!("http://{}/v3", addr))
        .send(&welcome())
        .await
        .unwrap_err();

    assert!(err.is_retryable(), "unexpected error: {:?}", err);
}
