//! Tests for the request observer middleware.

use super::*;
use async_trait::async_trait;
use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use tower::ServiceExt;
use vm_history_core::{
    Event, EventFilter, EventStatus, EventStoreError, InMemoryEventStore, MaskingConfig,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Store whose every call fails as if the backend were offline
struct OfflineStore;

#[async_trait]
impl EventStore for OfflineStore {
    async fn create(&self, _new_event: NewEvent) -> Result<Event, EventStoreError> {
        Err(offline())
    }

    async fn update(&self, _event_id: EventId, _update: EventUpdate) -> Result<Event, EventStoreError> {
        Err(offline())
    }

    async fn get(&self, _event_id: EventId) -> Result<Event, EventStoreError> {
        Err(offline())
    }

    async fn list(&self, _filter: &EventFilter) -> Result<Vec<Event>, EventStoreError> {
        Err(offline())
    }

    async fn count(&self, _filter: &EventFilter) -> Result<usize, EventStoreError> {
        Err(offline())
    }
}

fn offline() -> EventStoreError {
    EventStoreError::Unavailable {
        message: "backend offline".to_string(),
    }
}

fn observer_over(store: Arc<dyn EventStore>) -> RequestObserver {
    RequestObserver::new(
        store,
        Arc::new(SensitiveDataMasker::new(&MaskingConfig::default())),
        ObserverConfig::default(),
    )
}

fn observed_app(observer: RequestObserver) -> Router {
    Router::new()
        .route(
            "/api/vms",
            post(|Json(body): Json<Value>| async move {
                (StatusCode::CREATED, Json(json!({ "name": body["name"] })))
            }),
        )
        .route(
            "/api/vms/{vm_id}/start",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .route("/health", get(|| async { "ok" }))
        .route("/api/history", get(|| async { "[]" }))
        .layer(middleware::from_fn_with_state(
            observer,
            request_observer_middleware,
        ))
}

/// Wait for the spawned write to land and return the single terminal event
async fn wait_for_event(store: &InMemoryEventStore) -> Event {
    for _ in 0..100 {
        let events = store.list(&EventFilter::default()).await.unwrap();
        if let Some(event) = events.into_iter().find(|e| e.is_terminal()) {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no terminal event was recorded");
}

fn sample_observation(status: StatusCode) -> RequestObservation {
    RequestObservation {
        method: Method::POST,
        path: "/api/credentials".to_string(),
        query_params: Map::new(),
        correlation_id: "corr-1".to_string(),
        user_id: Some(UserId::new(5)),
        body: Some(json!({ "name": "aws-main", "secret_key": "abcdefgh1234" })),
        status,
        elapsed: Duration::from_millis(25),
    }
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn test_classify_vm_routes() {
    assert_eq!(
        classify_operation(&Method::POST, "/api/vms"),
        Some(EventType::VmCreate)
    );
    assert_eq!(
        classify_operation(&Method::POST, "/vms/12/start"),
        Some(EventType::VmStart)
    );
    assert_eq!(
        classify_operation(&Method::POST, "/api/vms/12/stop"),
        Some(EventType::VmStop)
    );
    assert_eq!(
        classify_operation(&Method::DELETE, "/api/vms/12"),
        Some(EventType::VmDelete)
    );
    assert_eq!(
        classify_operation(&Method::PATCH, "/api/vms/12/status"),
        Some(EventType::VmStatusUpdate)
    );
}

#[test]
fn test_classify_credential_routes() {
    assert_eq!(
        classify_operation(&Method::POST, "/api/credentials/"),
        Some(EventType::CredentialCreate)
    );
    assert_eq!(
        classify_operation(&Method::PUT, "/api/credentials/3"),
        Some(EventType::CredentialUpdate)
    );
    assert_eq!(
        classify_operation(&Method::DELETE, "/api/credentials/3"),
        Some(EventType::CredentialDelete)
    );
    assert_eq!(
        classify_operation(&Method::POST, "/api/credentials/3/validate"),
        Some(EventType::CredentialValidate)
    );
}

#[test]
fn test_unknown_routes_are_unclassified() {
    assert_eq!(classify_operation(&Method::GET, "/api/vms"), None);
    assert_eq!(classify_operation(&Method::GET, "/api/history"), None);
    assert_eq!(classify_operation(&Method::POST, "/api/vms/1/reboot"), None);
}

// ============================================================================
// Filtering and identity
// ============================================================================

#[test]
fn test_should_observe_respects_exclusions() {
    let observer = observer_over(Arc::new(InMemoryEventStore::new()));

    assert!(observer.should_observe(&Method::GET, "/api/history"));
    assert!(observer.should_observe(&Method::GET, "/healthz"));
    assert!(!observer.should_observe(&Method::GET, "/health"));
    assert!(!observer.should_observe(&Method::GET, "/docs/index.html"));
    assert!(!observer.should_observe(&Method::OPTIONS, "/api/vms"));
}

#[test]
fn test_disabled_observer_observes_nothing() {
    let config = ObserverConfig {
        enabled: false,
        ..ObserverConfig::default()
    };
    let observer = RequestObserver::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(SensitiveDataMasker::default()),
        config,
    );

    assert!(!observer.should_observe(&Method::POST, "/api/vms"));
}

#[test]
fn test_header_identity_resolver() {
    let resolver = HeaderIdentityResolver::new("X-User-Id");
    let mut headers = HeaderMap::new();
    assert_eq!(resolver.resolve(&headers), None);

    headers.insert("x-user-id", HeaderValue::from_static("42"));
    assert_eq!(resolver.resolve(&headers), Some(UserId::new(42)));

    headers.insert("x-user-id", HeaderValue::from_static("not-a-number"));
    assert_eq!(resolver.resolve(&headers), None);
}

// ============================================================================
// Recording
// ============================================================================

#[tokio::test]
async fn test_record_success_masks_body() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let observer = observer_over(store.clone());

    // Act
    let event_id = observer
        .record(sample_observation(StatusCode::CREATED))
        .await
        .expect("event recorded");

    // Assert
    let event = store.get(event_id).await.unwrap();
    assert_eq!(event.event_type, EventType::ApiRequest);
    assert_eq!(event.status, EventStatus::Success);
    assert_eq!(event.user_id, Some(UserId::new(5)));
    assert_eq!(event.result, Some(json!({ "status_code": 201 })));

    let parameters = event.parameters.unwrap();
    assert_eq!(parameters["operation"], "credential_create");
    assert_eq!(parameters["correlation_id"], "corr-1");
    assert_eq!(parameters["body"]["name"], "aws-main");
    assert_eq!(parameters["body"]["secret_key"], "********1234");
}

#[tokio::test]
async fn test_record_masks_sensitive_query_parameters() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let observer = observer_over(store.clone());
    let mut observation = sample_observation(StatusCode::OK);
    observation.query_params =
        query_params(&Uri::from_static("/api/history?access_token=sk-live-abcdef123456&limit=5"));

    // Act
    let event_id = observer.record(observation).await.unwrap();

    // Assert
    let event = store.get(event_id).await.unwrap();
    let parameters = event.parameters.unwrap();
    assert_eq!(
        parameters["query_params"]["access_token"],
        "****************3456"
    );
    assert_eq!(parameters["query_params"]["limit"], "5");
    assert!(!parameters.to_string().contains("sk-live-abcdef123456"));
}

#[test]
fn test_query_params_decoding() {
    let decoded = query_params(&Uri::from_static("/api/history?user_id=7&name=web%201&user_id=8"));
    assert_eq!(decoded["user_id"], "8");
    assert_eq!(decoded["name"], "web 1");

    assert!(query_params(&Uri::from_static("/api/history")).is_empty());
}

#[tokio::test]
async fn test_record_server_error_as_failure() {
    let store = Arc::new(InMemoryEventStore::new());
    let observer = observer_over(store.clone());

    let event_id = observer
        .record(sample_observation(StatusCode::BAD_GATEWAY))
        .await
        .unwrap();

    let event = store.get(event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.error_message.as_deref(), Some("HTTP 502"));
    assert!(event.duration.unwrap() >= 0.025);
}

#[tokio::test]
async fn test_client_errors_are_not_failures() {
    let store = Arc::new(InMemoryEventStore::new());
    let observer = observer_over(store.clone());

    let event_id = observer
        .record(sample_observation(StatusCode::NOT_FOUND))
        .await
        .unwrap();

    let event = store.get(event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Success);
    assert_eq!(event.result, Some(json!({ "status_code": 404 })));
}

#[tokio::test]
async fn test_record_swallows_store_failures() {
    let observer = observer_over(Arc::new(OfflineStore));

    let recorded = observer.record(sample_observation(StatusCode::OK)).await;

    assert_eq!(recorded, None);
}

// ============================================================================
// Middleware
// ============================================================================

#[tokio::test]
async fn test_middleware_records_request_and_echoes_correlation_id() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let app = observed_app(observer_over(store.clone()));
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/vms?dry_run=true")
        .header("content-type", "application/json")
        .header("x-user-id", "9")
        .header(CORRELATION_ID_HEADER, "req-abc")
        .body(Body::from(r#"{"name":"web-1","password":"p@ssw0rd-long"}"#))
        .unwrap();
    let request = with_content_length(request);

    // Act
    let response = app.oneshot(request).await.unwrap();

    // Assert
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[CORRELATION_ID_HEADER], "req-abc");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["name"], "web-1");

    let event = wait_for_event(&store).await;
    assert_eq!(event.status, EventStatus::Success);
    assert_eq!(event.user_id, Some(UserId::new(9)));
    let parameters = event.parameters.unwrap();
    assert_eq!(parameters["method"], "POST");
    assert_eq!(parameters["path"], "/api/vms");
    assert_eq!(parameters["query_params"], json!({ "dry_run": "true" }));
    assert_eq!(parameters["operation"], "vm_create");
    assert_eq!(parameters["body"]["password"], "*********long");
}

#[tokio::test]
async fn test_middleware_generates_correlation_id() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = observed_app(observer_over(store.clone()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/api/history")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let generated = response.headers()[CORRELATION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    assert!(uuid::Uuid::parse_str(&generated).is_ok());

    let event = wait_for_event(&store).await;
    let parameters = event.parameters.unwrap();
    assert_eq!(parameters["correlation_id"], generated.as_str());
    assert_eq!(parameters["operation"], "other");
    assert!(parameters.get("body").is_none());
}

#[tokio::test]
async fn test_middleware_records_server_errors() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = observed_app(observer_over(store.clone()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/vms/4/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let event = wait_for_event(&store).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.error_message.as_deref(), Some("HTTP 500"));
    assert_eq!(event.parameters.unwrap()["operation"], "vm_start");
}

#[tokio::test]
async fn test_middleware_skips_excluded_paths() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = observed_app(observer_over(store.clone()));

    let response = app
        .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(CORRELATION_ID_HEADER).is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_middleware_unaffected_by_store_outage() {
    let app = observed_app(observer_over(Arc::new(OfflineStore)));
    let request = with_content_length(
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/vms")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"web-2"}"#))
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_oversized_body_is_passed_through_but_not_captured() {
    let store = Arc::new(InMemoryEventStore::new());
    let config = ObserverConfig {
        capture_body_limit_bytes: 8,
        ..ObserverConfig::default()
    };
    let observer = RequestObserver::new(
        store.clone(),
        Arc::new(SensitiveDataMasker::default()),
        config,
    );
    let app = observed_app(observer);
    let request = with_content_length(
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/vms")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"a-rather-long-name"}"#))
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let event = wait_for_event(&store).await;
    assert!(event.parameters.unwrap().get("body").is_none());
}

/// Set `content-length` from the buffered test body
#[tokio::test]
async fn test_middleware_masks_query_secrets() {
    let store = Arc::new(InMemoryEventStore::new());
    let app = observed_app(observer_over(store.clone()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/api/history?access_token=sk-live-abcdef123456")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let event = wait_for_event(&store).await;
    let recorded = serde_json::to_string(&event).unwrap();
    assert!(!recorded.contains("sk-live-abcdef123456"));
    assert_eq!(
        event.parameters.unwrap()["query_params"]["access_token"],
        "****************3456"
    );
}

#[tokio::test]
async fn test_unreadable_body_is_rejected_before_the_handler() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let config = ObserverConfig {
        capture_body_limit_bytes: 8,
        ..ObserverConfig::default()
    };
    let observer = RequestObserver::new(
        store.clone(),
        Arc::new(SensitiveDataMasker::default()),
        config,
    );
    let app = observed_app(observer);
    // Declared length fits the capture limit, the actual body does not
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/vms")
        .header("content-type", "application/json")
        .header(header::CONTENT_LENGTH, "4")
        .body(Body::from(r#"{"name":"a-rather-long-name"}"#))
        .unwrap();

    // Act
    let response = app.oneshot(request).await.unwrap();

    // Assert
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("Failed to buffer the request body"));

    let event = wait_for_event(&store).await;
    assert_eq!(event.result, Some(json!({ "status_code": 400 })));
    assert!(event.parameters.unwrap().get("body").is_none());
}

fn with_content_length(request: Request) -> Request {
    let (mut parts, body) = request.into_parts();
    let length = http_body_length(&body);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    Request::from_parts(parts, body)
}

fn http_body_length(body: &Body) -> u64 {
    use axum::body::HttpBody;
    body.size_hint().exact().unwrap_or(0)
}
