//! Tests for HTTP error mapping.

use super::*;
use vm_history_core::EventId;

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_store_errors_map_to_http_classes() {
    let missing: ApiError = EventStoreError::NotFound {
        event_id: EventId::new(),
    }
    .into();
    let down: ApiError = EventStoreError::Unavailable {
        message: "disk full".to_string(),
    }
    .into();
    let corrupt: ApiError = EventStoreError::Serialization {
        message: "bad json".to_string(),
    }
    .into();

    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(down.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(corrupt.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_invalid_query_body_names_the_problem() {
    let response = ApiError::invalid_query("days must be between 1 and 365").into_response();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["status"], 400);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("days must be between 1 and 365"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_unavailable_store_sets_retry_after_and_hides_details() {
    let response = ApiError::StoreUnavailable {
        message: "connection refused to 10.0.0.5".to_string(),
    }
    .into_response();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["Retry-After"], "30");
    let body = body_json(response).await;
    assert!(!body["error"].as_str().unwrap().contains("10.0.0.5"));
}

#[test]
fn test_service_error_exit_codes() {
    let config = ServiceError::Configuration(ConfigError::Missing {
        key: "encryption.secret".to_string(),
    });
    let bind = ServiceError::BindFailed {
        address: "0.0.0.0:80".to_string(),
        message: "permission denied".to_string(),
    };

    assert_eq!(config.exit_code(), 3);
    assert_eq!(bind.exit_code(), 1);
}
