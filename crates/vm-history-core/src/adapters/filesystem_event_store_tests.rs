//! Tests for the filesystem event store.

use super::*;
use crate::history::{EventStatus, EventType, FailureKind};
use crate::UserId;
use serde_json::json;
use tempfile::TempDir;

async fn create_store() -> (FilesystemEventStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = FilesystemEventStore::new(temp_dir.path().to_path_buf())
        .await
        .unwrap();
    (store, temp_dir)
}

#[tokio::test]
async fn test_new_creates_base_directory() {
    let temp_dir = TempDir::new().unwrap();
    let nested = temp_dir.path().join("history").join("events");

    let store = FilesystemEventStore::new(nested.clone()).await.unwrap();

    assert!(nested.is_dir());
    assert_eq!(store.base_path(), nested.as_path());
}

#[tokio::test]
async fn test_create_and_get_round_trip() {
    // Arrange
    let (store, _temp) = create_store().await;

    // Act
    let created = store
        .create(
            NewEvent::pending(EventType::CredentialCreate)
                .with_user(Some(UserId::new(11)))
                .with_parameters(Some(json!({"name": "prod-aws"}))),
        )
        .await
        .unwrap();
    let fetched = store.get(created.id).await.unwrap();

    // Assert
    assert_eq!(fetched, created);
    assert!(store.base_path().join(format!("{}.json", created.id)).exists());
}

#[tokio::test]
async fn test_update_persists_and_locks_terminal_events() {
    // Arrange
    let (store, _temp) = create_store().await;
    let event = store
        .create(NewEvent::pending(EventType::TerraformDestroy))
        .await
        .unwrap();

    // Act
    let failed = store
        .update(
            event.id,
            EventUpdate::failure(
                FailureKind::Timeout,
                "destroy timed out",
                None,
                30.0,
            ),
        )
        .await
        .unwrap();
    let reopened = FilesystemEventStore::new(store.base_path().to_path_buf())
        .await
        .unwrap();
    let second = reopened
        .update(event.id, EventUpdate::success(None, 31.0))
        .await;

    // Assert
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(reopened.get(event.id).await.unwrap(), failed);
    assert!(matches!(
        second,
        Err(EventStoreError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_get_missing_event_is_not_found() {
    let (store, _temp) = create_store().await;

    let result = store.get(EventId::new()).await;

    assert!(matches!(result, Err(EventStoreError::NotFound { .. })));
}

#[tokio::test]
async fn test_list_ignores_temporary_files() {
    // Arrange
    let (store, _temp) = create_store().await;
    store
        .create(NewEvent::pending(EventType::VmStop))
        .await
        .unwrap();
    tokio::fs::write(store.base_path().join("partial.tmp"), b"{not json")
        .await
        .unwrap();

    // Act
    let listed = store.list(&EventFilter::default()).await.unwrap();

    // Assert
    assert_eq!(listed.len(), 1);
    assert_eq!(store.count(&EventFilter::default()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_corrupt_document_is_reported() {
    let (store, _temp) = create_store().await;
    tokio::fs::write(store.base_path().join("broken.json"), b"{not json")
        .await
        .unwrap();

    let result = store.list(&EventFilter::default()).await;

    assert!(matches!(result, Err(EventStoreError::Serialization { .. })));
}

#[tokio::test]
async fn test_list_applies_filter_and_limit() {
    // Arrange
    let (store, _temp) = create_store().await;
    for _ in 0..3 {
        store
            .create(NewEvent::pending(EventType::ApiRequest))
            .await
            .unwrap();
    }
    store
        .create(NewEvent::pending(EventType::VmCreate))
        .await
        .unwrap();

    let filter = EventFilter {
        event_type: Some(EventType::ApiRequest),
        limit: 2,
        ..EventFilter::default()
    };

    // Act
    let listed = store.list(&filter).await.unwrap();
    let total = store.count(&filter).await.unwrap();

    // Assert
    assert_eq!(listed.len(), 2);
    assert_eq!(total, 3);
    assert!(listed.iter().all(|e| e.event_type == EventType::ApiRequest));
}
