//! Common test utilities for vm-history integration tests
//!
//! This module provides:
//! - A harness wiring store, masker, tracker, observer and router together
//! - Helpers for issuing requests and waiting on spawned history writes

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tower::ServiceExt;
use vm_history_api::{create_router, AppState, ObserverConfig, RequestObserver, ServiceConfig};
use vm_history_core::{
    Event, EventFilter, EventStatus, EventStore, EventType, InMemoryEventStore, MaskingConfig,
    OperationTracker, SensitiveDataMasker, TrackerConfig,
};

/// Everything a test needs, sharing one event store
#[allow(dead_code)]
pub struct TestHarness {
    pub store: Arc<dyn EventStore>,
    pub masker: Arc<SensitiveDataMasker>,
    pub tracker: OperationTracker,
    pub app: Router,
}

impl TestHarness {
    /// Harness over a fresh in-memory store
    pub fn new() -> Self {
        Self::over(Arc::new(InMemoryEventStore::new()))
    }

    /// Harness over an existing store
    pub fn over(store: Arc<dyn EventStore>) -> Self {
        let masker = Arc::new(SensitiveDataMasker::new(&MaskingConfig::default()));
        let tracker = OperationTracker::new(
            store.clone(),
            masker.clone(),
            TrackerConfig {
                cancellation_update_timeout_ms: 500,
            },
        );
        let observer =
            RequestObserver::new(store.clone(), masker.clone(), ObserverConfig::default());
        let app = create_router(AppState::new(
            ServiceConfig::default(),
            store.clone(),
            observer,
        ));

        Self {
            store,
            masker,
            tracker,
            app,
        }
    }

    /// Issue a GET and decode the JSON body
    #[allow(dead_code)]
    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Events of one type, newest first
    #[allow(dead_code)]
    pub async fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.store
            .list(&EventFilter {
                event_type: Some(event_type),
                ..EventFilter::default()
            })
            .await
            .unwrap()
    }

    /// Wait until `expected` terminal events of `event_type` exist
    #[allow(dead_code)]
    pub async fn wait_for_terminal(&self, event_type: EventType, expected: usize) -> Vec<Event> {
        for _ in 0..200 {
            let events: Vec<Event> = self
                .events_of(event_type)
                .await
                .into_iter()
                .filter(|e| e.status.is_terminal())
                .collect();
            if events.len() >= expected {
                return events;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} terminal {} events",
            expected,
            event_type.as_str()
        );
    }
}

/// Status shortcut used in assertions
#[allow(dead_code)]
pub fn is_success(event: &Event) -> bool {
    event.status == EventStatus::Success
}
