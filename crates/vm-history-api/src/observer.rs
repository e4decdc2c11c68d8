//! # Request Observer
//!
//! axum middleware recording every inbound API call as an `api_request`
//! history event.
//!
//! The observer never influences the response: the event is written on a
//! spawned task after the handler has produced its response, and store
//! failures are logged and dropped.

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Span};
use vm_history_core::{
    EventId, EventStore, EventType, EventUpdate, FailureKind, NewEvent, SensitiveDataMasker, UserId,
};

/// Header carrying the request correlation identifier
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// ============================================================================
// Configuration
// ============================================================================

/// Request observer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub enabled: bool,

    /// Path prefixes that are never recorded
    pub excluded_paths: Vec<String>,

    /// HTTP methods that are never recorded
    pub excluded_methods: Vec<String>,

    /// Header read by the default identity resolver
    pub identity_header: String,

    /// JSON bodies up to this declared size are captured
    pub capture_body_limit_bytes: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_paths: vec![
                "/docs".to_string(),
                "/redoc".to_string(),
                "/openapi.json".to_string(),
                "/health".to_string(),
            ],
            excluded_methods: vec!["OPTIONS".to_string()],
            identity_header: "x-user-id".to_string(),
            capture_body_limit_bytes: 16 * 1024,
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Resolves the calling user from request headers
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Reads a numeric user identifier from a single header
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    header: String,
}

impl HeaderIdentityResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        headers
            .get(self.header.as_str())?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Business operation addressed by a request, if it is a known one
///
/// Recognises the VM and credential routes with or without an `/api`
/// prefix.
pub fn classify_operation(method: &Method, path: &str) -> Option<EventType> {
    let path = path.strip_prefix("/api").unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (segments.as_slice(), method.as_str()) {
        (["vms"], "POST") => Some(EventType::VmCreate),
        (["vms", _, "start"], "POST") => Some(EventType::VmStart),
        (["vms", _, "stop"], "POST") => Some(EventType::VmStop),
        (["vms", _], "DELETE") => Some(EventType::VmDelete),
        (["vms", _], "GET" | "PUT" | "PATCH") | (["vms", _, "status"], _) => {
            Some(EventType::VmStatusUpdate)
        }
        (["credentials"], "POST") => Some(EventType::CredentialCreate),
        (["credentials", _], "PUT" | "PATCH") => Some(EventType::CredentialUpdate),
        (["credentials", _], "DELETE") => Some(EventType::CredentialDelete),
        (["credentials", _, "validate"], "GET" | "POST") => Some(EventType::CredentialValidate),
        _ => None,
    }
}

// ============================================================================
// Observation
// ============================================================================

/// Everything recorded about one request
#[derive(Debug, Clone)]
pub struct RequestObservation {
    pub method: Method,
    pub path: String,
    /// Decoded query parameters, last value wins for repeated keys
    pub query_params: Map<String, Value>,
    pub correlation_id: String,
    pub user_id: Option<UserId>,
    pub body: Option<Value>,
    pub status: StatusCode,
    pub elapsed: Duration,
}

impl RequestObservation {
    /// Unmasked event parameters
    pub fn parameters(&self) -> Value {
        let operation = classify_operation(&self.method, &self.path)
            .map(|t| t.as_str())
            .unwrap_or("other");

        let mut parameters = Map::new();
        parameters.insert("method".to_string(), json!(self.method.as_str()));
        parameters.insert("path".to_string(), json!(self.path));
        parameters.insert(
            "query_params".to_string(),
            Value::Object(self.query_params.clone()),
        );
        parameters.insert("operation".to_string(), json!(operation));
        parameters.insert("correlation_id".to_string(), json!(self.correlation_id));
        if let Some(body) = &self.body {
            parameters.insert("body".to_string(), body.clone());
        }
        Value::Object(parameters)
    }

    /// Terminal update: 5xx fails, everything else succeeds
    pub fn outcome(&self) -> EventUpdate {
        let duration = self.elapsed.as_secs_f64();
        if self.status.is_server_error() {
            EventUpdate::failure(
                FailureKind::Operation,
                format!("HTTP {}", self.status.as_u16()),
                None,
                duration,
            )
        } else {
            EventUpdate::success(Some(json!({ "status_code": self.status.as_u16() })), duration)
        }
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Records inbound requests into the history store
#[derive(Clone)]
pub struct RequestObserver {
    store: Arc<dyn EventStore>,
    masker: Arc<SensitiveDataMasker>,
    identity: Arc<dyn IdentityResolver>,
    config: ObserverConfig,
    span: Span,
}

impl RequestObserver {
    pub fn new(
        store: Arc<dyn EventStore>,
        masker: Arc<SensitiveDataMasker>,
        config: ObserverConfig,
    ) -> Self {
        let identity = Arc::new(HeaderIdentityResolver::new(config.identity_header.clone()));
        Self {
            store,
            masker,
            identity,
            config,
            span: info_span!("request_observer"),
        }
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Whether a request is recorded at all
    pub fn should_observe(&self, method: &Method, path: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self
            .config
            .excluded_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
        {
            return false;
        }
        !self.config.excluded_paths.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Write the event for one observation
    ///
    /// Returns the event id when both writes succeeded. Failures are logged.
    pub async fn record(&self, observation: RequestObservation) -> Option<EventId> {
        let parameters = self.masker.mask(&observation.parameters());
        let new_event = NewEvent::pending(EventType::ApiRequest)
            .with_user(observation.user_id)
            .with_parameters(Some(parameters));

        let event = match self.store.create(new_event).await {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    parent: &self.span,
                    path = %observation.path,
                    error = %error,
                    "Failed to record API request"
                );
                return None;
            }
        };

        match self.store.update(event.id, observation.outcome()).await {
            Ok(_) => {
                debug!(
                    parent: &self.span,
                    event_id = %event.id,
                    status = observation.status.as_u16(),
                    duration_ms = observation.elapsed.as_millis() as u64,
                    "Recorded API request"
                );
                Some(event.id)
            }
            Err(error) => {
                warn!(
                    parent: &self.span,
                    event_id = %event.id,
                    error = %error,
                    "Failed to complete API request event"
                );
                None
            }
        }
    }

    fn spawn_record(&self, observation: RequestObservation) {
        let observer = self.clone();
        tokio::spawn(async move {
            observer.record(observation).await;
        });
    }

    /// Buffer a small JSON body so it can be recorded and still reach the handler
    ///
    /// A body that cannot be buffered is answered here with the read error;
    /// the handler is not invoked with a partial body.
    async fn capture_body(&self, request: Request) -> Result<(Request, Option<Value>), Response> {
        let limit = self.config.capture_body_limit_bytes;
        let declared = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        let is_json = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));

        match declared {
            Some(length) if is_json && length > 0 && length <= limit => {}
            _ => return Ok((request, None)),
        }

        let (parts, body) = request.into_parts();
        match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => {
                let captured = parse_json(&bytes);
                Ok((Request::from_parts(parts, Body::from(bytes)), captured))
            }
            Err(error) => {
                warn!(parent: &self.span, error = %error, "Failed to buffer request body");
                Err((
                    StatusCode::BAD_REQUEST,
                    format!("Failed to buffer the request body: {}", error),
                )
                    .into_response())
            }
        }
    }
}

impl fmt::Debug for RequestObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestObserver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn parse_json(bytes: &Bytes) -> Option<Value> {
    serde_json::from_slice(bytes).ok()
}

/// Decode the query string into a mapping the masker can walk
///
/// An undecodable query is dropped rather than recorded raw.
fn query_params(uri: &Uri) -> Map<String, Value> {
    match Query::<Vec<(String, String)>>::try_from_uri(uri) {
        Ok(Query(pairs)) => pairs
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
        Err(error) => {
            debug!(error = %error, "Dropping undecodable query string");
            Map::new()
        }
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Record the request as an `api_request` event
///
/// The correlation id is taken from `x-correlation-id` or generated, and
/// echoed on the response.
pub async fn request_observer_middleware(
    State(observer): State<RequestObserver>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if !observer.should_observe(&method, &path) {
        return next.run(request).await;
    }

    let started = Instant::now();
    let query_params = query_params(request.uri());
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user_id = observer.identity.resolve(request.headers());
    let (mut response, body) = match observer.capture_body(request).await {
        Ok((request, body)) => (next.run(request).await, body),
        Err(rejection) => (rejection, None),
    };

    if let Ok(header_value) = HeaderValue::from_str(&correlation_id) {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    observer.spawn_record(RequestObservation {
        method,
        path,
        query_params,
        correlation_id,
        user_id,
        body,
        status: response.status(),
        elapsed: started.elapsed(),
    });

    response
}

#[cfg(test)]
#[path = "observer_tests.rs"]
mod tests;
