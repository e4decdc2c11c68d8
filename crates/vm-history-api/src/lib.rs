//! # VM History HTTP Service
//!
//! HTTP surface of the VM operation history engine.
//!
//! This crate provides:
//! - The request observer middleware recording every API call
//! - History query and statistics endpoints
//! - Health and readiness endpoints
//! - Service configuration loading and validation

pub mod config;
pub mod errors;
pub mod observer;
pub mod responses;

pub use config::{LoggingConfig, ServerConfig, ServiceConfig, StorageBackend, StorageConfig};
pub use errors::{ApiError, ConfigError, ServiceError};
pub use observer::{
    classify_operation, request_observer_middleware, HeaderIdentityResolver, IdentityResolver,
    ObserverConfig, RequestObservation, RequestObserver, CORRELATION_ID_HEADER,
};
pub use responses::*;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::get,
    Router,
};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument};
use vm_history_core::{
    history::MAX_LIST_LIMIT, statistics, EventFilter, EventId, EventStore, EventType,
    FilesystemEventStore, InMemoryEventStore, StatsPeriod, Timestamp,
};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: ServiceConfig,

    /// Event store backing the history endpoints
    pub event_store: Arc<dyn EventStore>,

    /// Records inbound requests
    pub observer: RequestObserver,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        event_store: Arc<dyn EventStore>,
        observer: RequestObserver,
    ) -> Self {
        Self {
            config,
            event_store,
            observer,
        }
    }
}

/// Open the event store selected by configuration
pub async fn open_event_store(config: &StorageConfig) -> Result<Arc<dyn EventStore>, ServiceError> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory event store");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        StorageBackend::Filesystem => {
            info!(path = %config.path.display(), "Using filesystem event store");
            let store = FilesystemEventStore::new(config.path.clone()).await?;
            Ok(Arc::new(store))
        }
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/ready", get(handle_readiness_check));

    let history_routes = Router::new()
        .route("/api/history", get(list_history))
        .route("/api/history/{event_id}", get(get_history_event))
        .route("/api/history/stats/summary", get(get_summary))
        .route("/api/history/stats/daily", get(get_daily_stats))
        .route(
            "/api/history/stats/deployment-times",
            get(get_deployment_times),
        );

    let mut router = Router::new()
        .merge(health_routes)
        .merge(history_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    state.observer.clone(),
                    request_observer_middleware,
                ))
                .into_inner(),
        );

    if state.config.server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// Start HTTP server
pub async fn start_server(
    config: ServiceConfig,
    event_store: Arc<dyn EventStore>,
    observer: RequestObserver,
) -> Result<(), ServiceError> {
    let address = config.server.bind_address();
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    let app = create_router(AppState::new(config, event_store, observer));

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!("Starting HTTP server on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal(shutdown_timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
        },
    }
}

// ============================================================================
// Health Check Handlers
// ============================================================================

/// Liveness
async fn handle_health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: the event store answers a count query
#[instrument(skip(state))]
async fn handle_readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let probe = EventFilter {
        limit: 1,
        ..EventFilter::default()
    };

    match state.event_store.count(&probe).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                timestamp: Timestamp::now(),
                reason: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                timestamp: Timestamp::now(),
                reason: Some(e.to_string()),
            }),
        ),
    }
}

// ============================================================================
// History Handlers
// ============================================================================

/// List events matching the query filters, newest first
#[instrument(skip(state, query))]
async fn list_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryListResponse>, ApiError> {
    let Query(query) = query?;
    let filter = history_filter(&query)?;

    let total = state.event_store.count(&filter).await?;
    let events = state.event_store.list(&filter).await?;

    Ok(Json(HistoryListResponse {
        total,
        limit: filter.limit,
        offset: filter.offset,
        events,
    }))
}

/// Fetch one event
#[instrument(skip(state))]
async fn get_history_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<vm_history_core::Event>, ApiError> {
    let event_id: EventId = event_id
        .parse()
        .map_err(|e| ApiError::invalid_query(format!("event_id: {}", e)))?;

    Ok(Json(state.event_store.get(event_id).await?))
}

/// Counts, outcomes and durations over a reporting period
#[instrument(skip(state, query))]
async fn get_summary(
    State(state): State<AppState>,
    query: Result<Query<SummaryQuery>, QueryRejection>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let Query(query) = query?;
    let end = Timestamp::now();
    let start = query.period.start_from(end);
    let events = events_between(&state, start, end, None).await?;

    Ok(Json(SummaryResponse {
        period: query.period,
        start,
        end,
        event_counts: statistics::counts_by_type(&events),
        success_ratio: statistics::success_ratio(&events),
        avg_durations: statistics::average_durations(&events),
    }))
}

/// One bucket per day for the last `days` days, today included
#[instrument(skip(state, query))]
async fn get_daily_stats(
    State(state): State<AppState>,
    query: Result<Query<DailyQuery>, QueryRejection>,
) -> Result<Json<DailyStatsResponse>, ApiError> {
    let Query(query) = query?;
    if !(1..=365).contains(&query.days) {
        return Err(ApiError::invalid_query("days must be between 1 and 365"));
    }

    let end = Timestamp::now();
    let back = Duration::from_secs((query.days as u64 - 1) * 24 * 60 * 60);
    let start = end.subtract_duration(back).start_of_day();
    let events = events_between(&state, start, end, query.event_type).await?;

    Ok(Json(DailyStatsResponse {
        days: query.days,
        event_type: query.event_type,
        stats: statistics::daily_stats(&events, start, end),
    }))
}

/// Average durations of VM and credential lifecycle operations
#[instrument(skip(state, query))]
async fn get_deployment_times(
    State(state): State<AppState>,
    query: Result<Query<DeploymentTimesQuery>, QueryRejection>,
) -> Result<Json<DeploymentTimesResponse>, ApiError> {
    let Query(query) = query?;
    if query.period == StatsPeriod::Day {
        return Err(ApiError::invalid_query(
            "period must be one of week, month, year",
        ));
    }

    let end = Timestamp::now();
    let start = query.period.start_from(end);
    let events = events_between(&state, start, end, None).await?;
    let average = |event_type| statistics::average_duration_for(&events, event_type);

    Ok(Json(DeploymentTimesResponse {
        period: query.period,
        vm_create: average(EventType::VmCreate),
        vm_delete: average(EventType::VmDelete),
        credential_create: average(EventType::CredentialCreate),
        credential_delete: average(EventType::CredentialDelete),
    }))
}

async fn events_between(
    state: &AppState,
    start: Timestamp,
    end: Timestamp,
    event_type: Option<EventType>,
) -> Result<Vec<vm_history_core::Event>, ApiError> {
    let filter = EventFilter {
        event_type,
        start: Some(start),
        end: Some(end),
        ..EventFilter::unbounded()
    };
    Ok(state.event_store.list(&filter).await?)
}

// ============================================================================
// Query Parsing
// ============================================================================

/// Translate list query parameters into a store filter
pub fn history_filter(query: &HistoryQuery) -> Result<EventFilter, ApiError> {
    let defaults = EventFilter::default();

    let limit = match query.limit {
        None => defaults.limit,
        Some(limit) if (1..=MAX_LIST_LIMIT as i64).contains(&limit) => limit as usize,
        Some(_) => {
            return Err(ApiError::invalid_query(format!(
                "limit must be between 1 and {}",
                MAX_LIST_LIMIT
            )))
        }
    };

    let offset = match query.offset {
        None => 0,
        Some(offset) if offset >= 0 => offset as usize,
        Some(_) => return Err(ApiError::invalid_query("offset must not be negative")),
    };

    let start = query
        .start_date
        .as_deref()
        .map(|s| parse_date_bound(s, false))
        .transpose()?;
    let end = query
        .end_date
        .as_deref()
        .map(|s| parse_date_bound(s, true))
        .transpose()?;

    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(ApiError::invalid_query(
                "start_date must not be after end_date",
            ));
        }
    }

    Ok(EventFilter {
        user_id: query.user_id,
        vm_id: query.vm_id,
        credential_id: query.credential_id,
        event_type: query.event_type,
        status: query.status,
        start,
        end,
        limit,
        offset,
    })
}

/// Parse `YYYY-MM-DD` or RFC 3339
///
/// A bare date is midnight, or the last second of the day when
/// `end_of_day` is set.
fn parse_date_bound(value: &str, end_of_day: bool) -> Result<Timestamp, ApiError> {
    if let Ok(timestamp) = Timestamp::from_rfc3339(value) {
        return Ok(timestamp);
    }

    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        ApiError::invalid_query(format!(
            "invalid date '{}': expected YYYY-MM-DD or RFC 3339",
            value
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
    } else {
        NaiveTime::MIN
    };

    Ok(Timestamp::from_datetime(
        Utc.from_utc_datetime(&date.and_time(time)),
    ))
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
