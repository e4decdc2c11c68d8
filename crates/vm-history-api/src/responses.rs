//! Response types and query parameters for the history API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vm_history_core::{
    CredentialId, DailyStats, Event, EventStatus, EventType, StatsPeriod, SuccessRatio,
    Timestamp, UserId, VmId,
};

// ============================================================================
// Query Parameters
// ============================================================================

/// Filters accepted by `GET /api/history`
///
/// Dates are either `YYYY-MM-DD` or RFC 3339. A date-only `end_date`
/// covers the whole day.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<UserId>,
    pub vm_id: Option<VmId>,
    pub credential_id: Option<CredentialId>,
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Query for `GET /api/history/stats/summary`
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryQuery {
    #[serde(default = "default_summary_period")]
    pub period: StatsPeriod,
}

fn default_summary_period() -> StatsPeriod {
    StatsPeriod::Week
}

/// Query for `GET /api/history/stats/daily`
#[derive(Debug, Clone, Deserialize)]
pub struct DailyQuery {
    #[serde(default = "default_days")]
    pub days: i64,
    pub event_type: Option<EventType>,
}

fn default_days() -> i64 {
    30
}

/// Query for `GET /api/history/stats/deployment-times`
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentTimesQuery {
    #[serde(default = "default_deployment_period")]
    pub period: StatsPeriod,
}

fn default_deployment_period() -> StatsPeriod {
    StatsPeriod::Month
}

// ============================================================================
// Response Types
// ============================================================================

/// Page of events
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryListResponse {
    /// Matching events before pagination
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub events: Vec<Event>,
}

/// Aggregate view of one reporting period
#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub period: StatsPeriod,
    pub start: Timestamp,
    pub end: Timestamp,
    pub event_counts: BTreeMap<EventType, usize>,
    pub success_ratio: SuccessRatio,
    pub avg_durations: BTreeMap<EventType, f64>,
}

/// Per-day buckets
#[derive(Debug, Serialize, Deserialize)]
pub struct DailyStatsResponse {
    pub days: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    pub stats: Vec<DailyStats>,
}

/// Average durations of the provisioning-heavy operations
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentTimesResponse {
    pub period: StatsPeriod,
    pub vm_create: Option<f64>,
    pub vm_delete: Option<f64>,
    pub credential_create: Option<f64>,
    pub credential_delete: Option<f64>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Readiness check response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
