//! # Operation History
//!
//! Event model for the audit trail and the storage abstraction behind it.
//!
//! An [`Event`] records one tracked operation from its creation (normally
//! `PENDING`) to exactly one terminal state (`SUCCESS` or `FAILED`). Once an
//! event is terminal the store refuses any further mutation.
//!
//! Storage implementations live in [`crate::adapters`].

use crate::{CredentialId, EventId, ParseError, Timestamp, UserId, VmId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Default page size for [`EventFilter`]
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Upper bound on the page size a caller may request
pub const MAX_LIST_LIMIT: usize = 1000;

// ============================================================================
// Core Types
// ============================================================================

/// Kind of operation an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    VmCreate,
    VmStart,
    VmStop,
    VmDelete,
    VmStatusUpdate,
    CredentialCreate,
    CredentialUpdate,
    CredentialDelete,
    CredentialValidate,
    CredentialUse,
    TerraformInit,
    TerraformPlan,
    TerraformApply,
    TerraformDestroy,
    ApiRequest,
}

impl EventType {
    /// All event types in declaration order
    pub const ALL: [EventType; 15] = [
        Self::VmCreate,
        Self::VmStart,
        Self::VmStop,
        Self::VmDelete,
        Self::VmStatusUpdate,
        Self::CredentialCreate,
        Self::CredentialUpdate,
        Self::CredentialDelete,
        Self::CredentialValidate,
        Self::CredentialUse,
        Self::TerraformInit,
        Self::TerraformPlan,
        Self::TerraformApply,
        Self::TerraformDestroy,
        Self::ApiRequest,
    ];

    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VmCreate => "vm_create",
            Self::VmStart => "vm_start",
            Self::VmStop => "vm_stop",
            Self::VmDelete => "vm_delete",
            Self::VmStatusUpdate => "vm_status_update",
            Self::CredentialCreate => "credential_create",
            Self::CredentialUpdate => "credential_update",
            Self::CredentialDelete => "credential_delete",
            Self::CredentialValidate => "credential_validate",
            Self::CredentialUse => "credential_use",
            Self::TerraformInit => "terraform_init",
            Self::TerraformPlan => "terraform_plan",
            Self::TerraformApply => "terraform_apply",
            Self::TerraformDestroy => "terraform_destroy",
            Self::ApiRequest => "api_request",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ParseError::UnknownVariant {
                field: "event_type".to_string(),
                actual: s.to_string(),
            })
    }
}

/// Lifecycle status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl EventStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Check whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Check whether moving from `self` to `next` is a legal transition
    ///
    /// Transitions are monotonic: `PENDING` may move anywhere forward,
    /// `IN_PROGRESS` only to a terminal state, terminal states nowhere.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::InProgress => next.is_terminal(),
            Self::Success | Self::Failed => false,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseError::UnknownVariant {
                field: "status".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Why a `FAILED` event failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The wrapped operation returned an error
    Operation,
    /// External tool exited with a nonzero status
    NonZeroExit,
    /// External tool exceeded its time budget
    Timeout,
    /// Caller abandoned the operation before it completed
    Cancelled,
    /// External tool could not be started
    Spawn,
}

/// One audit record describing an operation's lifecycle and outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub status: EventStatus,

    /// Creation time, never changed afterwards
    pub timestamp: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<CredentialId>,

    /// Masked snapshot of the operation inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,

    /// Masked snapshot of the operation output, `SUCCESS` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Elapsed seconds, set when the event turns terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Event {
    /// Materialize a new event from a creation request
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidUpdate`] for a terminal initial status.
    pub fn from_new(new: NewEvent) -> Result<Self, EventStoreError> {
        if new.status.is_terminal() {
            return Err(EventStoreError::InvalidUpdate {
                message: format!("events cannot be created as {}", new.status),
            });
        }

        Ok(Self {
            id: EventId::new(),
            event_type: new.event_type,
            status: new.status,
            timestamp: Timestamp::now(),
            user_id: new.user_id,
            vm_id: new.vm_id,
            credential_id: new.credential_id,
            parameters: new.parameters,
            result: None,
            error_message: None,
            error_detail: None,
            failure_kind: None,
            duration: None,
        })
    }

    /// Check whether the event has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Produce the event that results from applying `update`
    ///
    /// This is the single mutation rule shared by every store
    /// implementation.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::InvalidTransition`] when the event is terminal
    ///   or the status would move backwards
    /// - [`EventStoreError::InvalidUpdate`] when the update carries fields
    ///   that do not belong to its target status
    pub fn apply_update(&self, update: EventUpdate) -> Result<Event, EventStoreError> {
        if !self.status.can_transition_to(update.status) {
            return Err(EventStoreError::InvalidTransition {
                event_id: self.id,
                from: self.status,
                to: update.status,
            });
        }
        update.validate()?;

        let mut next = self.clone();
        next.status = update.status;
        next.result = update.result;
        next.error_message = update.error_message;
        next.error_detail = update.error_detail;
        next.failure_kind = update.failure_kind;
        next.duration = update.duration;
        Ok(next)
    }
}

/// Request to create an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub status: EventStatus,
    pub user_id: Option<UserId>,
    pub vm_id: Option<VmId>,
    pub credential_id: Option<CredentialId>,
    pub parameters: Option<Value>,
}

impl NewEvent {
    /// Start a `PENDING` event of the given type
    pub fn pending(event_type: EventType) -> Self {
        Self {
            event_type,
            status: EventStatus::Pending,
            user_id: None,
            vm_id: None,
            credential_id: None,
            parameters: None,
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_vm(mut self, vm_id: Option<VmId>) -> Self {
        self.vm_id = vm_id;
        self
    }

    pub fn with_credential(mut self, credential_id: Option<CredentialId>) -> Self {
        self.credential_id = credential_id;
        self
    }

    pub fn with_parameters(mut self, parameters: Option<Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Status change applied to an existing event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUpdate {
    pub status: EventStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub duration: Option<f64>,
}

impl EventUpdate {
    /// Mark the event as running
    pub fn in_progress() -> Self {
        Self {
            status: EventStatus::InProgress,
            result: None,
            error_message: None,
            error_detail: None,
            failure_kind: None,
            duration: None,
        }
    }

    /// Complete the event successfully
    pub fn success(result: Option<Value>, duration: f64) -> Self {
        Self {
            status: EventStatus::Success,
            result,
            error_message: None,
            error_detail: None,
            failure_kind: None,
            duration: Some(duration),
        }
    }

    /// Complete the event with a failure
    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        detail: Option<String>,
        duration: f64,
    ) -> Self {
        Self {
            status: EventStatus::Failed,
            result: None,
            error_message: Some(message.into()),
            error_detail: detail,
            failure_kind: Some(kind),
            duration: Some(duration),
        }
    }

    /// Check field consistency against the target status
    pub fn validate(&self) -> Result<(), EventStoreError> {
        let invalid = |message: &str| {
            Err(EventStoreError::InvalidUpdate {
                message: message.to_string(),
            })
        };

        match self.duration {
            Some(_) if !self.status.is_terminal() => {
                return invalid("duration is only recorded for terminal states")
            }
            None if self.status.is_terminal() => {
                return invalid("terminal updates must carry a duration")
            }
            Some(d) if !d.is_finite() || d < 0.0 => {
                return invalid("duration must be a non-negative number of seconds")
            }
            _ => {}
        }

        if self.result.is_some() && self.status != EventStatus::Success {
            return invalid("result is only recorded for successful events");
        }

        let is_failed = self.status == EventStatus::Failed;
        if is_failed && self.error_message.is_none() {
            return invalid("failed events require an error message");
        }
        if !is_failed
            && (self.error_message.is_some()
                || self.error_detail.is_some()
                || self.failure_kind.is_some())
        {
            return invalid("error fields are only recorded for failed events");
        }

        Ok(())
    }
}

/// Query filter for listing events
///
/// All criteria are conjunctive. `start` and `end` are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub user_id: Option<UserId>,
    pub vm_id: Option<VmId>,
    pub credential_id: Option<CredentialId>,
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            vm_id: None,
            credential_id: None,
            event_type: None,
            status: None,
            start: None,
            end: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl EventFilter {
    /// Filter with no page limit, for aggregations
    pub fn unbounded() -> Self {
        Self {
            limit: usize::MAX,
            ..Self::default()
        }
    }

    /// Check whether an event satisfies every criterion
    pub fn matches(&self, event: &Event) -> bool {
        self.user_id.map_or(true, |id| event.user_id == Some(id))
            && self.vm_id.map_or(true, |id| event.vm_id == Some(id))
            && self
                .credential_id
                .map_or(true, |id| event.credential_id == Some(id))
            && self.event_type.map_or(true, |t| event.event_type == t)
            && self.status.map_or(true, |s| event.status == s)
            && self.start.map_or(true, |start| event.timestamp >= start)
            && self.end.map_or(true, |end| event.timestamp <= end)
    }

    /// Page size after applying the caller cap
    ///
    /// [`EventFilter::unbounded`] is exempt from the cap.
    pub fn effective_limit(&self) -> usize {
        if self.limit == usize::MAX {
            usize::MAX
        } else {
            self.limit.min(MAX_LIST_LIMIT)
        }
    }

    /// Sort newest first, then apply offset and limit
    pub fn paginate(&self, mut events: Vec<Event>) -> Vec<Event> {
        sort_newest_first(&mut events);
        events
            .into_iter()
            .skip(self.offset)
            .take(self.effective_limit())
            .collect()
    }
}

/// Order events by timestamp descending, ties broken by id descending
pub fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by event stores
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventStoreError {
    #[error("Event not found: {event_id}")]
    NotFound { event_id: EventId },

    #[error("Event {event_id} cannot move from {from} to {to}")]
    InvalidTransition {
        event_id: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    #[error("Invalid event update: {message}")]
    InvalidUpdate { message: String },

    #[error("Event store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Event serialization failed: {message}")]
    Serialization { message: String },
}

// ============================================================================
// Storage Interface
// ============================================================================

/// Persistence for audit events
///
/// Implementations must make every read snapshot-consistent: a reader sees
/// either the complete previous version of an event or the complete new
/// one. [`Event::apply_update`] defines the only legal mutation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event, assigning its identifier and timestamp
    async fn create(&self, new_event: NewEvent) -> Result<Event, EventStoreError>;

    /// Apply a status update to an existing event
    async fn update(&self, event_id: EventId, update: EventUpdate)
        -> Result<Event, EventStoreError>;

    /// Fetch one event
    async fn get(&self, event_id: EventId) -> Result<Event, EventStoreError>;

    /// List events matching a filter, newest first
    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>, EventStoreError>;

    /// Count events matching a filter, ignoring pagination
    async fn count(&self, filter: &EventFilter) -> Result<usize, EventStoreError>;
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
