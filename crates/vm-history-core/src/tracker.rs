//! # Operation Tracker
//!
//! Records the lifecycle of an arbitrary async operation as a history event.
//!
//! The tracker creates an event before the operation starts, optionally
//! marks it `IN_PROGRESS`, and completes it as `SUCCESS` or `FAILED` with the
//! measured duration once the operation resolves. Bookkeeping never changes
//! what the caller observes: the wrapped operation's value or error is
//! returned untouched, and store failures are logged and discarded.
//!
//! ## Cancellation
//!
//! [`TrackedInvocation`] is a drop guard. If it is dropped before
//! completion (for example because the owning future was cancelled) a
//! best-effort `FAILED` update with [`FailureKind::Cancelled`] is spawned on
//! the current runtime, bounded by
//! [`TrackerConfig::cancellation_update_timeout_ms`].
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use serde::Serialize;
//! use vm_history_core::{
//!     EventType, InMemoryEventStore, OperationTracker, SensitiveDataMasker, TrackerConfig,
//!     TrackingSpec, VmId,
//! };
//!
//! #[derive(Serialize)]
//! struct StartVm {
//!     vm_id: u64,
//! }
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryEventStore::new());
//! let tracker = OperationTracker::new(
//!     store.clone(),
//!     Arc::new(SensitiveDataMasker::default()),
//!     TrackerConfig::default(),
//! );
//! let spec = TrackingSpec::new(EventType::VmStart)
//!     .vm_id(|args: &StartVm| Ok(Some(VmId::new(args.vm_id))));
//!
//! let started: Result<bool, String> = tracker
//!     .run(&spec, StartVm { vm_id: 7 }, |_args| async { Ok(true) })
//!     .await;
//!
//! assert_eq!(started, Ok(true));
//! assert_eq!(store.len(), 1);
//! # });
//! ```

use crate::history::{
    EventStatus, EventStore, EventStoreError, EventType, EventUpdate, FailureKind, NewEvent,
};
use crate::masking::SensitiveDataMasker;
use crate::{CredentialId, EventId, UserId, VmId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Span};

/// Error returned by identifier extractors
pub type ExtractError = Box<dyn std::error::Error + Send + Sync>;

type Extractor<A, T> = Box<dyn Fn(&A) -> Result<Option<T>, ExtractError> + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

/// Tracker behaviour settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Upper bound for the best-effort update written when an operation is
    /// cancelled
    pub cancellation_update_timeout_ms: u64,
}

impl TrackerConfig {
    pub fn cancellation_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation_update_timeout_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cancellation_update_timeout_ms: 2_000,
        }
    }
}

// ============================================================================
// Tracking Rules
// ============================================================================

/// Describes how one kind of operation is recorded
///
/// `A` is the operation's argument type. Its serialized form becomes the
/// event's `parameters` after exclusions and masking are applied.
pub struct TrackingSpec<A> {
    event_type: EventType,
    event_type_from: Option<Extractor<A, EventType>>,
    user_id: Option<Extractor<A, UserId>>,
    vm_id: Option<Extractor<A, VmId>>,
    credential_id: Option<Extractor<A, CredentialId>>,
    exclude_params: Vec<String>,
    initial_status: EventStatus,
    record_in_progress: bool,
}

impl<A> TrackingSpec<A> {
    /// Record operations as `event_type`, starting `PENDING` and moving to
    /// `IN_PROGRESS` before the operation runs
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            event_type_from: None,
            user_id: None,
            vm_id: None,
            credential_id: None,
            exclude_params: Vec::new(),
            initial_status: EventStatus::Pending,
            record_in_progress: true,
        }
    }

    /// Pick the event type from the arguments, falling back to the fixed one
    pub fn event_type_from<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&A) -> Result<Option<EventType>, ExtractError> + Send + Sync + 'static,
    {
        self.event_type_from = Some(Box::new(extractor));
        self
    }

    pub fn user_id<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&A) -> Result<Option<UserId>, ExtractError> + Send + Sync + 'static,
    {
        self.user_id = Some(Box::new(extractor));
        self
    }

    pub fn vm_id<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&A) -> Result<Option<VmId>, ExtractError> + Send + Sync + 'static,
    {
        self.vm_id = Some(Box::new(extractor));
        self
    }

    pub fn credential_id<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&A) -> Result<Option<CredentialId>, ExtractError> + Send + Sync + 'static,
    {
        self.credential_id = Some(Box::new(extractor));
        self
    }

    /// Top-level argument fields left out of the recorded parameters
    pub fn exclude_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_params.extend(names.into_iter().map(Into::into));
        self
    }

    /// Status the event is created with
    pub fn initial_status(mut self, status: EventStatus) -> Self {
        self.initial_status = status;
        self
    }

    /// Whether a `PENDING` event is moved to `IN_PROGRESS` before the
    /// operation runs
    pub fn record_in_progress(mut self, enabled: bool) -> Self {
        self.record_in_progress = enabled;
        self
    }

    pub fn default_event_type(&self) -> EventType {
        self.event_type
    }

    fn resolve_event_type(&self, args: &A, span: &Span) -> EventType {
        extract("event_type", self.event_type_from.as_ref(), args, span)
            .unwrap_or(self.event_type)
    }
}

impl<A> fmt::Debug for TrackingSpec<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingSpec")
            .field("event_type", &self.event_type)
            .field("exclude_params", &self.exclude_params)
            .field("initial_status", &self.initial_status)
            .field("record_in_progress", &self.record_in_progress)
            .finish_non_exhaustive()
    }
}

/// Run an extractor, treating errors and panics as "no value"
fn extract<A, T>(
    field: &'static str,
    extractor: Option<&Extractor<A, T>>,
    args: &A,
    span: &Span,
) -> Option<T> {
    let extractor = extractor?;
    match catch_unwind(AssertUnwindSafe(|| extractor(args))) {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            debug!(parent: span, field, error = %error, "Identifier derivation failed");
            None
        }
        Err(_) => {
            warn!(parent: span, field, "Identifier derivation panicked");
            None
        }
    }
}

// ============================================================================
// Bookkeeping Failures
// ============================================================================

/// Failure of the tracker's own bookkeeping
///
/// Never surfaced to callers; logged and dropped.
#[derive(Debug, thiserror::Error)]
enum TrackingFailure {
    #[error("event store write failed: {0}")]
    Store(#[from] EventStoreError),

    #[error("snapshot could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn report(span: &Span, stage: &'static str, event_id: Option<EventId>, failure: &TrackingFailure) {
    match event_id {
        Some(event_id) => warn!(
            parent: span,
            stage,
            event_id = %event_id,
            error = %failure,
            "History bookkeeping failed; operation outcome unaffected"
        ),
        None => warn!(
            parent: span,
            stage,
            error = %failure,
            "History bookkeeping failed; operation outcome unaffected"
        ),
    }
}

/// Serialize, drop excluded keys, wrap non-objects under `key` and mask
fn snapshot<T: Serialize + ?Sized>(
    masker: &SensitiveDataMasker,
    value: &T,
    key: &str,
    exclude: &[String],
) -> Result<Option<Value>, TrackingFailure> {
    let value = match serde_json::to_value(value)? {
        Value::Null => return Ok(None),
        Value::Object(mut map) => {
            for name in exclude {
                map.remove(name);
            }
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert(key.to_string(), other);
            Value::Object(map)
        }
    };
    Ok(Some(masker.mask(&value)))
}

// ============================================================================
// Tracker
// ============================================================================

/// Wraps operations so their lifecycle lands in an [`EventStore`]
#[derive(Clone)]
pub struct OperationTracker {
    store: Arc<dyn EventStore>,
    masker: Arc<SensitiveDataMasker>,
    config: TrackerConfig,
    span: Span,
}

impl OperationTracker {
    pub fn new(
        store: Arc<dyn EventStore>,
        masker: Arc<SensitiveDataMasker>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            masker,
            config,
            span: info_span!("operation_tracker"),
        }
    }

    /// Use `span` as the parent of every bookkeeping log record
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn masker(&self) -> &SensitiveDataMasker {
        &self.masker
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Run `operation` with `args`, recording its lifecycle
    ///
    /// The returned value is exactly what `operation` produced. The error's
    /// `Display` form becomes the event's error message and its `Debug` form
    /// the error detail when the two differ.
    pub async fn run<A, T, E, F, Fut>(
        &self,
        spec: &TrackingSpec<A>,
        args: A,
        operation: F,
    ) -> Result<T, E>
    where
        A: Serialize,
        T: Serialize,
        E: fmt::Display + fmt::Debug,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let invocation = self.start(spec, &args).await;
        let outcome = operation(args).await;
        match &outcome {
            Ok(value) => invocation.succeed(value).await,
            Err(error) => invocation.fail_with_error(error).await,
        }
        outcome
    }

    /// Create the event and return a handle for completing it
    ///
    /// Timing starts before the event is written.
    pub async fn start<A: Serialize>(&self, spec: &TrackingSpec<A>, args: &A) -> TrackedInvocation {
        let started = Instant::now();
        let event_type = spec.resolve_event_type(args, &self.span);

        let parameters = snapshot(&self.masker, args, "args", &spec.exclude_params)
            .unwrap_or_else(|failure| {
                report(&self.span, "parameters", None, &failure);
                None
            });

        let new_event = NewEvent::pending(event_type)
            .with_status(spec.initial_status)
            .with_user(extract("user_id", spec.user_id.as_ref(), args, &self.span))
            .with_vm(extract("vm_id", spec.vm_id.as_ref(), args, &self.span))
            .with_credential(extract(
                "credential_id",
                spec.credential_id.as_ref(),
                args,
                &self.span,
            ))
            .with_parameters(parameters);

        let mut invocation = TrackedInvocation {
            store: self.store.clone(),
            masker: self.masker.clone(),
            span: self.span.clone(),
            cancellation_timeout: self.config.cancellation_timeout(),
            event_id: None,
            event_type,
            started,
            finished: false,
        };

        match self.store.create(new_event).await {
            Ok(event) => {
                invocation.event_id = Some(event.id);
                if spec.record_in_progress && event.status == EventStatus::Pending {
                    if let Err(error) = self.store.update(event.id, EventUpdate::in_progress()).await {
                        report(&self.span, "in_progress", Some(event.id), &error.into());
                    }
                }
                debug!(parent: &self.span, event_id = %event.id, %event_type, "Tracking operation");
            }
            Err(error) => report(&self.span, "create", None, &error.into()),
        }

        invocation
    }
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tracked Invocation
// ============================================================================

/// Handle to one tracked operation
///
/// Completing consumes the handle. Dropping it unfinished records the
/// operation as cancelled.
pub struct TrackedInvocation {
    store: Arc<dyn EventStore>,
    masker: Arc<SensitiveDataMasker>,
    span: Span,
    cancellation_timeout: Duration,
    event_id: Option<EventId>,
    event_type: EventType,
    started: Instant,
    finished: bool,
}

impl TrackedInvocation {
    /// Identifier of the recorded event, if the store accepted it
    pub fn event_id(&self) -> Option<EventId> {
        self.event_id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Time since the invocation started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Complete as `SUCCESS` with a masked snapshot of `result`
    ///
    /// Objects are recorded as-is; other values are wrapped as
    /// `{"result": value}`; `null` records no result.
    pub async fn succeed<T: Serialize + ?Sized>(mut self, result: &T) {
        let duration = self.elapsed().as_secs_f64();
        if let Some(event_id) = self.event_id {
            let recorded = snapshot(&self.masker, result, "result", &[]).unwrap_or_else(|failure| {
                report(&self.span, "result", Some(event_id), &failure);
                None
            });
            self.write(event_id, EventUpdate::success(recorded, duration))
                .await;
        }
        self.finished = true;
    }

    /// Complete as `FAILED` from an operation error
    pub async fn fail_with_error<E>(self, error: &E)
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        let message = error.to_string();
        let debug = format!("{:?}", error);
        let detail = (debug != message).then_some(debug);
        self.fail(FailureKind::Operation, message, detail).await;
    }

    /// Complete as `FAILED` with an explicit kind
    pub async fn fail(mut self, kind: FailureKind, message: impl Into<String>, detail: Option<String>) {
        let duration = self.elapsed().as_secs_f64();
        if let Some(event_id) = self.event_id {
            self.write(event_id, EventUpdate::failure(kind, message, detail, duration))
                .await;
        }
        self.finished = true;
    }

    async fn write(&self, event_id: EventId, update: EventUpdate) {
        let status = update.status;
        match self.store.update(event_id, update).await {
            Ok(_) => debug!(
                parent: &self.span,
                event_id = %event_id,
                %status,
                "Operation completed"
            ),
            Err(error) => report(&self.span, "complete", Some(event_id), &error.into()),
        }
    }
}

impl Drop for TrackedInvocation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(event_id) = self.event_id else {
            return;
        };

        let update = EventUpdate::failure(
            FailureKind::Cancelled,
            "operation cancelled before completion",
            None,
            self.elapsed().as_secs_f64(),
        );

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(parent: &self.span, event_id = %event_id, "No runtime available to record cancellation");
                return;
            }
        };

        let store = self.store.clone();
        let span = self.span.clone();
        let limit = self.cancellation_timeout;
        handle.spawn(async move {
            match tokio::time::timeout(limit, store.update(event_id, update)).await {
                Ok(Ok(_)) => debug!(parent: &span, event_id = %event_id, "Recorded cancelled operation"),
                Ok(Err(error)) => report(&span, "cancel", Some(event_id), &error.into()),
                Err(_) => warn!(
                    parent: &span,
                    event_id = %event_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Gave up recording cancelled operation"
                ),
            }
        });
    }
}

impl fmt::Debug for TrackedInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedInvocation")
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
