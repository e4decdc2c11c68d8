//! # VM History Core
//!
//! Operation history and audit tracking for the VM management backend.
//!
//! This crate records the lifecycle of business operations (VM provisioning,
//! credential use, inbound API calls) as immutable audit events, and protects
//! stored credentials with symmetric encryption.
//!
//! ## Architecture
//!
//! - [`history`] defines the event model and the [`EventStore`] abstraction
//! - [`tracker`] wraps arbitrary async operations and records their outcome
//! - [`provisioning`] runs the external provisioning tool under the tracker
//! - [`masking`] redacts secret-like fields before anything is stored or logged
//! - [`credential_cipher`] encrypts credential payloads at rest
//! - [`statistics`] summarizes recorded history
//!
//! Infrastructure implementations of the store live in [`adapters`].
//!
//! ## Usage
//!
//! ```rust
//! use vm_history_core::{EventId, VmId};
//!
//! let event_id = EventId::new();
//! let vm_id: VmId = "42".parse().unwrap();
//! assert_eq!(vm_id.as_u64(), 42);
//! assert!(!event_id.as_str().is_empty());
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use ulid::Ulid;
pub use uuid::Uuid;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Unique identifier for history events
///
/// Uses ULID so identifiers sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Generate a new unique event ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of event ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
            expected: "ULID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Create new identifier
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get numeric value
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = s.trim().parse::<u64>().map_err(|_| ParseError::InvalidFormat {
                    expected: "positive integer".to_string(),
                    actual: s.to_string(),
                })?;
                Ok(Self::new(id))
            }
        }
    };
}

numeric_id!(
    /// Identifier of the user an operation is attributed to
    UserId
);

numeric_id!(
    /// Identifier of the virtual machine an operation touches
    VmId
);

numeric_id!(
    /// Identifier of the stored cloud credential an operation uses
    CredentialId
);

/// Identifier for tracing requests across system boundaries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s.parse::<Uuid>().map_err(|_| ParseError::InvalidFormat {
            expected: "UUID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(uuid))
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing UTC datetime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Calendar day (UTC) this timestamp falls on
    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    /// Midnight (UTC) of the day this timestamp falls on
    pub fn start_of_day(&self) -> Self {
        let midnight = self.0.date_naive().and_time(chrono::NaiveTime::MIN);
        Self(midnight.and_utc())
    }

    /// Subtract duration from timestamp
    pub fn subtract_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },

    #[error("Unknown value '{actual}' for {field}")]
    UnknownVariant { field: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Symmetric encryption of credential payloads at rest
pub mod credential_cipher;

/// Redaction of secret-like fields in structured data
pub mod masking;

/// Event model and the event store abstraction
pub mod history;

/// Aggregations over recorded history
pub mod statistics;

/// Generic operation instrumentation
pub mod tracker;

/// External provisioning tool execution under the tracker
pub mod provisioning;

/// Storage adapters for the event store
pub mod adapters;

// Re-export key types for convenience
pub use adapters::{FilesystemEventStore, InMemoryEventStore};
pub use credential_cipher::{
    CipherError, CredentialCipher, EncryptionConfig, EncryptionSecret, SealedCredential,
};
pub use history::{
    Event, EventFilter, EventStatus, EventStore, EventStoreError, EventType, EventUpdate,
    FailureKind, NewEvent,
};
pub use masking::{MaskingConfig, SensitiveDataMasker};
pub use provisioning::{
    ProvisioningCommand, ProvisioningConfig, ProvisioningExecutor, ProvisioningFailure,
    ProvisioningOutcome, ProvisioningRequest, ProvisioningResult, VariableInjection,
};
pub use statistics::{DailyStats, StatsPeriod, SuccessRatio};
pub use tracker::{
    ExtractError, OperationTracker, TrackedInvocation, TrackerConfig, TrackingSpec,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
