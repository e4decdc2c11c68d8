//! # Infrastructure Adapters
//!
//! Infrastructure implementations of the event store interface.

pub mod filesystem_event_store;
pub mod memory_event_store;

pub use filesystem_event_store::FilesystemEventStore;
pub use memory_event_store::InMemoryEventStore;
