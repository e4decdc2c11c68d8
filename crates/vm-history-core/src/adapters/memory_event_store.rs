//! # In-Memory Event Store
//!
//! Thread-safe in-memory implementation for testing and development.

use crate::history::{Event, EventFilter, EventStore, EventStoreError, EventUpdate, NewEvent};
use crate::EventId;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Thread-safe in-memory event store
///
/// Events are replaced whole under the write lock, so readers always see a
/// complete version of each event.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<HashMap<EventId, Event>>>,
}

impl InMemoryEventStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.events.read().map(|events| events.len()).unwrap_or(0)
    }

    /// Check whether the store holds no events
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_poisoned() -> EventStoreError {
    EventStoreError::Unavailable {
        message: "event store lock poisoned".to_string(),
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create(&self, new_event: NewEvent) -> Result<Event, EventStoreError> {
        let event = Event::from_new(new_event)?;
        self.events
            .write()
            .map_err(|_| lock_poisoned())?
            .insert(event.id, event.clone());
        Ok(event)
    }

    async fn update(
        &self,
        event_id: EventId,
        update: EventUpdate,
    ) -> Result<Event, EventStoreError> {
        let mut events = self.events.write().map_err(|_| lock_poisoned())?;
        let current = events
            .get(&event_id)
            .ok_or(EventStoreError::NotFound { event_id })?;

        let next = current.apply_update(update)?;
        events.insert(event_id, next.clone());
        Ok(next)
    }

    async fn get(&self, event_id: EventId) -> Result<Event, EventStoreError> {
        self.events
            .read()
            .map_err(|_| lock_poisoned())?
            .get(&event_id)
            .cloned()
            .ok_or(EventStoreError::NotFound { event_id })
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>, EventStoreError> {
        let matching: Vec<Event> = {
            let events = self.events.read().map_err(|_| lock_poisoned())?;
            events
                .values()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect()
        }; // Lock dropped here

        Ok(filter.paginate(matching))
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize, EventStoreError> {
        let events = self.events.read().map_err(|_| lock_poisoned())?;
        Ok(events.values().filter(|event| filter.matches(event)).count())
    }
}

#[cfg(test)]
#[path = "memory_event_store_tests.rs"]
mod tests;
