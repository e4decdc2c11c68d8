//! # Filesystem Event Store
//!
//! Local filesystem implementation of the EventStore trait for development
//! and single-node deployments.

use crate::history::{Event, EventFilter, EventStore, EventStoreError, EventUpdate, NewEvent};
use crate::EventId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Filesystem-based event store
///
/// Stores each event as one JSON document named after its identifier.
/// Documents are written to a temporary file and renamed into place, so a
/// reader never observes a partially written event.
///
/// # Examples
///
/// ```no_run
/// use vm_history_core::adapters::FilesystemEventStore;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FilesystemEventStore::new(PathBuf::from("./data/history")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemEventStore {
    base_path: PathBuf,
    // Serializes read-modify-write cycles on updates
    write_lock: Arc<Mutex<()>>,
}

impl FilesystemEventStore {
    /// Create new filesystem event store
    ///
    /// # Errors
    ///
    /// Returns error if base path cannot be created or accessed.
    pub async fn new(base_path: PathBuf) -> Result<Self, EventStoreError> {
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| unavailable("Failed to create base directory", e))?;

        Ok(Self {
            base_path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Directory holding the event documents
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn event_path(&self, event_id: &EventId) -> PathBuf {
        self.base_path.join(format!("{}.json", event_id))
    }

    async fn read_event(&self, path: &Path) -> Result<Event, EventStoreError> {
        let json = fs::read_to_string(path)
            .await
            .map_err(|e| unavailable("Failed to read event", e))?;

        serde_json::from_str(&json).map_err(|e| EventStoreError::Serialization {
            message: format!("Failed to deserialize {}: {}", path.display(), e),
        })
    }

    async fn write_event(&self, event: &Event) -> Result<(), EventStoreError> {
        let json =
            serde_json::to_vec_pretty(event).map_err(|e| EventStoreError::Serialization {
                message: format!("Failed to serialize event: {}", e),
            })?;

        // Write to temporary file first (atomic write pattern)
        let final_path = self.event_path(&event.id);
        let temp_path = final_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| unavailable("Failed to create temp file", e))?;
        file.write_all(&json)
            .await
            .map_err(|e| unavailable("Failed to write event", e))?;
        file.flush()
            .await
            .map_err(|e| unavailable("Failed to flush file", e))?;
        drop(file);

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| unavailable("Failed to rename temp file", e))?;

        debug!(event_id = %event.id, status = %event.status, "Event written");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Event>, EventStoreError> {
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| unavailable("Failed to read store directory", e))?;

        let mut events = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable("Failed to read directory entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            events.push(self.read_event(&path).await?);
        }

        Ok(events)
    }
}

fn unavailable(context: &str, error: std::io::Error) -> EventStoreError {
    EventStoreError::Unavailable {
        message: format!("{}: {}", context, error),
    }
}

#[async_trait]
impl EventStore for FilesystemEventStore {
    async fn create(&self, new_event: NewEvent) -> Result<Event, EventStoreError> {
        let event = Event::from_new(new_event)?;
        self.write_event(&event).await?;
        Ok(event)
    }

    async fn update(
        &self,
        event_id: EventId,
        update: EventUpdate,
    ) -> Result<Event, EventStoreError> {
        let _guard = self.write_lock.lock().await;

        let current = self.get(event_id).await?;
        let next = current.apply_update(update)?;
        self.write_event(&next).await?;
        Ok(next)
    }

    async fn get(&self, event_id: EventId) -> Result<Event, EventStoreError> {
        let path = self.event_path(&event_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(EventStoreError::NotFound { event_id });
        }

        self.read_event(&path).await
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>, EventStoreError> {
        let matching = self
            .load_all()
            .await?
            .into_iter()
            .filter(|event| filter.matches(event))
            .collect();

        Ok(filter.paginate(matching))
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize, EventStoreError> {
        Ok(self
            .load_all()
            .await?
            .iter()
            .filter(|event| filter.matches(event))
            .count())
    }
}

#[cfg(test)]
#[path = "filesystem_event_store_tests.rs"]
mod tests;
