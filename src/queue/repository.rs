//! Storage contract for queued messages.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{QueueError, QueuedMessage, QueuedMessageStatus};
use crate::identity::MessageId;

/// CRUD over queued messages by id and status.
///
/// The storage engine behind it is the host's concern. Implementations
/// must be internally synchronized.
pub trait QueueRepository: Send + Sync {
    /// Insert or replace a message.
    fn upsert(&self, message: &QueuedMessage) -> Result<(), QueueError>;

    fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>, QueueError>;

    /// Remove a message, returning it if it existed.
    fn remove(&self, id: &MessageId) -> Result<Option<QueuedMessage>, QueueError>;

    /// All stored messages, in no particular order.
    fn list(&self) -> Result<Vec<QueuedMessage>, QueueError>;

    fn list_by_status(&self, status: QueuedMessageStatus) -> Result<Vec<QueuedMessage>, QueueError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.status() == status)
            .collect())
    }
}

/// Volatile repository for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct InMemoryQueueRepository {
    messages: RwLock<HashMap<MessageId, QueuedMessage>>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<MessageId, QueuedMessage>> {
        self.messages.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MessageId, QueuedMessage>> {
        self.messages.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl QueueRepository for InMemoryQueueRepository {
    fn upsert(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        self.write().insert(message.id, message.clone());
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>, QueueError> {
        Ok(self.read().get(id).cloned())
    }

    fn remove(&self, id: &MessageId) -> Result<Option<QueuedMessage>, QueueError> {
        Ok(self.write().remove(id))
    }

    fn list(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        Ok(self.read().values().cloned().collect())
    }
}
