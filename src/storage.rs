use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;
use crate::subscription::Filter;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Id(String),
    Pubkey(String),
}

/// Capability surface of the search/storage engine. The relay core only
/// consumes these three operations; the engine behind them is deployed
/// and scaled separately.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store(&self, event: &Event) -> Result<(), StorageError>;

    /// Historical query: newest first, OR across filters, at most `limit`
    /// events.
    async fn query(&self, filters: &[Filter], limit: usize) -> Result<Vec<Event>, StorageError>;

    async fn delete(&self, target: DeleteTarget) -> Result<u64, StorageError>;
}

/// Process-local backend. Good enough for a single-node deployment and
/// for the dispatch-plane tests; anything bigger rides behind the same
/// trait.
#[derive(Default)]
pub struct MemoryStore {
    events: tokio::sync::RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn store(&self, event: &Event) -> Result<(), StorageError> {
        let mut events = self.events.write().await;
        // Duplicate submissions are idempotent.
        if events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        events.push(event.clone());
        Ok(())
    }

    async fn query(&self, filters: &[Filter], limit: usize) -> Result<Vec<Event>, StorageError> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| filters.iter().any(|f| f.interested_in_event(e)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete(&self, target: DeleteTarget) -> Result<u64, StorageError> {
        let mut events = self.events.write().await;
        let before = events.len();
        match &target {
            DeleteTarget::Id(id) => events.retain(|e| e.id != *id),
            DeleteTarget::Pubkey(pubkey) => events.retain(|e| e.pubkey != *pubkey),
        }
        Ok((before - events.len()) as u64)
    }
}
