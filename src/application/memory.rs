use crate::domain::errors::MemoryError;
use crate::domain::ports::MemoryBackend;
use crate::domain::types::MemoryRecord;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// User-scoped episodic memory facade. Every record belongs to exactly one
/// agent (`user_id`); callers searching or mutating pass the scope explicitly.
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    pub async fn add(
        &self,
        content: impl Into<String>,
        user_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, MemoryError> {
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        };
        let id = self.backend.add(record).await?;
        debug!("Memory: added record {}", id);
        Ok(id)
    }

    /// Returns at most `top_k` records scoped to `user_id`. Ordering is
    /// backend-defined and not part of the contract.
    pub async fn search(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.backend.search(query, user_id, top_k).await
    }

    pub async fn update(
        &self,
        id: &str,
        new_content: impl Into<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), MemoryError> {
        self.backend.update(id, new_content.into(), metadata).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        self.backend.delete(id).await
    }
}
