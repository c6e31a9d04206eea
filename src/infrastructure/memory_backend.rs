use crate::domain::errors::MemoryError;
use crate::domain::ports::MemoryBackend;
use crate::domain::types::MemoryRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// In-process episodic memory store. Retrieval scores records by query-term
/// overlap; ordering is an implementation detail of this backend, which is
/// all the memory contract promises.
pub struct InMemoryMemoryBackend {
    records: RwLock<BTreeMap<String, MemoryRecord>>,
}

impl InMemoryMemoryBackend {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn records_for(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryMemoryBackend {
    async fn add(&self, record: MemoryRecord) -> Result<String, MemoryError> {
        let id = record.id.clone();
        self.records.write().await.insert(id.clone(), record);
        Ok(id)
    }

    async fn search(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let query_terms = terms(query);
        let records = self.records.read().await;

        let mut scored: Vec<(usize, &MemoryRecord)> = records
            .values()
            .filter(|record| record.user_id == user_id)
            .map(|record| {
                let record_terms = terms(&record.content);
                let overlap = query_terms.intersection(&record_terms).count();
                (overlap, record)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn update(
        &self,
        id: &str,
        new_content: String,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| MemoryError::NotFound {
            id: id.to_string(),
        })?;
        record.content = new_content;
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MemoryError::NotFound {
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, user_id: &str, content: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn search_is_scoped_to_user() {
        let backend = InMemoryMemoryBackend::new();
        backend
            .add(record("1", "alice", "AAPL bullish momentum trade"))
            .await
            .unwrap();
        backend
            .add(record("2", "bob", "AAPL bullish momentum trade"))
            .await
            .unwrap();

        let results = backend.search("AAPL bullish", "alice", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, "alice");
    }

    #[tokio::test]
    async fn search_caps_at_top_k_and_prefers_overlap() {
        let backend = InMemoryMemoryBackend::new();
        backend
            .add(record("1", "alice", "AAPL investment decision bullish signals"))
            .await
            .unwrap();
        backend
            .add(record("2", "alice", "AAPL earnings note"))
            .await
            .unwrap();
        backend
            .add(record("3", "alice", "TSLA short thesis"))
            .await
            .unwrap();

        let results = backend
            .search("AAPL investment decision bullish signals", "alice", 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "1");
    }

    #[tokio::test]
    async fn update_and_delete_report_not_found() {
        let backend = InMemoryMemoryBackend::new();
        assert!(matches!(
            backend.update("nope", "x".to_string(), None).await,
            Err(MemoryError::NotFound { .. })
        ));
        assert!(matches!(
            backend.delete("nope").await,
            Err(MemoryError::NotFound { .. })
        ));

        backend.add(record("1", "alice", "note")).await.unwrap();
        backend.update("1", "revised".to_string(), None).await.unwrap();
        backend.delete("1").await.unwrap();
        assert!(backend.is_empty().await);
    }
}
