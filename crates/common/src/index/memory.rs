//! Brute-force in-memory semantic index

use super::{IndexDocument, IndexWriter};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::engine::{SemanticHit, SemanticIndex, SemanticQuery};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

struct Entry {
    document: IndexDocument,
    embedding: Vec<f32>,
}

/// Cosine similarity over every stored document.
///
/// Inserting documents for an order replaces everything stored for that order.
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Embed and store documents, dropping earlier documents of the same orders
    pub async fn insert(&self, documents: Vec<IndexDocument>) -> Result<()> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != documents.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, got {}",
                    documents.len(),
                    embeddings.len()
                ),
            });
        }

        let orders: HashSet<&str> = documents.iter().map(|d| d.order_id.as_str()).collect();

        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !orders.contains(entry.document.order_id.as_str()));
        for (document, embedding) in documents.into_iter().zip(embeddings) {
            entries.insert(document.id.clone(), Entry { document, embedding });
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl IndexWriter for InMemoryIndex {
    async fn index_documents(&self, documents: Vec<IndexDocument>) -> Result<usize> {
        let count = documents.len();
        self.insert(documents).await?;
        Ok(count)
    }
}

#[async_trait]
impl SemanticIndex for InMemoryIndex {
    async fn search(&self, query: &SemanticQuery) -> Result<Vec<SemanticHit>> {
        let vector = self.embedder.embed(&query.embedding_text()).await?;
        let entries = self.entries.read().await;

        let mut hits: Vec<SemanticHit> = entries
            .values()
            .filter(|e| e.document.granularity == query.granularity)
            .filter(|e| match (query.user_id, e.document.user_id) {
                (Some(user), Some(owner)) => user == owner,
                _ => true,
            })
            .filter_map(|e| {
                let score = cosine_similarity(&vector, &e.embedding).clamp(0.0, 1.0);
                if score < query.min_score {
                    return None;
                }
                let mut payload = e.document.metadata.clone();
                payload.insert("content".into(), json!(e.document.content));
                payload.insert("order_id".into(), json!(e.document.order_id));
                Some(SemanticHit {
                    granularity: e.document.granularity,
                    source_id: e.document.order_id.clone(),
                    payload,
                    score,
                })
            })
            .collect();

        // HashMap order is arbitrary; break score ties by order id
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }
}
