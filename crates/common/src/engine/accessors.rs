//! Interfaces of the two retrieval backends consumed by the engine

use super::constraints::StructuredConstraints;
use super::evidence::{Granularity, SemanticHit, StructuredRow};
use super::strategy::EntityRef;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Boost for hits belonging to the order the question names
pub const EXACT_ORDER_BOOST: f32 = 0.3;
/// Boost for invoice-level hits
pub const INVOICE_LEVEL_BOOST: f32 = 0.1;

/// Exact lookups against the relational store.
///
/// No matching rows is `Ok(vec![])`. Errors are reserved for constraints the
/// store cannot run and for the store being unreachable.
#[async_trait]
pub trait StructuredStore: Send + Sync {
    async fn lookup(&self, constraints: &StructuredConstraints) -> Result<Vec<StructuredRow>>;
}

/// One nearest-neighbour query at a single granularity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub text: String,
    pub granularity: Granularity,
    pub top_k: usize,
    /// Hits scoring below this are dropped
    pub min_score: f32,
    pub user_id: Option<i32>,
    /// Entity the question is about, used to sharpen the query text
    pub entity: Option<EntityRef>,
}

impl SemanticQuery {
    pub fn new(text: impl Into<String>, granularity: Granularity, top_k: usize) -> Self {
        Self {
            text: text.into(),
            granularity,
            top_k,
            min_score: 0.0,
            user_id: None,
            entity: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_user(mut self, user_id: Option<i32>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_entity(mut self, entity: Option<EntityRef>) -> Self {
        self.entity = entity;
        self
    }

    /// Text to embed: the question prefixed with the entity it names
    pub fn embedding_text(&self) -> String {
        match &self.entity {
            Some(entity) => format!("{} {}", entity.describe(), self.text),
            None => self.text.clone(),
        }
    }
}

/// Similarity search over the embedding index.
///
/// Scores are normalized to 0..=1, higher is better. Hits under
/// `query.min_score` are never returned.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn search(&self, query: &SemanticQuery) -> Result<Vec<SemanticHit>>;
}

/// Boost exact order matches and invoice-level hits, then re-sort.
///
/// The sort is stable so equal scores keep index order.
pub fn rerank(hits: &mut [SemanticHit], order_id: Option<&str>) {
    for hit in hits.iter_mut() {
        let mut boost = 0.0;
        if order_id.is_some_and(|id| hit.source_id == id) {
            boost += EXACT_ORDER_BOOST;
        }
        if hit.granularity == Granularity::Invoice {
            boost += INVOICE_LEVEL_BOOST;
        }
        hit.score = (hit.score + boost).min(1.0);
    }

    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evidence::Fields;

    fn hit(source: &str, granularity: Granularity, score: f32) -> SemanticHit {
        SemanticHit {
            granularity,
            source_id: source.to_string(),
            payload: Fields::new(),
            score,
        }
    }

    #[test]
    fn test_embedding_text_prefix() {
        let query = SemanticQuery::new("what was shipped?", Granularity::Invoice, 5)
            .with_entity(Some(EntityRef::Order("10250".into())));
        assert_eq!(query.embedding_text(), "Order ID 10250 what was shipped?");

        let plain = SemanticQuery::new("chai", Granularity::Product, 5);
        assert_eq!(plain.embedding_text(), "chai");
    }

    #[test]
    fn test_rerank_boosts() {
        let mut hits = vec![
            hit("10248", Granularity::Product, 0.8),
            hit("10250", Granularity::Product, 0.6),
            hit("10249", Granularity::Invoice, 0.75),
        ];
        rerank(&mut hits, Some("10250"));

        let order: Vec<&str> = hits.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(order, vec!["10250", "10249", "10248"]);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
        assert!((hits[1].score - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_rerank_clamps_to_one() {
        let mut hits = vec![hit("10250", Granularity::Invoice, 0.95)];
        rerank(&mut hits, Some("10250"));
        assert_eq!(hits[0].score, 1.0);
    }
}
