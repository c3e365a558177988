//! Evidence fusion for combining structured and semantic results
//!
//! Unlike rank fusion, scores are kept as-is:
//! - Structured rows are exact matches and carry the maximal score
//! - Semantic hits keep their normalized similarity
//! - One item survives per source id, the highest scoring one
//! - Exact score ties go to the structured row

use super::evidence::{EvidenceItem, FusedEvidenceSet, SemanticHit, StructuredRow};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Fusion parameters
#[derive(Debug, Clone)]
pub struct EvidenceFusion {
    /// Maximum items handed to synthesis
    pub limit: usize,
}

impl Default for EvidenceFusion {
    fn default() -> Self {
        Self { limit: 15 }
    }
}

impl EvidenceFusion {
    /// Create with a custom cap
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    /// Fuse structured rows and semantic hits into one ranked set
    pub fn fuse(&self, rows: Vec<StructuredRow>, hits: Vec<SemanticHit>) -> FusedEvidenceSet {
        let items = rows
            .into_iter()
            .map(EvidenceItem::from_row)
            .chain(hits.into_iter().map(EvidenceItem::from_hit))
            .collect();

        self.fuse_items(items)
    }

    /// Rank, deduplicate and cap already-converted evidence.
    ///
    /// The sort is stable, so items with equal scores and equal kinds keep
    /// their input order.
    pub fn fuse_items(&self, mut items: Vec<EvidenceItem>) -> FusedEvidenceSet {
        items.sort_by(rank_order);

        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
        items.retain(|item| seen.insert(item.source_id().to_owned()));

        items.truncate(self.limit);

        tracing::debug!(fused = items.len(), "Evidence fused");
        FusedEvidenceSet::from_ranked(items)
    }
}

/// Descending score, structured first on exact ties
fn rank_order(a: &EvidenceItem, b: &EvidenceItem) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| b.kind().is_structured().cmp(&a.kind().is_structured()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evidence::{EvidenceKind, Fields, Granularity, STRUCTURED_SCORE};
    use serde_json::json;

    fn row(source: &str) -> StructuredRow {
        let mut fields = Fields::new();
        fields.insert("order_id".into(), json!(source));
        StructuredRow::new(source, fields)
    }

    fn hit(source: &str, score: f32) -> SemanticHit {
        let mut payload = Fields::new();
        payload.insert("order_id".into(), json!(source));
        SemanticHit {
            granularity: Granularity::Product,
            source_id: source.to_string(),
            payload,
            score,
        }
    }

    #[test]
    fn test_single_structured_row() {
        let fusion = EvidenceFusion::default();
        let fused = fusion.fuse(vec![row("10250")], vec![]);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused.items()[0].score(), STRUCTURED_SCORE);
        assert_eq!(fused.source_ids(), vec!["10250"]);
    }

    #[test]
    fn test_duplicates_keep_highest_score() {
        let fusion = EvidenceFusion::default();
        let fused = fusion.fuse(
            vec![],
            vec![hit("10248", 0.4), hit("10249", 0.6), hit("10248", 0.9)],
        );

        assert_eq!(fused.source_ids(), vec!["10248", "10249"]);
        assert_eq!(fused.get("10248").unwrap().score(), 0.9);
    }

    #[test]
    fn test_structured_wins_exact_tie() {
        let fusion = EvidenceFusion::default();
        let fused = fusion.fuse(vec![row("10250")], vec![hit("10250", 1.0), hit("10251", 1.0)]);

        assert_eq!(fused.len(), 2);
        assert_eq!(fused.items()[0].source_id(), "10250");
        assert_eq!(fused.items()[0].kind(), EvidenceKind::StructuredRow);
        assert_eq!(fused.items()[1].source_id(), "10251");
    }

    #[test]
    fn test_equal_scores_preserve_input_order() {
        let fusion = EvidenceFusion::default();
        let fused = fusion.fuse(
            vec![],
            vec![hit("10300", 0.7), hit("10100", 0.7), hit("10200", 0.7)],
        );

        assert_eq!(fused.source_ids(), vec!["10300", "10100", "10200"]);
    }

    #[test]
    fn test_input_side_does_not_change_result() {
        let fusion = EvidenceFusion::default();
        let rows = vec![row("10250"), row("10251")];
        let hits = vec![hit("10250", 1.0), hit("10252", 0.8), hit("10251", 0.3)];

        let structured_first = fusion.fuse(rows.clone(), hits.clone());

        let semantic_first: Vec<EvidenceItem> = hits
            .into_iter()
            .map(EvidenceItem::from_hit)
            .chain(rows.into_iter().map(EvidenceItem::from_row))
            .collect();
        let semantic_first = fusion.fuse_items(semantic_first);

        assert_eq!(structured_first, semantic_first);
    }

    #[test]
    fn test_limit_caps_output() {
        let fusion = EvidenceFusion::new(3);
        let hits = (0..10).map(|i| hit(&format!("{}", 10000 + i), i as f32 / 10.0)).collect();
        let fused = fusion.fuse(vec![], hits);

        assert_eq!(fused.len(), 3);
        assert_eq!(fused.source_ids(), vec!["10009", "10008", "10007"]);
    }

    #[test]
    fn test_uniqueness_and_ordering_over_many_inputs() {
        let fusion = EvidenceFusion::new(50);
        // Small linear congruential sequence so the inputs are varied but repeatable
        let mut state: u32 = 7;
        let mut next = || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            state >> 16
        };

        for _ in 0..25 {
            let rows: Vec<StructuredRow> = (0..(next() % 4))
                .map(|_| row(&format!("{}", 10240 + next() % 8)))
                .collect();
            let hits: Vec<SemanticHit> = (0..(next() % 12))
                .map(|_| hit(&format!("{}", 10240 + next() % 8), (next() % 11) as f32 / 10.0))
                .collect();

            let fused = fusion.fuse(rows, hits);

            let mut seen = HashSet::new();
            for item in &fused {
                assert!(seen.insert(item.source_id().to_string()));
            }
            for pair in fused.items().windows(2) {
                assert!(pair[0].score() >= pair[1].score());
            }
        }
    }
}
