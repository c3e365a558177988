//! Evidence model shared by the accessors, fusion and synthesis stages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Score carried by every structured hit. Exact matches are certain.
pub const STRUCTURED_SCORE: f32 = 1.0;

/// Field name to value mapping carried by rows, hits and evidence
pub type Fields = BTreeMap<String, Value>;

/// Embedding granularity maintained by the ingestion pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One embedding per invoice
    Invoice,
    /// One embedding per invoice summarising its products
    Product,
    /// One embedding per line item
    LineItem,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Invoice, Granularity::Product, Granularity::LineItem];

    /// Value stored in the index `granularity` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Invoice => "invoice",
            Granularity::Product => "product",
            Granularity::LineItem => "line_item",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an evidence item came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Invoice,
    Product,
    LineItem,
    StructuredRow,
}

impl EvidenceKind {
    pub fn is_structured(&self) -> bool {
        matches!(self, EvidenceKind::StructuredRow)
    }
}

impl From<Granularity> for EvidenceKind {
    fn from(granularity: Granularity) -> Self {
        match granularity {
            Granularity::Invoice => EvidenceKind::Invoice,
            Granularity::Product => EvidenceKind::Product,
            Granularity::LineItem => EvidenceKind::LineItem,
        }
    }
}

/// Row returned by the structured store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRow {
    /// Order id, or a synthetic id such as `customer:<name>` for aggregates
    pub source_id: String,
    pub fields: Fields,
}

impl StructuredRow {
    pub fn new(source_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            source_id: source_id.into(),
            fields,
        }
    }
}

/// Payload and score returned by the semantic index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticHit {
    pub granularity: Granularity,
    /// Order id the embedded document belongs to
    pub source_id: String,
    pub payload: Fields,
    /// Normalized similarity, higher is better
    pub score: f32,
}

/// A single retrieved fact.
///
/// Produced only through the constructors below and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceItem {
    kind: EvidenceKind,
    fields: Fields,
    score: f32,
    source_id: String,
}

impl EvidenceItem {
    /// Wrap a structured row with the fixed exact-match score
    pub fn from_row(row: StructuredRow) -> Self {
        Self {
            kind: EvidenceKind::StructuredRow,
            fields: row.fields,
            score: STRUCTURED_SCORE,
            source_id: row.source_id,
        }
    }

    /// Wrap a semantic hit, clamping its score into 0..=1
    pub fn from_hit(hit: SemanticHit) -> Self {
        let score = if hit.score.is_finite() {
            hit.score.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            kind: hit.granularity.into(),
            fields: hit.payload,
            score,
            source_id: hit.source_id,
        }
    }

    pub fn kind(&self) -> EvidenceKind {
        self.kind
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Display form of a field, as it may appear in answer text
    pub fn text(&self, name: &str) -> Option<String> {
        self.field(name).and_then(render_value)
    }
}

/// Render a JSON value the way answers quote it: strings unquoted,
/// numbers in their stored form, arrays comma-joined. Null renders as nothing.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(values) => {
            let parts: Vec<String> = values.iter().filter_map(render_value).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Ordered, deduplicated evidence handed to the synthesizer.
///
/// Invariants: source ids are unique and scores are non-increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusedEvidenceSet {
    items: Vec<EvidenceItem>,
}

impl FusedEvidenceSet {
    /// Build from items that already satisfy the set invariants
    pub(crate) fn from_ranked(items: Vec<EvidenceItem>) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0].score >= w[1].score));
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EvidenceItem> {
        self.items.iter()
    }

    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    pub fn get(&self, source_id: &str) -> Option<&EvidenceItem> {
        self.items.iter().find(|item| item.source_id == source_id)
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.get(source_id).is_some()
    }

    /// Source ids in rank order
    pub fn source_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.source_id.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a FusedEvidenceSet {
    type Item = &'a EvidenceItem;
    type IntoIter = std::slice::Iter<'a, EvidenceItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_structured_rows_carry_fixed_score() {
        let item = EvidenceItem::from_row(StructuredRow::new(
            "10250",
            fields(&[("order_id", json!("10250"))]),
        ));
        assert_eq!(item.kind(), EvidenceKind::StructuredRow);
        assert_eq!(item.score(), STRUCTURED_SCORE);
        assert_eq!(item.source_id(), "10250");
    }

    #[test]
    fn test_semantic_scores_are_clamped() {
        let item = EvidenceItem::from_hit(SemanticHit {
            granularity: Granularity::Product,
            source_id: "10248".into(),
            payload: Fields::new(),
            score: 1.4,
        });
        assert_eq!(item.kind(), EvidenceKind::Product);
        assert_eq!(item.score(), 1.0);

        let nan = EvidenceItem::from_hit(SemanticHit {
            granularity: Granularity::Invoice,
            source_id: "10249".into(),
            payload: Fields::new(),
            score: f32::NAN,
        });
        assert_eq!(nan.score(), 0.0);
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&json!("Chai")), Some("Chai".to_string()));
        assert_eq!(render_value(&json!(14.4)), Some("14.4".to_string()));
        assert_eq!(render_value(&json!(["Chai", "Chang"])), Some("Chai, Chang".to_string()));
        assert_eq!(render_value(&Value::Null), None);
        assert_eq!(render_value(&json!("  ")), None);
    }

    #[test]
    fn test_granularity_names() {
        assert_eq!(Granularity::LineItem.as_str(), "line_item");
        assert_eq!(
            serde_json::to_value(Granularity::Product).unwrap(),
            json!("product")
        );
    }
}
