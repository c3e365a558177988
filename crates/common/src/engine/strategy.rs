//! Strategy classifier - decides how a question is answered
//!
//! Provides:
//! - Signal extraction (identifiers, aggregates, descriptive terms, follow-ups)
//! - An ordered rule table mapping signals to a retrieval strategy
//! - Follow-up resolution against the conversation history
//! - Semantic granularity planning

use super::evidence::Granularity;
use super::memory::ConversationTurn;
use serde::{Deserialize, Serialize};

/// Retrieval strategy chosen for one turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Exact lookup against the relational store
    Structured,
    /// Similarity search over the embedding index
    Semantic,
    /// Both, fused
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Structured => "structured",
            Strategy::Semantic => "semantic",
            Strategy::Hybrid => "hybrid",
        }
    }

    pub fn uses_structured(&self) -> bool {
        matches!(self, Strategy::Structured | Strategy::Hybrid)
    }

    pub fn uses_semantic(&self) -> bool {
        matches!(self, Strategy::Semantic | Strategy::Hybrid)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity a question is about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EntityRef {
    /// Order / invoice number, e.g. `10250`
    Order(String),
    /// Five letter customer code, e.g. `VINET`
    CustomerCode(String),
    /// Contact name, e.g. `Paul Henriot`
    CustomerName(String),
}

impl EntityRef {
    pub fn order_id(&self) -> Option<&str> {
        match self {
            EntityRef::Order(id) => Some(id),
            _ => None,
        }
    }

    /// Phrase prepended to semantic queries
    pub fn describe(&self) -> String {
        match self {
            EntityRef::Order(id) => format!("Order ID {}", id),
            EntityRef::CustomerCode(code) => format!("Customer ID {}", code),
            EntityRef::CustomerName(name) => format!("Customer {}", name),
        }
    }
}

/// Everything the rules look at
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Signals {
    /// Explicit identifier, or one inherited from the previous turn
    pub identifier: Option<EntityRef>,
    /// Capitalised multi-word name that is not an explicit identifier
    pub mentioned_name: Option<String>,
    /// Totals, counts, averages, rankings
    pub aggregate: bool,
    /// Dates, years, months, ranges
    pub temporal: bool,
    /// Product, category or fuzzy-matching vocabulary
    pub descriptive: bool,
    /// Quantity or unit price vocabulary
    pub line_level: bool,
    /// Anaphora or ellipsis pointing at an earlier turn
    pub follow_up: bool,
}

impl Signals {
    fn structured_intent(&self) -> bool {
        self.aggregate || self.temporal
    }
}

/// Result of classification with the reasoning that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub strategy: Strategy,
    /// Name of the rule that fired
    pub rule: &'static str,
    pub signals: Signals,
    /// True when the identifier came from history
    pub inherited: bool,
}

impl Classification {
    /// Entity the turn resolved to, if any
    pub fn entity(&self) -> Option<&EntityRef> {
        self.signals.identifier.as_ref()
    }

    /// Entity used to sharpen semantic queries: the identifier, else a mentioned name
    pub fn focus(&self) -> Option<EntityRef> {
        self.signals.identifier.clone().or_else(|| {
            self.signals
                .mentioned_name
                .clone()
                .map(EntityRef::CustomerName)
        })
    }

    /// Granularities to search when the strategy uses the semantic index
    pub fn granularities(&self) -> Vec<Granularity> {
        let mut planned = Vec::with_capacity(3);
        if self.signals.descriptive {
            planned.push(Granularity::Product);
        }
        if self.signals.line_level {
            planned.push(Granularity::LineItem);
        }
        if planned.is_empty() || self.strategy == Strategy::Hybrid {
            planned.push(Granularity::Invoice);
        }
        planned
    }
}

struct Rule {
    name: &'static str,
    strategy: Strategy,
    applies: fn(&Signals) -> bool,
}

fn has_identifier(s: &Signals) -> bool {
    s.identifier.is_some()
}

fn purely_aggregate(s: &Signals) -> bool {
    s.structured_intent() && !s.descriptive
}

fn purely_descriptive(s: &Signals) -> bool {
    s.descriptive && s.mentioned_name.is_none() && !s.structured_intent()
}

/// Evaluated top to bottom, first match wins, otherwise `Hybrid`
const RULES: [Rule; 3] = [
    Rule {
        name: "identifier",
        strategy: Strategy::Structured,
        applies: has_identifier,
    },
    Rule {
        name: "aggregate",
        strategy: Strategy::Structured,
        applies: purely_aggregate,
    },
    Rule {
        name: "descriptive",
        strategy: Strategy::Semantic,
        applies: purely_descriptive,
    },
];

const FALLBACK_RULE: &str = "fallback";

const AGGREGATE_PHRASES: &[&str] = &[
    "how many", "how much", "number of", "total", "totals", "sum", "count", "average",
    "avg", "mean", "most", "top", "highest", "lowest", "largest", "smallest", "spent",
    "spend", "revenue",
];

const TEMPORAL_PHRASES: &[&str] = &[
    "between", "since", "before", "after", "until", "during", "date", "dates", "dated",
    "year", "month", "january", "february", "march", "april", "may", "june", "july",
    "august", "september", "october", "november", "december",
];

const DESCRIPTIVE_PHRASES: &[&str] = &[
    "product", "products", "item", "items", "category", "categories", "similar", "like",
    "related", "kind", "kinds", "type", "types", "contain", "contains", "containing",
    "include", "includes", "including", "mention", "mentions", "beverage", "beverages",
    "condiment", "condiments", "confections", "dairy", "seafood", "cheese", "sauce",
    "tea", "coffee", "chocolate", "meat", "grains",
];

const LINE_LEVEL_PHRASES: &[&str] = &[
    "quantity", "quantities", "unit price", "units", "line item", "line items",
    "per unit", "qty",
];

const FOLLOW_UP_PHRASES: &[&str] = &[
    "it", "its", "them", "they", "their", "those", "these", "that order", "this order",
    "that invoice", "this invoice", "same order", "same customer", "that customer",
    "this customer", "he", "she", "his", "her",
];

const FOLLOW_UP_OPENERS: &[&str] = &["and ", "what about ", "how about ", "also "];

/// Words after which a five digit number is an amount, not an id
const AMOUNT_CUES: &[&str] = &[
    "over", "under", "above", "below", "than", "exceeding", "least", "most",
];

const ORDER_WORDS: &[&str] = &["order", "invoice"];

const ID_FILLERS: &[&str] = &["id", "no", "no.", "number", "num", "#", "nr"];

#[derive(Debug)]
struct Token<'a> {
    raw: &'a str,
    lower: String,
}

fn tokenize(question: &str) -> Vec<Token<'_>> {
    question
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, '?' | '!' | ',' | ';' | ':' | '"' | '\'' | '(' | ')' | '.')))
        .filter(|word| !word.is_empty())
        .map(|raw| Token {
            raw,
            lower: raw.to_lowercase(),
        })
        .collect()
}

/// Lowercased, single-spaced, padded so phrases match on word boundaries
fn normalize(tokens: &[Token<'_>]) -> String {
    let mut out = String::from(" ");
    for token in tokens {
        out.push_str(&token.lower);
        out.push(' ');
    }
    out
}

fn has_phrase(normalized: &str, phrases: &[&str]) -> bool {
    phrases
        .iter()
        .any(|phrase| normalized.contains(&format!(" {} ", phrase)))
}

fn is_order_number(s: &str) -> bool {
    (4..=6).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// Stored order ids are plain numbers
pub fn looks_like_order_id(s: &str) -> bool {
    is_order_number(s)
}

fn is_customer_code(s: &str) -> bool {
    s.len() == 5 && s.bytes().all(|b| b.is_ascii_uppercase())
}

fn is_title_case(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            let rest: Vec<char> = chars.collect();
            !rest.is_empty() && rest.iter().all(|c| c.is_ascii_lowercase() || *c == '-')
        }
        _ => false,
    }
}

/// Rule-based question classifier.
///
/// Holds no state; `classify` depends only on its arguments.
#[derive(Debug, Clone, Default)]
pub struct StrategyClassifier;

impl StrategyClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Pick a strategy for `question` given the turns so far (oldest first)
    pub fn classify(&self, question: &str, history: &[ConversationTurn]) -> Strategy {
        self.classify_detailed(question, history).strategy
    }

    /// Same as [`classify`](Self::classify) but keeps the signals and the rule that fired
    pub fn classify_detailed(&self, question: &str, history: &[ConversationTurn]) -> Classification {
        let mut signals = self.extract_signals(question);

        let mut inherited = false;
        if signals.identifier.is_none() && signals.follow_up {
            if let Some(entity) = inherited_entity(history) {
                tracing::debug!(entity = ?entity, "Follow-up inherits previous entity");
                signals.identifier = Some(entity);
                inherited = true;
            }
        }

        let (strategy, rule) = RULES
            .iter()
            .find(|rule| (rule.applies)(&signals))
            .map(|rule| (rule.strategy, rule.name))
            .unwrap_or((Strategy::Hybrid, FALLBACK_RULE));

        tracing::debug!(strategy = %strategy, rule, inherited, "Question classified");

        Classification {
            strategy,
            rule,
            signals,
            inherited,
        }
    }

    fn extract_signals(&self, question: &str) -> Signals {
        let tokens = tokenize(question);
        let normalized = normalize(&tokens);
        let has_lowercase = question.chars().any(|c| c.is_ascii_lowercase());

        let identifier = find_identifier(&tokens, has_lowercase);
        let mentioned_name = if identifier.is_none() {
            find_capitalised_name(&tokens)
        } else {
            None
        };

        let follow_up = has_phrase(&normalized, FOLLOW_UP_PHRASES)
            || FOLLOW_UP_OPENERS
                .iter()
                .any(|opener| normalized.trim_start().starts_with(opener));

        Signals {
            identifier,
            mentioned_name,
            aggregate: has_phrase(&normalized, AGGREGATE_PHRASES),
            temporal: has_phrase(&normalized, TEMPORAL_PHRASES) || has_year(&tokens),
            descriptive: has_phrase(&normalized, DESCRIPTIVE_PHRASES),
            line_level: has_phrase(&normalized, LINE_LEVEL_PHRASES),
            follow_up,
        }
    }
}

fn has_year(tokens: &[Token<'_>]) -> bool {
    tokens.iter().any(|t| {
        t.raw.len() == 4
            && t.raw.bytes().all(|b| b.is_ascii_digit())
            && (t.raw.starts_with("19") || t.raw.starts_with("20"))
    }) || tokens.iter().any(|t| {
        // ISO dates
        let parts: Vec<&str> = t.raw.split('-').collect();
        parts.len() == 3 && parts[0].len() == 4 && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn find_identifier(tokens: &[Token<'_>], has_lowercase: bool) -> Option<EntityRef> {
    // "order 10250", "invoice no. 10250", "Order ID 10250", "order #10250"
    for (i, token) in tokens.iter().enumerate() {
        if let Some(rest) = ORDER_WORDS
            .iter()
            .find_map(|w| token.lower.strip_prefix(w))
        {
            let inline = rest.trim_start_matches('#');
            if !inline.is_empty() && is_order_number(inline) {
                return Some(EntityRef::Order(inline.to_string()));
            }
            if !rest.is_empty() && !rest.starts_with('#') {
                continue;
            }
            let mut j = i + 1;
            while j < tokens.len() && j <= i + 3 && ID_FILLERS.contains(&tokens[j].lower.as_str()) {
                j += 1;
            }
            if let Some(next) = tokens.get(j) {
                let candidate = next.raw.trim_start_matches('#');
                if is_order_number(candidate) {
                    return Some(EntityRef::Order(candidate.to_string()));
                }
            }
        }
    }

    // "customer VINET", "customer id ALFKI"
    for (i, token) in tokens.iter().enumerate() {
        if token.lower != "customer" {
            continue;
        }
        let mut j = i + 1;
        while j < tokens.len() && matches!(tokens[j].lower.as_str(), "id" | "code" | "named" | "name") {
            j += 1;
        }
        let Some(next) = tokens.get(j) else { continue };
        if is_customer_code(next.raw) {
            return Some(EntityRef::CustomerCode(next.raw.to_string()));
        }
        let name: Vec<&str> = tokens[j..]
            .iter()
            .take_while(|t| is_title_case(t.raw))
            .map(|t| t.raw)
            .collect();
        if name.len() >= 2 {
            return Some(EntityRef::CustomerName(name.join(" ")));
        }
    }

    // Bare five digit ids, unless they read as an amount
    for (i, token) in tokens.iter().enumerate() {
        if token.raw.len() == 5
            && token.raw.bytes().all(|b| b.is_ascii_digit())
            && !token.raw.starts_with('$')
        {
            let after_cue = i > 0 && AMOUNT_CUES.contains(&tokens[i - 1].lower.as_str());
            if !after_cue {
                return Some(EntityRef::Order(token.raw.to_string()));
            }
        }
    }

    // A standalone customer code only counts when the question isn't shouted
    if has_lowercase {
        if let Some(code) = tokens.iter().find(|t| is_customer_code(t.raw)) {
            return Some(EntityRef::CustomerCode(code.raw.to_string()));
        }
    }

    None
}

/// First run of two or more title-case words that does not open the question
fn find_capitalised_name(tokens: &[Token<'_>]) -> Option<String> {
    let mut i = 1;
    while i < tokens.len() {
        if is_title_case(tokens[i].raw) {
            let run: Vec<&str> = tokens[i..]
                .iter()
                .take_while(|t| is_title_case(t.raw))
                .map(|t| t.raw)
                .collect();
            if run.len() >= 2 {
                return Some(run.join(" "));
            }
            i += run.len();
        } else {
            i += 1;
        }
    }
    None
}

/// Entity of the most recent turn, or the single order it cited
fn inherited_entity(history: &[ConversationTurn]) -> Option<EntityRef> {
    let last = history.last()?;
    if let Some(entity) = &last.resolved_entity {
        return Some(entity.clone());
    }
    match last.evidence_ids.as_slice() {
        [only] if is_order_number(only) => Some(EntityRef::Order(only.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(question: &str, entity: Option<EntityRef>, evidence: &[&str]) -> ConversationTurn {
        ConversationTurn {
            question: question.to_string(),
            strategy: Strategy::Structured,
            evidence_ids: evidence.iter().map(|s| s.to_string()).collect(),
            answer: "answer".to_string(),
            resolved_entity: entity,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_order_identifier_is_structured() {
        let classifier = StrategyClassifier::new();
        let questions = [
            "Show me invoice with Order ID 10250",
            "what is the total for order 10248?",
            "Details of invoice #10251 please",
            "order#10300 shipping address",
            "Who placed order no. 10260",
            "Which products are in order 10249?",
        ];
        for question in questions {
            let result = classifier.classify_detailed(question, &[]);
            assert_eq!(result.strategy, Strategy::Structured, "{}", question);
            assert_eq!(result.rule, "identifier", "{}", question);
            assert!(matches!(result.entity(), Some(EntityRef::Order(_))), "{}", question);
        }
    }

    #[test]
    fn test_identifier_value() {
        let classifier = StrategyClassifier::new();
        let result = classifier.classify_detailed("Show me invoice with Order ID 10250", &[]);
        assert_eq!(result.entity(), Some(&EntityRef::Order("10250".into())));
    }

    #[test]
    fn test_customer_code_and_name() {
        let classifier = StrategyClassifier::new();

        let code = classifier.classify_detailed("List invoices for customer VINET", &[]);
        assert_eq!(code.strategy, Strategy::Structured);
        assert_eq!(code.entity(), Some(&EntityRef::CustomerCode("VINET".into())));

        let name = classifier.classify_detailed("Show orders for customer Paul Henriot", &[]);
        assert_eq!(name.strategy, Strategy::Structured);
        assert_eq!(name.entity(), Some(&EntityRef::CustomerName("Paul Henriot".into())));
    }

    #[test]
    fn test_descriptive_only_is_semantic() {
        let classifier = StrategyClassifier::new();
        let questions = [
            "Which orders contain Chai products?",
            "find invoices with seafood items",
            "orders similar to cheese and dairy",
            "what kind of beverages do people buy",
        ];
        for question in questions {
            assert_eq!(classifier.classify(question, &[]), Strategy::Semantic, "{}", question);
        }
    }

    #[test]
    fn test_aggregate_is_structured() {
        let classifier = StrategyClassifier::new();
        assert_eq!(classifier.classify("How many orders did we get in 1997?", &[]), Strategy::Structured);
        assert_eq!(classifier.classify("How much did Paul Henriot spend?", &[]), Strategy::Structured);
        assert_eq!(classifier.classify("Total revenue between 1996-07-01 and 1996-12-31", &[]), Strategy::Structured);
    }

    #[test]
    fn test_mixed_signals_are_hybrid() {
        let classifier = StrategyClassifier::new();
        // aggregate plus product qualifier
        assert_eq!(classifier.classify("How many orders contain Chai?", &[]), Strategy::Hybrid);
        // named entity plus descriptive concept
        assert_eq!(
            classifier.classify("Did Paul Henriot buy any cheese products?", &[]),
            Strategy::Hybrid
        );
        // nothing recognisable
        assert_eq!(classifier.classify("tell me something", &[]), Strategy::Hybrid);
    }

    #[test]
    fn test_amount_is_not_an_order_id() {
        let classifier = StrategyClassifier::new();
        let result = classifier.classify_detailed("orders with a total over 10000", &[]);
        assert!(result.entity().is_none());
        assert_eq!(result.rule, "aggregate");
    }

    #[test]
    fn test_follow_up_inherits_previous_entity() {
        let classifier = StrategyClassifier::new();
        let history = vec![turn(
            "Show me invoice with Order ID 10250",
            Some(EntityRef::Order("10250".into())),
            &["10250"],
        )];

        let result = classifier.classify_detailed("What products did it include?", &history);
        assert!(result.inherited);
        assert_eq!(result.strategy, Strategy::Structured);
        assert_eq!(result.entity(), Some(&EntityRef::Order("10250".into())));
    }

    #[test]
    fn test_follow_up_falls_back_to_single_cited_order() {
        let classifier = StrategyClassifier::new();
        let history = vec![turn("Which orders contain Chai products?", None, &["10248"])];

        let result = classifier.classify_detailed("and who was the customer?", &history);
        assert!(result.inherited);
        assert_eq!(result.entity(), Some(&EntityRef::Order("10248".into())));
    }

    #[test]
    fn test_own_identifier_beats_history() {
        let classifier = StrategyClassifier::new();
        let history = vec![turn("q", Some(EntityRef::Order("10250".into())), &["10250"])];

        let result = classifier.classify_detailed("What about order 10251?", &history);
        assert!(!result.inherited);
        assert_eq!(result.entity(), Some(&EntityRef::Order("10251".into())));
    }

    #[test]
    fn test_follow_up_without_history_is_unresolved() {
        let classifier = StrategyClassifier::new();
        let result = classifier.classify_detailed("what did it cost?", &[]);
        assert!(!result.inherited);
        assert!(result.entity().is_none());
    }

    #[test]
    fn test_classification_is_repeatable() {
        let classifier = StrategyClassifier::new();
        let history = vec![turn("q", Some(EntityRef::CustomerCode("VINET".into())), &[])];
        let first = classifier.classify_detailed("and their total?", &history);
        let second = classifier.classify_detailed("and their total?", &history);
        assert_eq!(first, second);
    }

    #[test]
    fn test_granularity_planning() {
        let classifier = StrategyClassifier::new();

        let product = classifier.classify_detailed("Which orders contain Chai products?", &[]);
        assert_eq!(product.granularities(), vec![Granularity::Product]);

        let line = classifier.classify_detailed("orders with a unit price similar to Chang", &[]);
        assert!(line.granularities().contains(&Granularity::LineItem));

        let hybrid = classifier.classify_detailed("How many orders contain Chai?", &[]);
        assert_eq!(hybrid.strategy, Strategy::Hybrid);
        assert_eq!(hybrid.granularities(), vec![Granularity::Product, Granularity::Invoice]);

        let plain = classifier.classify_detailed("tell me something", &[]);
        assert_eq!(plain.granularities(), vec![Granularity::Invoice]);
    }
}
