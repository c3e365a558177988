//! Answer synthesis - turns fused evidence into a cited answer
//!
//! Provides:
//! - A deterministic extractive renderer
//! - Optional chat-completion generation over numbered evidence
//! - Citation extraction from `[n]` markers and source id mentions
//! - A grounding check over numbers and named entities with extractive fallback

use super::evidence::{render_value, EvidenceItem, FusedEvidenceSet};
use super::memory::ConversationTurn;
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Answer returned when retrieval produced no evidence
pub const NO_MATCH_ANSWER: &str = "I couldn't find any matching invoice records for that question.";

const EXTRACTIVE_INTRO: &str = "Here is what I found in the invoice records:";
const EXTRACTIVE_TRUNCATED: &str = "Further matching records were left out.";

/// Fields shown first, in this order
const LEADING_FIELDS: &[&str] = &[
    "order_id",
    "customer_id",
    "contact_name",
    "invoice_date",
    "city",
    "country",
    "total_price",
    "products",
];

/// Capitalised words answers use without naming an entity
const GENERIC_CAPITALISED: &[&str] = &[
    "order", "orders", "invoice", "invoices", "customer", "customers", "contact", "total",
    "product", "products", "item", "items", "date", "source", "evidence", "none", "no", "yes",
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december", "monday", "tuesday", "wednesday", "thursday",
    "friday", "saturday", "sunday",
];

/// Fields never rendered into answers
const HIDDEN_FIELDS: &[&str] = &["user_id", "raw_text", "embedding", "granularity", "confidence_score"];

const SYSTEM_PROMPT: &str = "You answer questions about invoices. Use only the numbered evidence \
and the earlier conversation. Cite every fact with its evidence number in square brackets, \
for example [1]. If the evidence does not answer the question, say so. Never invent numbers, \
names or dates.";

/// Final answer with the sources it used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Source ids referenced by `text`, in order of first use
    pub citations: Vec<String>,
}

impl Answer {
    /// Canonical empty-evidence answer
    pub fn no_match() -> Self {
        Self {
            text: NO_MATCH_ANSWER.to_string(),
            citations: Vec::new(),
        }
    }

    pub fn is_no_match(&self) -> bool {
        self.text == NO_MATCH_ANSWER && self.citations.is_empty()
    }
}

/// Prompt handed to a generation backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationPrompt {
    pub system: String,
    pub user: String,
}

/// Text generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String>;
}

/// OpenAI-compatible chat completions client
pub struct ChatCompletionGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
}

impl ChatCompletionGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "llm.api_key is required for chat completions".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Client for the configured backend, or `None` without an API key
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Self::new(config).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Generator for ChatCompletionGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String> {
        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            max_tokens: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatMessageResponse,
        }

        #[derive(Deserialize)]
        struct ChatMessageResponse {
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::SynthesisFailure {
                message: format!("Chat completion request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SynthesisFailure {
                message: format!("Chat completion error {}: {}", status, body),
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| AppError::SynthesisFailure {
            message: format!("Failed to parse chat completion: {}", e),
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::SynthesisFailure {
                message: "Empty chat completion".to_string(),
            })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| AppError::Configuration {
        message: format!("invalid pattern {}: {}", pattern, e),
    })
}

/// Produces grounded answers from fused evidence
pub struct AnswerSynthesizer {
    generator: Option<Arc<dyn Generator>>,
    max_items: usize,
    citation_marker: Regex,
    number: Regex,
    title_run: Regex,
    customer_code: Regex,
}

impl AnswerSynthesizer {
    /// Extractive-only synthesizer rendering at most `max_items` items
    pub fn new(max_items: usize) -> Result<Self> {
        Ok(Self {
            generator: None,
            max_items: max_items.max(1),
            citation_marker: compile(r"\[(\d+)\]")?,
            number: compile(r"\d[\d,]*(?:\.\d+)?")?,
            title_run: compile(r"[A-Z][a-z][A-Za-z'-]*(?:[ ]+[A-Z][a-z][A-Za-z'-]*)*")?,
            customer_code: compile(r"\b[A-Z]{5}\b")?,
        })
    }

    /// Generate answers with `generator`, falling back to extraction when ungrounded
    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Answer `question` from `evidence`, with `history` as conversational context
    pub async fn synthesize(
        &self,
        question: &str,
        evidence: &FusedEvidenceSet,
        history: &[ConversationTurn],
    ) -> Result<Answer> {
        if evidence.is_empty() {
            return Ok(Answer::no_match());
        }

        let Some(generator) = &self.generator else {
            return Ok(self.render_extractive(evidence));
        };

        let prompt = self.build_prompt(question, evidence, history);
        let text = generator.generate(&prompt).await.map_err(|e| match e {
            AppError::SynthesisFailure { .. } => e,
            other => AppError::SynthesisFailure {
                message: format!("{} failed: {}", generator.name(), other),
            },
        })?;
        let text = text.trim();

        let citations = self.extract_citations(text, evidence);
        if citations.is_empty() {
            tracing::warn!(generator = generator.name(), "Generated answer cites no evidence, using extractive answer");
            crate::metrics::record_grounding_fallback();
            return Ok(self.render_extractive(evidence));
        }

        if !self.is_grounded(text, question, evidence, history) {
            tracing::warn!(generator = generator.name(), "Generated answer is not grounded, using extractive answer");
            crate::metrics::record_grounding_fallback();
            return Ok(self.render_extractive(evidence));
        }

        Ok(Answer {
            text: text.to_string(),
            citations,
        })
    }

    /// Deterministic answer listing the top evidence items
    pub fn render_extractive(&self, evidence: &FusedEvidenceSet) -> Answer {
        if evidence.is_empty() {
            return Answer::no_match();
        }

        let shown: Vec<&EvidenceItem> = evidence.iter().take(self.max_items).collect();

        let mut text = String::from(EXTRACTIVE_INTRO);
        for item in &shown {
            text.push_str("\n- ");
            text.push_str(&describe(item));
            text.push_str(&format!(" [source: {}]", item.source_id()));
        }
        if evidence.len() > shown.len() {
            text.push('\n');
            text.push_str(EXTRACTIVE_TRUNCATED);
        }

        Answer {
            text,
            citations: shown.iter().map(|item| item.source_id().to_string()).collect(),
        }
    }

    fn build_prompt(
        &self,
        question: &str,
        evidence: &FusedEvidenceSet,
        history: &[ConversationTurn],
    ) -> GenerationPrompt {
        let mut user = String::new();

        if !history.is_empty() {
            user.push_str("Conversation so far:\n");
            for turn in history {
                user.push_str(&format!("User: {}\nAssistant: {}\n", turn.question, turn.answer));
            }
            user.push('\n');
        }

        user.push_str("Evidence:\n");
        for (i, item) in evidence.iter().enumerate() {
            user.push_str(&format!(
                "[{}] source {} (relevance: {:.2}): {}\n",
                i + 1,
                item.source_id(),
                item.score(),
                describe(item)
            ));
        }

        user.push_str(&format!("\nQuestion: {}\nAnswer:", question));

        GenerationPrompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    /// Source ids referenced by `[n]` markers or named outright, in order of first use
    fn extract_citations(&self, text: &str, evidence: &FusedEvidenceSet) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();

        for cap in self.citation_marker.captures_iter(text) {
            let (Some(whole), Some(index)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if let Ok(n) = index.as_str().parse::<usize>() {
                if n > 0 {
                    if let Some(item) = evidence.items().get(n - 1) {
                        found.push((whole.start(), item.source_id().to_string()));
                    }
                }
            }
        }

        for item in evidence {
            if let Some(position) = find_word(text, item.source_id()) {
                found.push((position, item.source_id().to_string()));
            }
        }

        found.sort_by_key(|(position, _)| *position);

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(_, id)| seen.insert(id.clone()))
            .map(|(_, id)| id)
            .collect()
    }

    /// Every number and named entity in `text` appears in the evidence, the
    /// question or the history
    fn is_grounded(
        &self,
        text: &str,
        question: &str,
        evidence: &FusedEvidenceSet,
        history: &[ConversationTurn],
    ) -> bool {
        let stripped = self.citation_marker.replace_all(text, " ");

        let mut sources: Vec<String> = vec![question.to_string()];
        for turn in history {
            sources.push(turn.question.clone());
            sources.push(turn.answer.clone());
        }
        for item in evidence {
            sources.push(item.source_id().to_string());
            sources.extend(item.fields().values().filter_map(render_value));
        }

        let mut known_numbers = HashSet::new();
        let mut known_words = HashSet::new();
        for source in &sources {
            self.collect_numbers(source, &mut known_numbers);
            collect_words(source, &mut known_words);
        }

        let mut claimed = HashSet::new();
        self.collect_numbers(&stripped, &mut claimed);
        let numbers: Vec<&String> = claimed.difference(&known_numbers).collect();

        let entities = self.ungrounded_entities(&stripped, &known_words);

        if !numbers.is_empty() || !entities.is_empty() {
            tracing::debug!(numbers = ?numbers, entities = ?entities, "Ungrounded claims in generated answer");
            return false;
        }
        true
    }

    /// Title-case runs and customer codes whose words never occur in the sources.
    /// The word opening a sentence is capitalised anyway and is not checked.
    fn ungrounded_entities(&self, text: &str, known: &HashSet<String>) -> Vec<String> {
        let is_known = |word: &str| {
            let lower = word.to_lowercase();
            known.contains(&lower) || GENERIC_CAPITALISED.contains(&lower.as_str())
        };

        let mut ungrounded = Vec::new();

        for run in self.title_run.find_iter(text) {
            let mut words: Vec<&str> = run.as_str().split_whitespace().collect();
            if opens_sentence(text, run.start()) && !words.is_empty() {
                words.remove(0);
            }
            if words.iter().any(|word| !is_known(*word)) {
                ungrounded.push(run.as_str().to_string());
            }
        }

        for code in self.customer_code.find_iter(text) {
            if !is_known(code.as_str()) {
                ungrounded.push(code.as_str().to_string());
            }
        }

        ungrounded
    }

    fn collect_numbers(&self, text: &str, into: &mut HashSet<String>) {
        for m in self.number.find_iter(text) {
            into.insert(normalize_number(m.as_str()));
        }
    }
}

/// Lowercased words, split on anything but letters, digits, apostrophes and hyphens
fn collect_words(text: &str, into: &mut HashSet<String>) {
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-') {
        if !word.is_empty() {
            into.insert(word.to_lowercase());
        }
        // "Rodney's" also counts as "rodney"
        if let Some((stem, _)) = word.split_once('\'') {
            into.insert(stem.to_lowercase());
        }
    }
}

/// Whether `offset` starts a line, a sentence or a list bullet
fn opens_sentence(text: &str, offset: usize) -> bool {
    let before = &text[..offset];
    let trimmed = before.trim_end();
    if before[trimmed.len()..].contains('\n') {
        return true;
    }
    match trimmed.chars().next_back() {
        None => true,
        Some(c) => matches!(c, '.' | '!' | '?' | ':' | '-' | '*'),
    }
}

/// `1,863.40` and `1863.4` compare equal
fn normalize_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| *c != ',').collect();
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        digits
    }
}

/// Byte offset of `needle` in `haystack` as a whole word
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.len() < 3 {
        return None;
    }
    let mut from = 0;
    while let Some(offset) = haystack[from..].find(needle) {
        let start = from + offset;
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        let bounded = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        if bounded(before) && bounded(after) {
            return Some(start);
        }
        from = end;
    }
    None
}

fn humanize(field: &str) -> String {
    field.replace('_', " ")
}

/// One-line rendering of an evidence item
fn describe(item: &EvidenceItem) -> String {
    if !item.kind().is_structured() {
        if let Some(content) = item.text("content") {
            return content;
        }
    }

    let mut parts = Vec::new();
    for name in LEADING_FIELDS {
        if let Some(value) = item.text(name) {
            parts.push(format!("{}: {}", humanize(name), value));
        }
    }
    for (name, value) in item.fields() {
        if LEADING_FIELDS.contains(&name.as_str())
            || HIDDEN_FIELDS.contains(&name.as_str())
            || name == "content"
        {
            continue;
        }
        if let Some(value) = render_value(value) {
            parts.push(format!("{}: {}", humanize(name), value));
        }
    }

    if parts.is_empty() {
        item.source_id().to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evidence::{Fields, Granularity, SemanticHit, StructuredRow};
    use crate::engine::fusion::EvidenceFusion;
    use crate::engine::strategy::Strategy;
    use chrono::Utc;
    use serde_json::json;

    struct ScriptedGenerator(std::result::Result<String, String>);

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &GenerationPrompt) -> Result<String> {
            self.0.clone().map_err(|message| AppError::ServiceUnavailable { message })
        }
    }

    fn order_row(order_id: &str, contact: &str, total: f64) -> StructuredRow {
        let mut fields = Fields::new();
        fields.insert("order_id".into(), json!(order_id));
        fields.insert("contact_name".into(), json!(contact));
        fields.insert("total_price".into(), json!(total));
        fields.insert("products".into(), json!(["Chai (qty 10, unit price 14.4)"]));
        StructuredRow::new(order_id, fields)
    }

    fn product_hit(order_id: &str, score: f32) -> SemanticHit {
        let mut payload = Fields::new();
        payload.insert("order_id".into(), json!(order_id));
        payload.insert("content".into(), json!(format!("Order {} products: Chai, Chang", order_id)));
        SemanticHit {
            granularity: Granularity::Product,
            source_id: order_id.to_string(),
            payload,
            score,
        }
    }

    fn evidence(rows: Vec<StructuredRow>, hits: Vec<SemanticHit>) -> FusedEvidenceSet {
        EvidenceFusion::default().fuse(rows, hits)
    }

    #[tokio::test]
    async fn test_empty_evidence_gives_canonical_answer() {
        let synthesizer = AnswerSynthesizer::new(5).unwrap();
        let answer = synthesizer
            .synthesize("anything?", &FusedEvidenceSet::default(), &[])
            .await
            .unwrap();

        assert!(answer.is_no_match());
        assert_eq!(answer.text, NO_MATCH_ANSWER);
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn test_single_order_answer_cites_only_that_order() {
        let synthesizer = AnswerSynthesizer::new(5).unwrap();
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![]);

        let answer = synthesizer
            .synthesize("Show me invoice with Order ID 10250", &fused, &[])
            .await
            .unwrap();

        assert_eq!(answer.citations, vec!["10250"]);
        assert!(answer.text.contains("order id: 10250"));
        assert!(answer.text.contains("Mario Pontes"));
        assert!(answer.text.contains("[source: 10250]"));
    }

    #[tokio::test]
    async fn test_extractive_answer_is_capped_and_grounded() {
        let synthesizer = AnswerSynthesizer::new(2).unwrap();
        let fused = evidence(
            vec![],
            vec![product_hit("10248", 0.9), product_hit("10252", 0.8), product_hit("10255", 0.6)],
        );
        let question = "Which orders contain Chai products?";

        let answer = synthesizer.synthesize(question, &fused, &[]).await.unwrap();

        assert_eq!(answer.citations, vec!["10248", "10252"]);
        assert!(answer.text.contains(EXTRACTIVE_TRUNCATED));
        assert!(!answer.text.contains("10255"));
        for id in &answer.citations {
            assert!(fused.contains(id));
        }
        assert!(synthesizer.is_grounded(&answer.text, question, &fused, &[]));
    }

    #[tokio::test]
    async fn test_generated_answer_is_accepted_when_grounded() {
        let fused = evidence(
            vec![order_row("10250", "Mario Pontes", 1552.6)],
            vec![product_hit("10248", 0.7)],
        );
        let generator = ScriptedGenerator(Ok(
            "Order 10248 also contains Chai [2], while order 10250 totals 1,552.60 [1].".to_string(),
        ));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("chai orders?", &fused, &[]).await.unwrap();

        assert_eq!(answer.citations, vec!["10248", "10250"]);
        assert!(answer.text.starts_with("Order 10248"));
    }

    #[tokio::test]
    async fn test_invented_number_falls_back_to_extractive() {
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![]);
        let generator = ScriptedGenerator(Ok("Order 10250 totals 9999.99 [1].".to_string()));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("total of 10250?", &fused, &[]).await.unwrap();

        assert!(answer.text.starts_with(EXTRACTIVE_INTRO));
        assert_eq!(answer.citations, vec!["10250"]);
    }

    fn city_row(order_id: &str, contact: &str, city: &str) -> StructuredRow {
        let mut fields = Fields::new();
        fields.insert("order_id".into(), json!(order_id));
        fields.insert("contact_name".into(), json!(contact));
        fields.insert("city".into(), json!(city));
        StructuredRow::new(order_id, fields)
    }

    #[tokio::test]
    async fn test_invented_names_fall_back_to_extractive() {
        let fused = evidence(vec![city_row("10250", "Mario Pontes", "Rio de Janeiro")], vec![]);
        let generator = ScriptedGenerator(Ok(
            "Order 10250 [1] was placed by Hanna Moos of Berlin and contained Tofu.".to_string(),
        ));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("who placed 10250?", &fused, &[]).await.unwrap();

        assert!(answer.text.starts_with(EXTRACTIVE_INTRO));
        assert!(answer.text.contains("Mario Pontes"));
    }

    #[tokio::test]
    async fn test_names_from_evidence_are_accepted() {
        let fused = evidence(vec![city_row("10250", "Mario Pontes", "Rio de Janeiro")], vec![]);
        let generator = ScriptedGenerator(Ok(
            "Order 10250 [1] was placed by Mario Pontes in Rio de Janeiro.".to_string(),
        ));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("who placed 10250?", &fused, &[]).await.unwrap();

        assert!(answer.text.starts_with("Order 10250"));
        assert_eq!(answer.citations, vec!["10250"]);
    }

    #[test]
    fn test_unknown_customer_code_is_ungrounded() {
        let synthesizer = AnswerSynthesizer::new(5).unwrap();
        let fused = evidence(vec![city_row("10250", "Mario Pontes", "Rio de Janeiro")], vec![]);

        assert!(!synthesizer.is_grounded("It was customer HANAR [1].", "who?", &fused, &[]));
        assert!(synthesizer.is_grounded("It was customer HANAR [1].", "is it HANAR?", &fused, &[]));
    }

    #[tokio::test]
    async fn test_uncited_answer_falls_back_to_extractive() {
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![]);
        let generator = ScriptedGenerator(Ok("It was a large order.".to_string()));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("how big?", &fused, &[]).await.unwrap();
        assert!(answer.text.starts_with(EXTRACTIVE_INTRO));
    }

    #[tokio::test]
    async fn test_history_numbers_count_as_grounded() {
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![]);
        let history = vec![ConversationTurn {
            question: "How many orders did Mario Pontes place in 1996?".to_string(),
            strategy: Strategy::Structured,
            evidence_ids: vec!["10250".to_string()],
            answer: "order count: 2".to_string(),
            resolved_entity: None,
            at: Utc::now(),
        }];
        let generator = ScriptedGenerator(Ok("Besides the 2 orders in 1996, order 10250 [1] is one of them.".to_string()));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let answer = synthesizer.synthesize("and the first one?", &fused, &history).await.unwrap();
        assert_eq!(answer.citations, vec!["10250"]);
        assert!(!answer.text.starts_with(EXTRACTIVE_INTRO));
    }

    #[tokio::test]
    async fn test_backend_error_is_synthesis_failure() {
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![]);
        let generator = ScriptedGenerator(Err("connection refused".to_string()));
        let synthesizer = AnswerSynthesizer::new(5)
            .unwrap()
            .with_generator(Arc::new(generator));

        let err = synthesizer.synthesize("q", &fused, &[]).await.unwrap_err();
        assert!(matches!(err, AppError::SynthesisFailure { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_citation_markers_out_of_range_are_ignored() {
        let synthesizer = AnswerSynthesizer::new(5).unwrap();
        let fused = evidence(vec![], vec![product_hit("10248", 0.9)]);

        let citations = synthesizer.extract_citations("See [1] and [7] and [0].", &fused);
        assert_eq!(citations, vec!["10248"]);
    }

    #[test]
    fn test_source_ids_match_whole_words_only() {
        assert_eq!(find_word("order 10250.", "10250"), Some(6));
        assert_eq!(find_word("order 102501", "10250"), None);
        assert_eq!(find_word("no", "10250"), None);
    }

    #[test]
    fn test_sentence_openers() {
        let text = "Found it.\n- Chai [source: 1]\nFurther rows. Next";
        assert!(opens_sentence(text, 0));
        assert!(opens_sentence(text, text.find("Chai").unwrap()));
        assert!(opens_sentence(text, text.find("Further").unwrap()));
        assert!(opens_sentence(text, text.find("Next").unwrap()));
        assert!(!opens_sentence(text, text.find("it").unwrap()));
    }

    #[test]
    fn test_number_normalization() {
        assert_eq!(normalize_number("1,552.60"), "1552.6");
        assert_eq!(normalize_number("440.00"), "440");
        assert_eq!(normalize_number("10250"), "10250");
    }

    #[test]
    fn test_prompt_numbers_evidence_and_includes_history() {
        let synthesizer = AnswerSynthesizer::new(5).unwrap();
        let fused = evidence(vec![order_row("10250", "Mario Pontes", 1552.6)], vec![product_hit("10248", 0.5)]);
        let history = vec![ConversationTurn {
            question: "previous question".to_string(),
            strategy: Strategy::Semantic,
            evidence_ids: vec![],
            answer: "previous answer".to_string(),
            resolved_entity: None,
            at: Utc::now(),
        }];

        let prompt = synthesizer.build_prompt("current question", &fused, &history);

        assert!(prompt.user.contains("User: previous question"));
        assert!(prompt.user.contains("[1] source 10250"));
        assert!(prompt.user.contains("[2] source 10248"));
        assert!(prompt.user.ends_with("Question: current question\nAnswer:"));
    }

    #[test]
    fn test_generator_requires_api_key() {
        assert!(ChatCompletionGenerator::from_config(&LlmConfig::default()).unwrap().is_none());

        let config = LlmConfig {
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        };
        let generator = ChatCompletionGenerator::from_config(&config).unwrap().unwrap();
        assert_eq!(generator.name(), "gpt-4o-mini");
    }
}
