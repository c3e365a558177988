//! Query engine - the single entry point for answering questions
//!
//! One turn: lock the session memory, classify, run the accessors the
//! strategy needs (concurrently, each under its own deadline), fuse,
//! synthesize, and append the turn. Nothing is appended unless every step
//! succeeded.

use super::accessors::{rerank, SemanticIndex, SemanticQuery, StructuredStore};
use super::constraints::extract_constraints;
use super::evidence::{SemanticHit, StructuredRow};
use super::fusion::EvidenceFusion;
use super::memory::{ConversationTurn, SessionId, SessionStore};
use super::strategy::{looks_like_order_id, Classification, EntityRef, Strategy, StrategyClassifier};
use super::synthesizer::{Answer, AnswerSynthesizer};
use crate::config::EngineConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

const STRUCTURED_ACCESSOR: &str = "structured_store";
const SEMANTIC_ACCESSOR: &str = "semantic_index";

/// Hybrid query resolution engine
pub struct QueryEngine {
    config: EngineConfig,
    classifier: StrategyClassifier,
    fusion: EvidenceFusion,
    synthesizer: AnswerSynthesizer,
    store: Arc<dyn StructuredStore>,
    index: Arc<dyn SemanticIndex>,
    sessions: Arc<SessionStore>,
}

impl QueryEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StructuredStore>,
        index: Arc<dyn SemanticIndex>,
        synthesizer: AnswerSynthesizer,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.memory_turns));
        let fusion = EvidenceFusion::new(config.fused_limit);

        Self {
            config,
            classifier: StrategyClassifier::new(),
            fusion,
            synthesizer,
            store,
            index,
            sessions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Answer `question` within the conversation `session_id`
    pub async fn answer_question(&self, question: &str, session_id: &SessionId) -> Result<Answer> {
        self.answer_question_scoped(question, session_id, None).await
    }

    /// Same as [`answer_question`](Self::answer_question), restricted to one user's invoices
    pub async fn answer_question_scoped(
        &self,
        question: &str,
        session_id: &SessionId,
        user_id: Option<i32>,
    ) -> Result<Answer> {
        let started = Instant::now();
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::Validation {
                message: "question must not be empty".to_string(),
                field: Some("question".to_string()),
            });
        }

        // Held for the whole turn so turns of one session never interleave
        let memory = self.sessions.session(session_id).await;
        let mut memory = memory.lock().await;
        let history = memory.recent(self.config.history_window);

        let classification = self.classifier.classify_detailed(question, &history);
        let strategy = classification.strategy;

        let (rows, hits) = match self.retrieve(question, &classification, user_id).await {
            Ok(evidence) => evidence,
            Err(e) => {
                metrics::record_retrieval_failure();
                tracing::warn!(session_id = %session_id, strategy = %strategy, error = %e, "Retrieval failed");
                return Err(e);
            }
        };

        let evidence = self.fusion.fuse(rows, hits);
        metrics::record_fused_evidence(evidence.len());

        let answer = self.synthesizer.synthesize(question, &evidence, &history).await?;

        let resolved_entity = classification
            .entity()
            .cloned()
            .or_else(|| single_cited_order(&answer));

        memory.append(ConversationTurn {
            question: question.to_string(),
            strategy,
            evidence_ids: evidence.source_ids(),
            answer: answer.text.clone(),
            resolved_entity,
            at: Utc::now(),
        });

        let elapsed = started.elapsed();
        metrics::record_question(strategy.as_str(), elapsed.as_secs_f64());

        tracing::info!(
            session_id = %session_id,
            strategy = %strategy,
            rule = classification.rule,
            evidence = evidence.len(),
            citations = answer.citations.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Question answered"
        );

        Ok(answer)
    }

    /// Run the accessors the strategy needs. Fails only if every accessor that ran failed.
    async fn retrieve(
        &self,
        question: &str,
        classification: &Classification,
        user_id: Option<i32>,
    ) -> Result<(Vec<StructuredRow>, Vec<SemanticHit>)> {
        let strategy = classification.strategy;

        let structured = async {
            if strategy.uses_structured() {
                Some(self.run_structured(question, classification, user_id).await)
            } else {
                None
            }
        };
        let semantic = async {
            if strategy.uses_semantic() {
                Some(self.run_semantic(question, classification, user_id).await)
            } else {
                None
            }
        };

        let (structured, semantic) = tokio::join!(structured, semantic);

        let attempted = structured.is_some() as usize + semantic.is_some() as usize;
        let mut failures = Vec::new();

        let rows = match structured {
            Some(Ok(rows)) => rows,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Structured store degraded");
                failures.push(e.to_string());
                Vec::new()
            }
            None => Vec::new(),
        };

        let hits = match semantic {
            Some(Ok(hits)) => hits,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Semantic index degraded");
                failures.push(e.to_string());
                Vec::new()
            }
            None => Vec::new(),
        };

        if attempted > 0 && failures.len() == attempted {
            return Err(AppError::RetrievalFailed {
                message: failures.join("; "),
            });
        }

        Ok((rows, hits))
    }

    async fn run_structured(
        &self,
        question: &str,
        classification: &Classification,
        user_id: Option<i32>,
    ) -> Result<Vec<StructuredRow>> {
        let mut constraints = extract_constraints(question, classification).with_user(user_id);
        if classification.strategy == Strategy::Hybrid {
            // Exact rows outrank every hit, keep room for the semantic side
            let share = (self.config.fused_limit / 2).max(1) as u64;
            constraints.limit = constraints.limit.min(share);
        }

        if let Err(e) = constraints.validate() {
            tracing::debug!(error = %e, "No usable structured constraints");
            metrics::record_accessor_call(STRUCTURED_ACCESSOR, "malformed", 0.0);
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let deadline = self.config.accessor_timeout();
        let result = timeout(deadline, self.store.lookup(&constraints)).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Ok(rows)) => {
                metrics::record_accessor_call(STRUCTURED_ACCESSOR, "ok", elapsed);
                tracing::debug!(rows = rows.len(), "Structured lookup complete");
                Ok(rows)
            }
            Ok(Err(AppError::MalformedConstraints { message })) => {
                metrics::record_accessor_call(STRUCTURED_ACCESSOR, "malformed", elapsed);
                tracing::debug!(error = %message, "Store rejected constraints");
                Ok(Vec::new())
            }
            Ok(Err(e)) => {
                metrics::record_accessor_call(STRUCTURED_ACCESSOR, "error", elapsed);
                Err(AppError::AccessorUnavailable {
                    accessor: STRUCTURED_ACCESSOR.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                metrics::record_accessor_call(STRUCTURED_ACCESSOR, "timeout", elapsed);
                Err(AppError::AccessorUnavailable {
                    accessor: STRUCTURED_ACCESSOR.to_string(),
                    message: format!("timed out after {}ms", deadline.as_millis()),
                })
            }
        }
    }

    /// One search per planned granularity, all concurrent
    async fn run_semantic(
        &self,
        question: &str,
        classification: &Classification,
        user_id: Option<i32>,
    ) -> Result<Vec<SemanticHit>> {
        let granularities = classification.granularities();
        let entity: Option<EntityRef> = classification.focus();
        let deadline = self.config.accessor_timeout();
        let floor = self.config.relevance_floor;

        let searches = granularities.iter().map(|granularity| {
            let query = SemanticQuery::new(question, *granularity, self.config.top_k)
                .with_min_score(floor)
                .with_user(user_id)
                .with_entity(entity.clone());

            async move {
                let started = Instant::now();
                let result = timeout(deadline, self.index.search(&query)).await;
                (query.granularity, result, started.elapsed().as_secs_f64())
            }
        });

        let results = futures::future::join_all(searches).await;

        let mut hits = Vec::new();
        let mut failures = Vec::new();
        for (granularity, result, elapsed) in results {
            match result {
                Ok(Ok(found)) => {
                    metrics::record_accessor_call(SEMANTIC_ACCESSOR, "ok", elapsed);
                    hits.extend(found.into_iter().filter(|hit| hit.score >= floor));
                }
                Ok(Err(e)) => {
                    metrics::record_accessor_call(SEMANTIC_ACCESSOR, "error", elapsed);
                    failures.push(format!("{}: {}", granularity, e));
                }
                Err(_) => {
                    metrics::record_accessor_call(SEMANTIC_ACCESSOR, "timeout", elapsed);
                    failures.push(format!("{}: timed out after {}ms", granularity, deadline.as_millis()));
                }
            }
        }

        if !granularities.is_empty() && failures.len() == granularities.len() {
            return Err(AppError::AccessorUnavailable {
                accessor: SEMANTIC_ACCESSOR.to_string(),
                message: failures.join("; "),
            });
        }
        if !failures.is_empty() {
            tracing::warn!(failed = ?failures, "Some granularity searches failed");
        }

        if self.config.rerank {
            rerank(&mut hits, entity.as_ref().and_then(|e| e.order_id()));
        }

        tracing::debug!(hits = hits.len(), granularities = ?granularities, "Semantic search complete");
        Ok(hits)
    }
}

fn single_cited_order(answer: &Answer) -> Option<EntityRef> {
    match answer.citations.as_slice() {
        [only] if looks_like_order_id(only) => Some(EntityRef::Order(only.clone())),
        _ => None,
    }
}
