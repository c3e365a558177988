//! Hybrid query resolution engine
//!
//! Answers natural-language questions about invoices by combining exact
//! structured lookups with semantic similarity search:
//! - `strategy`: rule table choosing structured, semantic or hybrid retrieval
//! - `constraints`: structured lookup parameters read from the question
//! - `accessors`: store and index interfaces, semantic reranking
//! - `fusion`: merge of both result kinds into one ranked evidence set
//! - `synthesizer`: grounded, cited answer text
//! - `memory`: per-session bounded conversation history
//! - `pipeline`: `QueryEngine`, the entry point tying the stages together

pub mod accessors;
pub mod constraints;
pub mod evidence;
pub mod fusion;
pub mod memory;
pub mod pipeline;
pub mod strategy;
pub mod synthesizer;

pub use accessors::{rerank, SemanticIndex, SemanticQuery, StructuredStore};
pub use constraints::{extract_constraints, Aggregate, DateRange, StructuredConstraints};
pub use evidence::{
    EvidenceItem, EvidenceKind, Fields, FusedEvidenceSet, Granularity, SemanticHit, StructuredRow,
    STRUCTURED_SCORE,
};
pub use fusion::EvidenceFusion;
pub use memory::{ConversationMemory, ConversationTurn, SessionId, SessionStore};
pub use pipeline::QueryEngine;
pub use strategy::{Classification, EntityRef, Strategy, StrategyClassifier};
pub use synthesizer::{
    Answer, AnswerSynthesizer, ChatCompletionGenerator, GenerationPrompt, Generator, NO_MATCH_ANSWER,
};
