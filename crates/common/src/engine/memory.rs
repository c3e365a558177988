//! Conversation memory and the per-session store
//!
//! Each session owns a bounded FIFO of turns behind its own lock. Nothing is
//! shared between sessions.

use super::strategy::{EntityRef, Strategy};
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Longest accepted session identifier
pub const MAX_SESSION_ID_LEN: usize = 128;

/// One answered question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub strategy: Strategy,
    /// Source ids of the fused evidence, not the payloads
    pub evidence_ids: Vec<String>,
    pub answer: String,
    /// Entity the turn was about, used by follow-up questions
    pub resolved_entity: Option<EntityRef>,
    pub at: DateTime<Utc>,
}

/// Bounded, ordered history for a single session
#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
    last_active: Instant,
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
            last_active: Instant::now(),
        }
    }

    /// Append a turn, evicting the oldest once the bound is reached
    pub fn append(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.last_active = Instant::now();
    }

    /// Last `n` turns, oldest first
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.last_active = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent resolved entity
    pub fn latest_entity(&self) -> Option<&EntityRef> {
        self.turns.iter().rev().find_map(|t| t.resolved_entity.as_ref())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Mark the session as in use without adding a turn
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Validated conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        let valid_chars = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));

        if value.is_empty() || value.len() > MAX_SESSION_ID_LEN || !valid_chars {
            return Err(AppError::Validation {
                message: format!(
                    "session id must be 1-{} characters of letters, digits, '_', '-', '.', ':'",
                    MAX_SESSION_ID_LEN
                ),
                field: Some("session_id".to_string()),
            });
        }

        Ok(Self(value))
    }
}

impl std::str::FromStr for SessionId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s.to_string())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type SharedMemory = Arc<Mutex<ConversationMemory>>;

fn touch(memory: &SharedMemory) {
    if let Ok(mut guard) = memory.try_lock() {
        guard.touch();
    }
}

/// Session-scoped conversation memories
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SharedMemory>>,
    capacity: usize,
}

impl SessionStore {
    /// Every memory created by this store keeps at most `capacity` turns
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Memory for `id`, created on first use.
    ///
    /// The memory is marked active while the map lock is held, so a sweep
    /// running right after this call cannot evict it as idle. A memory that is
    /// already locked belongs to a turn in progress, which sweeps skip anyway.
    pub async fn session(&self, id: &SessionId) -> SharedMemory {
        if let Some(memory) = self.sessions.read().await.get(id) {
            touch(memory);
            return Arc::clone(memory);
        }

        let mut sessions = self.sessions.write().await;
        let memory = sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationMemory::new(self.capacity))))
            .clone();
        touch(&memory);
        crate::metrics::set_sessions_active(sessions.len());
        memory
    }

    /// Existing memory for `id`
    pub async fn get(&self, id: &SessionId) -> Option<SharedMemory> {
        self.sessions.read().await.get(id).cloned()
    }

    /// All stored turns of a session, oldest first
    pub async fn history(&self, id: &SessionId) -> Result<Vec<ConversationTurn>> {
        let memory = self.get(id).await.ok_or_else(|| AppError::SessionNotFound {
            id: id.to_string(),
        })?;
        let memory = memory.lock().await;
        Ok(memory.recent(memory.len()))
    }

    /// Reset and forget a session
    pub async fn end_session(&self, id: &SessionId) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(id);
            crate::metrics::set_sessions_active(sessions.len());
            removed
        };

        match removed {
            Some(memory) => {
                memory.lock().await.reset();
                tracing::info!(session_id = %id, "Session ended");
                Ok(())
            }
            None => Err(AppError::SessionNotFound { id: id.to_string() }),
        }
    }

    /// Drop sessions idle for longer than `ttl`. Sessions mid-turn are kept.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|_, memory| match memory.try_lock() {
            Ok(guard) => guard.idle_for() <= ttl,
            Err(_) => true,
        });

        let evicted = before - sessions.len();
        crate::metrics::set_sessions_active(sessions.len());
        if evicted > 0 {
            tracing::info!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str) -> ConversationTurn {
        ConversationTurn {
            question: question.to_string(),
            strategy: Strategy::Semantic,
            evidence_ids: vec![],
            answer: format!("answer to {}", question),
            resolved_entity: None,
            at: Utc::now(),
        }
    }

    fn session(id: &str) -> SessionId {
        id.parse().unwrap()
    }

    #[test]
    fn test_memory_evicts_oldest_first() {
        let mut memory = ConversationMemory::new(3);
        for i in 0..5 {
            memory.append(turn(&format!("q{}", i)));
            assert!(memory.len() <= 3);
        }

        let questions: Vec<String> = memory.recent(10).into_iter().map(|t| t.question).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn test_recent_returns_tail_in_order() {
        let mut memory = ConversationMemory::new(5);
        for i in 0..4 {
            memory.append(turn(&format!("q{}", i)));
        }

        let recent: Vec<String> = memory.recent(2).into_iter().map(|t| t.question).collect();
        assert_eq!(recent, vec!["q2", "q3"]);
        assert!(memory.recent(0).is_empty());
    }

    #[test]
    fn test_reset_clears_turns() {
        let mut memory = ConversationMemory::new(2);
        memory.append(turn("q"));
        memory.reset();
        assert!(memory.is_empty());
        assert!(memory.latest_entity().is_none());
    }

    #[test]
    fn test_latest_entity() {
        let mut memory = ConversationMemory::new(5);
        let mut first = turn("q1");
        first.resolved_entity = Some(EntityRef::Order("10250".into()));
        memory.append(first);
        memory.append(turn("q2"));

        assert_eq!(memory.latest_entity(), Some(&EntityRef::Order("10250".into())));
    }

    #[test]
    fn test_session_id_validation() {
        assert!("abc-123_x.y:z".parse::<SessionId>().is_ok());
        assert!("".parse::<SessionId>().is_err());
        assert!("has space".parse::<SessionId>().is_err());
        assert!("a".repeat(MAX_SESSION_ID_LEN + 1).parse::<SessionId>().is_err());

        let generated = SessionId::generate();
        assert!(generated.as_str().parse::<SessionId>().is_ok());
    }

    #[test]
    fn test_session_id_serde() {
        let id: SessionId = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(id.as_str(), "default");
        assert!(serde_json::from_str::<SessionId>("\"bad id\"").is_err());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = SessionStore::new(5);
        let a = session("a");
        let b = session("b");

        store.session(&a).await.lock().await.append(turn("from a"));

        assert_eq!(store.history(&a).await.unwrap().len(), 1);
        assert!(store.session(&b).await.lock().await.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_same_session_shares_memory() {
        let store = SessionStore::new(5);
        let id = session("shared");

        let first = store.session(&id).await;
        let second = store.session(&id).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_history_of_unknown_session() {
        let store = SessionStore::new(5);
        let err = store.history(&session("missing")).await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_end_session() {
        let store = SessionStore::new(5);
        let id = session("done");
        let memory = store.session(&id).await;
        memory.lock().await.append(turn("q"));

        store.end_session(&id).await.unwrap();

        assert!(memory.lock().await.is_empty());
        assert!(store.get(&id).await.is_none());
        assert!(store.end_session(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = SessionStore::new(5);
        store.session(&session("old")).await;

        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.evict_idle(Duration::from_millis(5)).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_fetching_a_session_keeps_it_alive() {
        let store = SessionStore::new(5);
        let id = session("returning");
        store.session(&id).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let memory = store.session(&id).await;

        assert_eq!(store.evict_idle(Duration::from_millis(20)).await, 0);
        assert!(Arc::ptr_eq(&memory, &store.get(&id).await.unwrap()));
    }

    #[tokio::test]
    async fn test_evict_skips_locked_sessions() {
        let store = SessionStore::new(5);
        let id = session("busy");
        let memory = store.session(&id).await;
        let _guard = memory.lock().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.evict_idle(Duration::from_millis(5)).await, 0);
        assert_eq!(store.len().await, 1);
    }
}
