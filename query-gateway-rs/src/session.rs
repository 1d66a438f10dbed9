//! In-memory conversation store.
//!
//! Each conversation sits behind its own mutex. A query holds it from
//! planning until its turn is appended, so turns of one conversation are
//! recorded one at a time while different conversations never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{ConversationTurn, HistoryResponse};
use crate::router::QueryContext;

#[derive(Debug)]
pub struct ConversationState {
    pub conversation_id: String,
    /// First user that used the id
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    turns: VecDeque<ConversationTurn>,
}

impl ConversationState {
    fn new(conversation_id: String, user_id: String) -> Self {
        Self {
            conversation_id,
            user_id,
            created_at: Utc::now(),
            turns: VecDeque::new(),
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Exclusive access to one conversation for the duration of a query
pub type ConversationGuard = OwnedMutexGuard<ConversationState>;

#[derive(Clone)]
struct ConversationHandle {
    owner: Arc<str>,
    state: Arc<Mutex<ConversationState>>,
}

impl ConversationHandle {
    fn new(conversation_id: &str, user_id: &str) -> Self {
        Self {
            owner: Arc::from(user_id),
            state: Arc::new(Mutex::new(ConversationState::new(
                conversation_id.to_string(),
                user_id.to_string(),
            ))),
        }
    }

    fn owned_by(self, conversation_id: &str, user_id: &str) -> Result<Self, GatewayError> {
        if &*self.owner == user_id {
            Ok(self)
        } else {
            Err(GatewayError::ConversationForbidden(conversation_id.to_string()))
        }
    }
}

pub struct ConversationStore {
    conversations: RwLock<HashMap<String, ConversationHandle>>,
    max_history: usize,
    context_turns: usize,
}

impl ConversationStore {
    pub fn new(max_history: usize, context_turns: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
            context_turns,
        }
    }

    /// The supplied id, or a fresh one
    pub fn resolve_id(conversation_id: Option<&str>) -> String {
        conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Fails if the conversation belongs to another user; otherwise returns
    /// its state, creating it when new.
    pub async fn open(&self, conversation_id: &str, user_id: &str) -> Result<Arc<Mutex<ConversationState>>, GatewayError> {
        let existing = self.conversations.read().await.get(conversation_id).cloned();
        let handle = match existing {
            Some(handle) => handle,
            None => self
                .conversations
                .write()
                .await
                .entry(conversation_id.to_string())
                .or_insert_with(|| {
                    debug!(conversation_id, user_id, "Conversation created");
                    ConversationHandle::new(conversation_id, user_id)
                })
                .clone(),
        };

        Ok(handle.owned_by(conversation_id, user_id)?.state)
    }

    /// Opens and locks a conversation for one query
    pub async fn acquire(&self, conversation_id: &str, user_id: &str) -> Result<ConversationGuard, GatewayError> {
        let handle = self.open(conversation_id, user_id).await?;
        Ok(handle.lock_owned().await)
    }

    /// Creates an empty conversation with a fresh id
    pub async fn create(&self, user_id: &str) -> String {
        let conversation_id = Self::resolve_id(None);
        self.conversations
            .write()
            .await
            .insert(conversation_id.clone(), ConversationHandle::new(&conversation_id, user_id));
        conversation_id
    }

    /// Routing context from the most recent turns
    pub fn context(&self, state: &ConversationState) -> QueryContext {
        let skip = state.turns.len().saturating_sub(self.context_turns);
        let recent: Vec<&ConversationTurn> = state.turns.iter().skip(skip).collect();

        QueryContext {
            prior_queries: recent.iter().map(|t| t.query.clone()).collect(),
            last_tags: state
                .turns
                .iter()
                .rev()
                .find(|t| !t.matched_tags.is_empty())
                .map(|t| t.matched_tags.clone())
                .unwrap_or_default(),
        }
    }

    /// Appends a turn, dropping the oldest beyond `max_history`
    pub fn append(&self, state: &mut ConversationState, turn: ConversationTurn) {
        state.turns.push_back(turn);
        while state.turns.len() > self.max_history {
            state.turns.pop_front();
        }
    }

    /// Turns in order; unknown conversations have none
    pub async fn history(&self, conversation_id: &str, user_id: &str) -> Result<HistoryResponse, GatewayError> {
        let handle = self.conversations.read().await.get(conversation_id).cloned();
        let turns = match handle {
            Some(handle) => {
                let state = handle.owned_by(conversation_id, user_id)?.state;
                let state = state.lock().await;
                state.turns.iter().cloned().collect()
            }
            None => Vec::new(),
        };

        Ok(HistoryResponse {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            turns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OverallStatus;
    use std::time::Duration;

    fn turn(query: &str, tags: &[&str]) -> ConversationTurn {
        ConversationTurn {
            query_id: format!("q-{}", query),
            query: query.to_string(),
            summary: None,
            overall_status: OverallStatus::Complete,
            matched_tags: tags.iter().map(|t| t.to_string()).collect(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_history_bounded_and_ordered() {
        let store = ConversationStore::new(3, 2);
        let mut guard = store.acquire("c-1", "alice").await.unwrap();
        for i in 0..5 {
            store.append(&mut guard, turn(&i.to_string(), &[]));
        }
        drop(guard);

        let history = store.history("c-1", "alice").await.unwrap();
        let queries: Vec<&str> = history.turns.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_context_uses_recent_turns() {
        let store = ConversationStore::new(20, 2);
        let mut guard = store.acquire("c-1", "alice").await.unwrap();
        store.append(&mut guard, turn("BRCA1", &["gene"]));
        store.append(&mut guard, turn("papers?", &["literature"]));
        store.append(&mut guard, turn("thanks", &[]));

        let context = store.context(&guard);
        assert_eq!(context.prior_queries, vec!["papers?", "thanks"]);
        assert_eq!(context.last_tags, vec!["literature"]);
    }

    #[tokio::test]
    async fn test_ownership() {
        let store = ConversationStore::new(20, 5);
        drop(store.acquire("c-1", "alice").await.unwrap());

        assert!(matches!(
            store.acquire("c-1", "mallory").await,
            Err(GatewayError::ConversationForbidden(_))
        ));
        tokio_test::assert_err!(store.history("c-1", "mallory").await);
        assert!(store.history("unknown", "mallory").await.unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn test_create_returns_fresh_ids() {
        let store = ConversationStore::new(20, 5);
        let a = store.create("alice").await;
        let b = store.create("alice").await;
        assert_ne!(a, b);
        assert!(store.history(&a, "alice").await.unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn test_same_conversation_serialized() {
        let store = Arc::new(ConversationStore::new(20, 5));
        let first = store.acquire("c-1", "alice").await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire("c-1", "alice").await.map(|g| g.len()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let other = store.acquire("c-2", "alice").await.unwrap();
        assert!(other.is_empty());

        let mut first = first;
        store.append(&mut first, turn("one", &[]));
        drop(first);

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }
}
