//! Conversation history: user turns and council answers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::council::{
    CouncilResult, Metadata, Stage1Results, Stage2Results, Stage3Result, DEFAULT_TITLE,
};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Turn {
    User {
        content: String,
        created_at: DateTime<Utc>,
    },
    Assistant {
        job_id: Uuid,
        stage1: Stage1Results,
        stage2: Stage2Results,
        stage3: Stage3Result,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    },
}

impl Turn {
    pub fn assistant(job_id: Uuid, result: &CouncilResult) -> Self {
        Turn::Assistant {
            job_id,
            stage1: result.stage1.clone(),
            stage2: result.stage2.clone(),
            stage3: result.stage3.clone(),
            metadata: result.metadata.clone(),
            created_at: Utc::now(),
        }
    }

    /// Assistant turn for `result` that keeps this turn's timestamp.
    pub fn refreshed(&self, job_id: Uuid, result: &CouncilResult) -> Self {
        let mut updated = Turn::assistant(job_id, result);
        if let Turn::Assistant { created_at, .. } = &mut updated {
            *created_at = self.created_at();
        }
        updated
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Turn::User { created_at, .. } | Turn::Assistant { created_at, .. } => *created_at,
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Turn::Assistant { job_id, .. } => Some(*job_id),
            Turn::User { .. } => None,
        }
    }

    /// Council cost carried by an assistant turn, zero for user turns.
    pub fn cost(&self) -> i64 {
        match self {
            Turn::Assistant { metadata, .. } => metadata.stage_costs.total,
            Turn::User { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub turns: Vec<Turn>,
    /// Sum of every answered job's cost, in nanodollars.
    pub total_cost_nanodollars: i64,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            title: DEFAULT_TITLE.to_string(),
            turns: Vec::new(),
            total_cost_nanodollars: 0,
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            title: self.title.clone(),
            message_count: self.turns.len(),
            total_cost_nanodollars: self.total_cost_nanodollars,
        }
    }
}

/// Listing row: a conversation without its turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub message_count: usize,
    pub total_cost_nanodollars: i64,
}

/// Append-only record of turns. Conversations are created on first append.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_user_turn(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn append_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<(), StoreError>;

    /// Rewrite the assistant turn written for `job_id` (reconciled costs) and
    /// move the running total by the change in that turn's cost, in one step.
    ///
    /// Returns the delta applied, or `None` when no such turn exists.
    async fn update_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<Option<i64>, StoreError>;

    /// Add `delta_nanodollars` (may be negative) to the running total.
    async fn add_cost(
        &self,
        conversation_id: &str,
        delta_nanodollars: i64,
    ) -> Result<(), StoreError>;

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError>;

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Newest first.
    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conversation<R>(&self, id: &str, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut conversations = self.lock();
        let conversation = conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id));
        f(conversation)
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_user_turn(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |c| {
            c.turns.push(Turn::User {
                content: content.to_string(),
                created_at: Utc::now(),
            })
        });
        Ok(())
    }

    async fn append_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |c| {
            c.turns.push(Turn::assistant(job_id, result))
        });
        Ok(())
    }

    async fn update_assistant_turn(
        &self,
        conversation_id: &str,
        job_id: Uuid,
        result: &CouncilResult,
    ) -> Result<Option<i64>, StoreError> {
        let mut conversations = self.lock();
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return Ok(None);
        };
        let Some(turn) = conversation
            .turns
            .iter_mut()
            .find(|t| t.job_id() == Some(job_id))
        else {
            return Ok(None);
        };
        let previous = turn.cost();
        *turn = turn.refreshed(job_id, result);
        let delta = turn.cost() - previous;
        conversation.total_cost_nanodollars += delta;
        Ok(Some(delta))
    }

    async fn add_cost(
        &self,
        conversation_id: &str,
        delta_nanodollars: i64,
    ) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |c| {
            c.total_cost_nanodollars += delta_nanodollars
        });
        Ok(())
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |c| c.title = title.to_string());
        Ok(())
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.lock().get(conversation_id).cloned())
    }

    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut rows: Vec<ConversationSummary> =
            self.lock().values().map(Conversation::summary).collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}
