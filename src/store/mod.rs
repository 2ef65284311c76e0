//! Result Store
//!
//! Persistence boundary for case records, stage results and conversation history.
//! Every write is a whole-record upsert keyed by `(case_id, stage_name)`; the
//! backing store is expected to make each key update atomic.

pub mod persistence;

pub use persistence::SledResultStore;

use crate::error::StorageError;
use crate::provider::MessageRole;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Persisted workflow state of one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: String,
    pub case_text: String,
    pub current_stage: String,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn new(id: impl Into<String>, case_text: impl Into<String>, current_stage: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            case_text: case_text.into(),
            current_stage: current_stage.into(),
            complete: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Output of one stage for one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub case_id: String,
    pub stage_name: String,
    pub result: Value,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageResult {
    /// Replace the payload of `existing` (if any), keeping approval and creation time.
    pub fn merged(existing: Option<StageResult>, case_id: &str, stage_name: &str, result: Value) -> Self {
        let now = Utc::now();
        match existing {
            Some(mut current) => {
                current.result = result;
                current.updated_at = now;
                current
            }
            None => Self {
                case_id: case_id.to_string(),
                stage_name: stage_name.to_string(),
                result,
                approved: false,
                created_at: now,
                updated_at: now,
            },
        }
    }
}

/// One turn of the per-case conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub case_id: String,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Storage interface used by the stage executor
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>, StorageError>;

    async fn put_case(&self, case: &CaseRecord) -> Result<(), StorageError>;

    async fn get_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageResult>, StorageError>;

    /// Insert or replace the payload; an existing approval flag survives.
    async fn upsert_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
        result: Value,
    ) -> Result<StageResult, StorageError>;

    /// Returns `None` when no result exists for the key.
    async fn set_approved(
        &self,
        case_id: &str,
        stage_name: &str,
        approved: bool,
    ) -> Result<Option<StageResult>, StorageError>;

    async fn list_stage_results(&self, case_id: &str) -> Result<Vec<StageResult>, StorageError>;

    async fn append_message(
        &self,
        case_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, StorageError>;

    /// Oldest first
    async fn list_messages(&self, case_id: &str) -> Result<Vec<ConversationMessage>, StorageError>;
}

#[derive(Default)]
struct MemoryState {
    cases: HashMap<String, CaseRecord>,
    results: BTreeMap<(String, String), StageResult>,
    messages: HashMap<String, Vec<ConversationMessage>>,
}

/// Process-local store, used by tests and `store.backend = "memory"`
#[derive(Default)]
pub struct InMemoryResultStore {
    state: Mutex<MemoryState>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>, StorageError> {
        Ok(self.state.lock().cases.get(case_id).cloned())
    }

    async fn put_case(&self, case: &CaseRecord) -> Result<(), StorageError> {
        self.state
            .lock()
            .cases
            .insert(case.id.clone(), case.clone());
        Ok(())
    }

    async fn get_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageResult>, StorageError> {
        let key = (case_id.to_string(), stage_name.to_string());
        Ok(self.state.lock().results.get(&key).cloned())
    }

    async fn upsert_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
        result: Value,
    ) -> Result<StageResult, StorageError> {
        let key = (case_id.to_string(), stage_name.to_string());
        let mut state = self.state.lock();
        let merged = StageResult::merged(state.results.remove(&key), case_id, stage_name, result);
        state.results.insert(key, merged.clone());
        Ok(merged)
    }

    async fn set_approved(
        &self,
        case_id: &str,
        stage_name: &str,
        approved: bool,
    ) -> Result<Option<StageResult>, StorageError> {
        let key = (case_id.to_string(), stage_name.to_string());
        let mut state = self.state.lock();
        Ok(state.results.get_mut(&key).map(|existing| {
            existing.approved = approved;
            existing.updated_at = Utc::now();
            existing.clone()
        }))
    }

    async fn list_stage_results(&self, case_id: &str) -> Result<Vec<StageResult>, StorageError> {
        Ok(self
            .state
            .lock()
            .results
            .values()
            .filter(|r| r.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn append_message(
        &self,
        case_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, StorageError> {
        let mut state = self.state.lock();
        let history = state.messages.entry(case_id.to_string()).or_default();
        let message = ConversationMessage {
            case_id: case_id.to_string(),
            seq: history.len() as u64,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        history.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, case_id: &str) -> Result<Vec<ConversationMessage>, StorageError> {
        Ok(self
            .state
            .lock()
            .messages
            .get(case_id)
            .cloned()
            .unwrap_or_default())
    }
}
