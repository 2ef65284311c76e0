//! Sled-backed result store
//!
//! Three trees: `cases` keyed by case id, `stage_results` keyed by
//! `case_id:stage_name`, `messages` keyed by `case_id:<zero-padded seq>`.
//! Values are JSON.

use crate::error::StorageError;
use crate::provider::MessageRole;
use crate::store::{CaseRecord, ConversationMessage, ResultStore, StageResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::{Db, Tree};
use std::io;
use std::path::Path;

const TREE_CASES: &str = "cases";
const TREE_STAGE_RESULTS: &str = "stage_results";
const TREE_MESSAGES: &str = "messages";
const MESSAGE_SEQ_PAD: usize = 20;

/// Sled implementation of [`ResultStore`]
#[derive(Clone)]
pub struct SledResultStore {
    db: Db,
    cases: Tree,
    stage_results: Tree,
    messages: Tree,
}

impl SledResultStore {
    /// Open (or create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(to_storage_io)?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let cases = db.open_tree(TREE_CASES).map_err(to_storage_io)?;
        let stage_results = db.open_tree(TREE_STAGE_RESULTS).map_err(to_storage_io)?;
        let messages = db.open_tree(TREE_MESSAGES).map_err(to_storage_io)?;
        Ok(Self {
            db,
            cases,
            stage_results,
            messages,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = tree.get(key.as_bytes()).map_err(to_storage_io)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw).map_err(to_storage_data)?))
    }

    fn put_json<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(to_storage_encode)?;
        tree.insert(key.as_bytes(), bytes).map_err(to_storage_io)?;
        Ok(())
    }

    /// Read-modify-write of one stage result, retried until no concurrent
    /// writer touched the key in between.
    fn update_stage_result<F>(&self, key: &str, mut apply: F) -> Result<Option<StageResult>, StorageError>
    where
        F: FnMut(Option<StageResult>) -> Option<StageResult>,
    {
        loop {
            let current = self
                .stage_results
                .get(key.as_bytes())
                .map_err(to_storage_io)?;
            let decoded: Option<StageResult> = current
                .as_ref()
                .map(|raw| serde_json::from_slice(raw))
                .transpose()
                .map_err(to_storage_data)?;
            let Some(updated) = apply(decoded) else {
                return Ok(None);
            };
            let bytes = serde_json::to_vec(&updated).map_err(to_storage_encode)?;
            let swapped = self
                .stage_results
                .compare_and_swap(key.as_bytes(), current, Some(bytes))
                .map_err(to_storage_io)?;
            if swapped.is_ok() {
                return Ok(Some(updated));
            }
        }
    }
}

fn stage_key(case_id: &str, stage_name: &str) -> String {
    format!("{case_id}:{stage_name}")
}

fn message_key(case_id: &str, seq: u64) -> String {
    format!("{case_id}:{seq:0MESSAGE_SEQ_PAD$}")
}

#[async_trait]
impl ResultStore for SledResultStore {
    async fn get_case(&self, case_id: &str) -> Result<Option<CaseRecord>, StorageError> {
        Self::get_json(&self.cases, case_id)
    }

    async fn put_case(&self, case: &CaseRecord) -> Result<(), StorageError> {
        Self::put_json(&self.cases, &case.id, case)
    }

    async fn get_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageResult>, StorageError> {
        Self::get_json(&self.stage_results, &stage_key(case_id, stage_name))
    }

    async fn upsert_stage_result(
        &self,
        case_id: &str,
        stage_name: &str,
        result: Value,
    ) -> Result<StageResult, StorageError> {
        let key = stage_key(case_id, stage_name);
        let updated = self.update_stage_result(&key, |existing| {
            Some(StageResult::merged(existing, case_id, stage_name, result.clone()))
        })?;
        updated.ok_or_else(|| StorageError::Corrupt(format!("upsert of {key} produced no record")))
    }

    async fn set_approved(
        &self,
        case_id: &str,
        stage_name: &str,
        approved: bool,
    ) -> Result<Option<StageResult>, StorageError> {
        let key = stage_key(case_id, stage_name);
        self.update_stage_result(&key, |existing| {
            existing.map(|mut current| {
                current.approved = approved;
                current.updated_at = Utc::now();
                current
            })
        })
    }

    async fn list_stage_results(&self, case_id: &str) -> Result<Vec<StageResult>, StorageError> {
        let prefix = format!("{case_id}:");
        let mut out = Vec::new();
        for entry in self.stage_results.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry.map_err(to_storage_io)?;
            let record: StageResult = serde_json::from_slice(&value).map_err(to_storage_data)?;
            // Prefix scans also match ids that merely start with `case_id:`.
            if record.case_id == case_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn append_message(
        &self,
        case_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, StorageError> {
        let seq = self.db.generate_id().map_err(to_storage_io)?;
        let message = ConversationMessage {
            case_id: case_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        Self::put_json(&self.messages, &message_key(case_id, seq), &message)?;
        Ok(message)
    }

    async fn list_messages(&self, case_id: &str) -> Result<Vec<ConversationMessage>, StorageError> {
        let prefix = format!("{case_id}:");
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry.map_err(to_storage_io)?;
            let message: ConversationMessage =
                serde_json::from_slice(&value).map_err(to_storage_data)?;
            if message.case_id == case_id {
                out.push(message);
            }
        }
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::Corrupt(err.to_string())
}

fn to_storage_encode(err: serde_json::Error) -> StorageError {
    StorageError::Encode(err.to_string())
}
