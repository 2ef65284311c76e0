//! Stage Executor
//!
//! Drives one case through the backend stages, persists every stage result,
//! keeps each group's rollup current and moves the case's `current_stage`.
//! Generation failures never escape as `Err`: they are stored in the stage
//! result and reported in the outcome.

use super::prompts::{self, PriorOutputs};
use super::sections::extract_relevant_sections;
use super::stage::{BackendStage, Stage, StageGroup};
use crate::error::{GenerationError, WorkflowError};
use crate::generation::{GenerationClient, GenerationRequest};
use crate::provider::{ChatMessage, MessageRole};
use crate::store::{CaseRecord, ConversationMessage, ResultStore, StageResult};
use crate::stream::TransportConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What happens to `current_stage` when a stage's generation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Move on as if the stage had succeeded (validation still loops)
    #[default]
    Advance,
    /// Stay on the failed stage
    Halt,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorSettings {
    pub error_policy: ErrorPolicy,
    pub transport: TransportConfig,
    /// Reconnect hint attached to the first event of every stream
    pub retry_hint_ms: Option<u64>,
}

/// A stage whose generation failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub error: GenerationError,
}

/// Result of `process`
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub case_id: String,
    pub stage: String,
    /// Payload persisted for `stage`
    pub result: Value,
    pub next_stage: String,
    pub failures: Vec<StageFailure>,
    pub processing_ms: u64,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of `approve`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub case_id: String,
    pub stage: String,
    pub previous_stage: String,
    pub current_stage: String,
    /// False when the successor is not ahead of where the case already is
    pub advanced: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseStatus {
    pub case: CaseRecord,
    /// Pipeline order
    pub results: Vec<StageResult>,
    pub message_count: usize,
}

/// A stage name the executor can run or approve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Target {
    Backend(BackendStage),
    Group(StageGroup),
}

impl Target {
    pub(super) fn parse(name: &str) -> Result<Self, WorkflowError> {
        match name.parse::<Stage>()? {
            Stage::Backend(stage) => Ok(Target::Backend(stage)),
            Stage::Group(group) => Ok(Target::Group(group)),
            Stage::Complete => Err(WorkflowError::UnknownStage(name.to_string())),
        }
    }

    pub(super) fn stage(self) -> Stage {
        match self {
            Target::Backend(stage) => Stage::Backend(stage),
            Target::Group(group) => Stage::Group(group),
        }
    }
}

/// Everything a stage prompt may draw on
pub(super) struct CaseContext {
    pub(super) case: CaseRecord,
    pub(super) history: Vec<ChatMessage>,
    pub(super) prior: PriorOutputs,
}

/// Settled output of one backend stage
pub(super) struct StageRun {
    pub(super) stage: BackendStage,
    pub(super) payload: Map<String, Value>,
    pub(super) next: Stage,
    pub(super) error: Option<GenerationError>,
}

pub(super) struct Rollup {
    pub(super) payload: Map<String, Value>,
    pub(super) next: Stage,
    pub(super) summary_error: Option<GenerationError>,
}

pub(super) fn error_value(error: &GenerationError) -> Value {
    json!({ "code": error.code(), "message": error.to_string() })
}

/// Shared by every caller; clones share the client and store.
#[derive(Clone)]
pub struct StageExecutor {
    pub(super) client: Arc<GenerationClient>,
    pub(super) store: Arc<dyn ResultStore>,
    pub(super) settings: ExecutorSettings,
}

impl StageExecutor {
    pub fn new(
        client: Arc<GenerationClient>,
        store: Arc<dyn ResultStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            client,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Create the case at `initial`, or replace the text of an existing one.
    pub async fn create_case(&self, case_id: &str, case_text: &str) -> Result<CaseRecord, WorkflowError> {
        let record = match self.store.get_case(case_id).await? {
            Some(mut existing) => {
                existing.case_text = case_text.to_string();
                existing.updated_at = Utc::now();
                existing
            }
            None => CaseRecord::new(case_id, case_text, BackendStage::Initial.as_str()),
        };
        self.store.put_case(&record).await?;
        info!(case_id, stage = %record.current_stage, "Case saved");
        Ok(record)
    }

    pub async fn add_message(
        &self,
        case_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, WorkflowError> {
        self.load_case(case_id).await?;
        let message = self.store.append_message(case_id, role, content).await?;
        debug!(case_id, role = role.as_str(), seq = message.seq, "Message appended");
        Ok(message)
    }

    pub async fn messages(&self, case_id: &str) -> Result<Vec<ConversationMessage>, WorkflowError> {
        self.load_case(case_id).await?;
        Ok(self.store.list_messages(case_id).await?)
    }

    /// Run the first group.
    pub async fn start(&self, case_id: &str) -> Result<StageOutcome, WorkflowError> {
        self.process(case_id, StageGroup::PatientCaseAnalysis.as_str(), None)
            .await
    }

    /// Run a backend stage or a whole group.
    ///
    /// A backend stage also refreshes its group's rollup. A group runs each of
    /// its stages in order, routing `input` to the stages that accept it, then
    /// rolls up once.
    pub async fn process(
        &self,
        case_id: &str,
        stage_name: &str,
        input: Option<&str>,
    ) -> Result<StageOutcome, WorkflowError> {
        let target = Target::parse(stage_name)?;
        let started = Instant::now();
        let mut ctx = self.load_context(case_id).await?;
        let mut failures = Vec::new();

        let (result, next) = match target {
            Target::Backend(stage) => {
                let run = self.run_backend(&mut ctx, stage, input).await?;
                let rollup = self.rollup(case_id, stage.group()).await?;
                if let Some(error) = run.error {
                    failures.push(StageFailure {
                        stage: stage.as_str().to_string(),
                        error,
                    });
                }
                if let Some(error) = rollup.summary_error {
                    failures.push(StageFailure {
                        stage: stage.group().as_str().to_string(),
                        error,
                    });
                }
                (Value::Object(run.payload), run.next)
            }
            Target::Group(group) => {
                for &stage in group.stages() {
                    let routed = input.filter(|_| stage.accepts_input());
                    let run = self.run_backend(&mut ctx, stage, routed).await?;
                    if let Some(error) = run.error {
                        failures.push(StageFailure {
                            stage: stage.as_str().to_string(),
                            error,
                        });
                    }
                }
                let rollup = self.rollup(case_id, group).await?;
                if let Some(error) = rollup.summary_error {
                    failures.push(StageFailure {
                        stage: group.as_str().to_string(),
                        error,
                    });
                }
                (Value::Object(rollup.payload), rollup.next)
            }
        };

        self.advance_case(&mut ctx.case, next).await?;
        let processing_ms = started.elapsed().as_millis() as u64;
        info!(
            case_id,
            stage = target.stage().as_str(),
            next_stage = next.as_str(),
            failures = failures.len(),
            processing_ms,
            "Stage processed"
        );

        Ok(StageOutcome {
            case_id: case_id.to_string(),
            stage: target.stage().as_str().to_string(),
            result,
            next_stage: next.as_str().to_string(),
            failures,
            processing_ms,
        })
    }

    /// Mark a processed stage approved and move the case to its successor,
    /// unless the case is already at or past that point.
    pub async fn approve(&self, case_id: &str, stage_name: &str) -> Result<ApprovalOutcome, WorkflowError> {
        let target = Target::parse(stage_name)?;
        let stage = target.stage();
        let mut case = self.load_case(case_id).await?;

        if self
            .store
            .set_approved(case_id, stage.as_str(), true)
            .await?
            .is_none()
        {
            return Err(WorkflowError::StageResultNotFound {
                case_id: case_id.to_string(),
                stage_name: stage.as_str().to_string(),
            });
        }

        let successor = stage.successor().unwrap_or(Stage::Complete);
        let current_rank = case
            .current_stage
            .parse::<Stage>()
            .map(Stage::rank)
            .unwrap_or(0);
        let previous_stage = case.current_stage.clone();
        let advanced = successor.rank() > current_rank;

        if advanced || (successor.is_complete() && !case.complete) {
            if advanced {
                case.current_stage = successor.as_str().to_string();
            }
            if successor.is_complete() {
                case.complete = true;
            }
            case.updated_at = Utc::now();
            self.store.put_case(&case).await?;
        }

        info!(
            case_id,
            stage = stage.as_str(),
            from = %previous_stage,
            to = %case.current_stage,
            advanced,
            complete = case.complete,
            "Stage approved"
        );

        Ok(ApprovalOutcome {
            case_id: case_id.to_string(),
            stage: stage.as_str().to_string(),
            previous_stage,
            current_stage: case.current_stage,
            advanced,
            complete: case.complete,
        })
    }

    pub async fn status(&self, case_id: &str) -> Result<CaseStatus, WorkflowError> {
        let case = self.load_case(case_id).await?;
        let mut results = self.store.list_stage_results(case_id).await?;
        results.sort_by_key(|r| {
            let rank = r.stage_name.parse::<Stage>().map(Stage::rank).unwrap_or(usize::MAX);
            // Groups sort after the backend stages they start with.
            let is_group = matches!(r.stage_name.parse::<Stage>(), Ok(Stage::Group(_)));
            (rank, is_group, r.stage_name.clone())
        });
        let message_count = self.store.list_messages(case_id).await?.len();
        Ok(CaseStatus {
            case,
            results,
            message_count,
        })
    }

    /// Clinical note for a completed case.
    pub async fn generate_note(&self, case_id: &str) -> Result<String, WorkflowError> {
        let case = self.load_case(case_id).await?;
        if !case.complete {
            return Err(WorkflowError::CaseNotComplete(case_id.to_string()));
        }
        let results = self.store.list_stage_results(case_id).await?;
        let prior = PriorOutputs::from_results(&results);
        let request = GenerationRequest::new(prompts::note_prompt(&case.case_text, &prior));
        let generated = self.client.invoke(&request).await;
        let note = generated.outcome?;
        info!(case_id, chars = note.chars().count(), "Clinical note generated");
        Ok(note)
    }

    pub(super) async fn load_case(&self, case_id: &str) -> Result<CaseRecord, WorkflowError> {
        self.store
            .get_case(case_id)
            .await?
            .ok_or_else(|| WorkflowError::CaseNotFound(case_id.to_string()))
    }

    pub(super) async fn load_context(&self, case_id: &str) -> Result<CaseContext, WorkflowError> {
        let case = self.load_case(case_id).await?;
        let history = self
            .store
            .list_messages(case_id)
            .await?
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect();
        let results = self.store.list_stage_results(case_id).await?;
        Ok(CaseContext {
            case,
            history,
            prior: PriorOutputs::from_results(&results),
        })
    }

    pub(super) fn stage_request(&self, prompt: String, history: &[ChatMessage]) -> GenerationRequest {
        GenerationRequest::new(prompt).with_history(history.to_vec())
    }

    /// Turn a generation outcome into the stage's payload and next pointer.
    pub(super) fn settle(&self, stage: BackendStage, outcome: Result<String, GenerationError>) -> StageRun {
        let mut payload = Map::new();
        let mut ready = true;

        let error = match outcome {
            Ok(text) => {
                if stage == BackendStage::Validation {
                    ready = prompts::is_ready(&text);
                    payload.insert("ready".into(), Value::Bool(ready));
                }
                if stage == BackendStage::Counterfactual {
                    payload.insert(
                        "causal_sections".into(),
                        json!(extract_relevant_sections(&text)),
                    );
                }
                payload.insert(stage.output_key().into(), Value::String(text));
                None
            }
            Err(error) => {
                if stage == BackendStage::Validation {
                    ready = false;
                    payload.insert("ready".into(), Value::Bool(false));
                }
                payload.insert("error".into(), error_value(&error));
                Some(error)
            }
        };

        let next = if stage == BackendStage::Validation && !ready {
            Stage::Backend(BackendStage::Validation)
        } else if error.is_some() && self.settings.error_policy == ErrorPolicy::Halt {
            Stage::Backend(stage)
        } else {
            stage.successor()
        };
        payload.insert("next_stage".into(), Value::String(next.as_str().to_string()));

        StageRun {
            stage,
            payload,
            next,
            error,
        }
    }

    /// Upsert a settled stage and make its text visible to later stages.
    pub(super) async fn record(
        &self,
        case_id: &str,
        run: &StageRun,
        prior: &mut PriorOutputs,
    ) -> Result<(), WorkflowError> {
        self.store
            .upsert_stage_result(case_id, run.stage.as_str(), Value::Object(run.payload.clone()))
            .await?;
        if let Some(text) = run.payload.get(run.stage.output_key()).and_then(Value::as_str) {
            prior.insert(run.stage, text);
        }
        match &run.error {
            None => debug!(case_id, stage = run.stage.as_str(), next_stage = run.next.as_str(), "Stage result stored"),
            Some(error) => warn!(
                case_id,
                stage = run.stage.as_str(),
                code = error.code(),
                error = %error,
                "Stage failed; error stored"
            ),
        }
        Ok(())
    }

    async fn run_backend(
        &self,
        ctx: &mut CaseContext,
        stage: BackendStage,
        input: Option<&str>,
    ) -> Result<StageRun, WorkflowError> {
        let outcome = match prompts::stage_prompt(stage, &ctx.case.case_text, &ctx.prior, input) {
            None => Ok(input.unwrap_or(&ctx.case.case_text).to_string()),
            Some(prompt) => {
                let request = self.stage_request(prompt, &ctx.history);
                self.client.invoke(&request).await.outcome
            }
        };
        let run = self.settle(stage, outcome);
        self.record(&ctx.case.id, &run, &mut ctx.prior).await?;
        Ok(run)
    }

    /// Stored results of the group's stages, in pipeline order.
    pub(super) async fn group_state(
        &self,
        case_id: &str,
        group: StageGroup,
    ) -> Result<(Map<String, Value>, PriorOutputs), WorkflowError> {
        let members: Vec<StageResult> = self
            .store
            .list_stage_results(case_id)
            .await?
            .into_iter()
            .filter(|r| group.stages().iter().any(|s| s.as_str() == r.stage_name))
            .collect();

        let mut backend_results = Map::new();
        for stage in group.stages() {
            if let Some(record) = members.iter().find(|r| r.stage_name == stage.as_str()) {
                backend_results.insert(stage.as_str().to_string(), record.result.clone());
            }
        }
        Ok((backend_results, PriorOutputs::from_results(&members)))
    }

    fn group_next(&self, group: StageGroup, backend_results: &Map<String, Value>) -> Stage {
        let validation_pending = backend_results
            .get(BackendStage::Validation.as_str())
            .and_then(|v| v.get("ready"))
            .and_then(Value::as_bool)
            == Some(false);
        let failed = backend_results.values().any(|v| v.get("error").is_some());

        if validation_pending || (failed && self.settings.error_policy == ErrorPolicy::Halt) {
            Stage::Group(group)
        } else {
            group.successor()
        }
    }

    /// Store the group rollup built from `backend_results` and a summary outcome.
    pub(super) async fn finish_rollup(
        &self,
        case_id: &str,
        group: StageGroup,
        backend_results: Map<String, Value>,
        summary: Result<String, GenerationError>,
    ) -> Result<Rollup, WorkflowError> {
        let next = self.group_next(group, &backend_results);
        let mut payload = Map::new();
        payload.insert("backend_results".into(), Value::Object(backend_results));
        let summary_error = match summary {
            Ok(text) => {
                payload.insert("summary".into(), Value::String(text));
                None
            }
            Err(error) => {
                warn!(case_id, group = group.as_str(), error = %error, "Group summary failed");
                payload.insert("summary".into(), Value::Null);
                payload.insert("summary_error".into(), error_value(&error));
                Some(error)
            }
        };
        payload.insert("next_stage".into(), Value::String(next.as_str().to_string()));

        self.store
            .upsert_stage_result(case_id, group.as_str(), Value::Object(payload.clone()))
            .await?;
        debug!(case_id, group = group.as_str(), next_stage = next.as_str(), "Group rollup stored");

        Ok(Rollup {
            payload,
            next,
            summary_error,
        })
    }

    async fn rollup(&self, case_id: &str, group: StageGroup) -> Result<Rollup, WorkflowError> {
        let (backend_results, prior) = self.group_state(case_id, group).await?;
        let request = GenerationRequest::new(prompts::summary_prompt(group, &prior));
        let summary = self.client.invoke(&request).await.outcome;
        self.finish_rollup(case_id, group, backend_results, summary).await
    }

    /// Point the case at `next`. Reaching `complete` is one-way: a finished
    /// case keeps `current_stage` at `complete` whatever is reprocessed.
    pub(super) async fn advance_case(&self, case: &mut CaseRecord, next: Stage) -> Result<(), WorkflowError> {
        if next.is_complete() {
            case.complete = true;
        }
        let next = if case.complete { Stage::Complete } else { next };
        let previous = std::mem::replace(&mut case.current_stage, next.as_str().to_string());
        case.updated_at = Utc::now();
        self.store.put_case(case).await?;
        info!(
            case_id = %case.id,
            from = %previous,
            to = next.as_str(),
            complete = case.complete,
            "Case stage updated"
        );
        Ok(())
    }
}
