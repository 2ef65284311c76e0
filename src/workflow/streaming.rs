//! Live event streams for stage execution.
//!
//! `stream` validates the request, then spawns a producer that runs the stage
//! and feeds a transport owned by the returned [`StageStream`]. Results are
//! persisted exactly as `process` persists them.

use super::executor::{CaseContext, StageExecutor, StageRun, Target};
use super::prompts;
use super::stage::{BackendStage, Stage, StageGroup};
use crate::chunker;
use crate::error::{GenerationError, StreamError, WorkflowError};
use crate::generation::GenerationRequest;
use crate::stream::{Event, EventReceiver, EventSender, EventTransport, EventType, TransportStats};
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Event sequence of one streamed stage or group.
///
/// Dropping it cancels the producer.
pub struct StageStream {
    stage: Stage,
    receiver: EventReceiver,
    guard: DropGuard,
}

impl StageStream {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Next event, a heartbeat while idle, or `None` when the stage is done.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn stats(&self) -> TransportStats {
        self.receiver.stats()
    }

    pub fn into_events(self) -> impl Stream<Item = Event> + Send {
        let Self {
            receiver, guard, ..
        } = self;
        let events = receiver.into_stream();
        async_stream::stream! {
            let _guard = guard;
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                yield event;
            }
        }
    }

    /// Encoded wire text, one item per event
    pub fn into_wire(self) -> impl Stream<Item = String> + Send {
        let Self {
            receiver, guard, ..
        } = self;
        let wire = receiver.into_wire();
        async_stream::stream! {
            let _guard = guard;
            futures::pin_mut!(wire);
            while let Some(text) = wire.next().await {
                yield text;
            }
        }
    }
}

/// Queue an event; construction failures drop only that event.
fn emit(tx: &EventSender, event: Result<Event, StreamError>) {
    match event {
        Ok(event) => {
            if let Err(error) = tx.send(event) {
                debug!(error = %error, "Event not delivered");
            }
        }
        Err(error) => warn!(error = %error, "Dropping event that could not be built"),
    }
}

fn extra(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Text of a streamed generation plus its chunk count
struct Streamed {
    outcome: Result<String, GenerationError>,
    chunks: usize,
    latency_ms: u64,
}

impl StageExecutor {
    /// Stream a backend stage or a group without caller input.
    pub async fn stream(
        &self,
        case_id: &str,
        stage_name: &str,
        cancel: CancellationToken,
    ) -> Result<StageStream, WorkflowError> {
        self.stream_with_input(case_id, stage_name, None, cancel).await
    }

    /// Unknown stages and cases fail here, before anything is spawned.
    pub async fn stream_with_input(
        &self,
        case_id: &str,
        stage_name: &str,
        input: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<StageStream, WorkflowError> {
        let target = Target::parse(stage_name)?;
        let ctx = self.load_context(case_id).await?;
        let (tx, receiver) = EventTransport::channel(self.settings.transport);
        let cancel = cancel.child_token();
        let guard = cancel.clone().drop_guard();

        let executor = self.clone();
        let input = input.map(str::to_string);
        tokio::spawn(async move {
            executor.produce(ctx, target, input, cancel, tx).await;
        });

        Ok(StageStream {
            stage: target.stage(),
            receiver,
            guard,
        })
    }

    async fn produce(
        self,
        mut ctx: CaseContext,
        target: Target,
        input: Option<String>,
        cancel: CancellationToken,
        tx: EventSender,
    ) {
        let input = input.as_deref();
        let result = match target {
            Target::Backend(stage) => self.produce_backend(&mut ctx, stage, input, &cancel, &tx).await,
            Target::Group(group) => self.produce_group(&mut ctx, group, input, &cancel, &tx).await,
        };
        if let Err(error) = result {
            warn!(case_id = %ctx.case.id, stage = target.stage().as_str(), error = %error, "Stage stream aborted");
            emit(
                &tx,
                Event::error(error.code(), &error.to_string(), Some(target.stage().as_str())),
            );
        }
        debug!(case_id = %ctx.case.id, stage = target.stage().as_str(), stats = ?tx.stats(), "Stage stream finished");
    }

    fn start_event(&self, stage_id: &str, stage_name: &str) -> Result<Event, StreamError> {
        let event = Event::stage(EventType::Start, stage_id, stage_name, Map::new())?;
        Ok(match self.settings.retry_hint_ms {
            Some(millis) => event.with_retry(millis),
            None => event,
        })
    }

    /// Forward one generation as chunk events tagged with `stage_id`.
    async fn stream_generation(
        &self,
        request: GenerationRequest,
        stage_id: &str,
        cancel: &CancellationToken,
        tx: &EventSender,
    ) -> Streamed {
        let started = Instant::now();
        let mut chunks = self.client.stream(request, cancel.clone());
        let mut text = String::new();
        let mut count = 0;
        let mut failure = None;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    text.push_str(&chunk.content);
                    count += 1;
                    emit(tx, Event::chunk(&chunk, Some(stage_id)));
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        Streamed {
            outcome: match failure {
                Some(error) => Err(error),
                None => Ok(text),
            },
            chunks: count,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Start, Chunk*, then End and Metadata on success or Error on failure.
    /// `None` when cancelled; nothing is stored in that case.
    async fn stream_backend(
        &self,
        ctx: &mut CaseContext,
        stage: BackendStage,
        input: Option<&str>,
        cancel: &CancellationToken,
        tx: &EventSender,
    ) -> Result<Option<StageRun>, WorkflowError> {
        let stage_id = stage.as_str();
        emit(tx, self.start_event(stage_id, stage.display_name()));

        let streamed = match prompts::stage_prompt(stage, &ctx.case.case_text, &ctx.prior, input) {
            None => {
                let started = Instant::now();
                let text = input.unwrap_or(&ctx.case.case_text).to_string();
                let pieces = chunker::chunk(&text, self.client.settings().chunk_size, 0);
                for piece in &pieces {
                    emit(tx, Event::chunk(piece, Some(stage_id)));
                }
                Streamed {
                    outcome: Ok(text),
                    chunks: pieces.len(),
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
            Some(prompt) => {
                let request = self.stage_request(prompt, &ctx.history);
                self.stream_generation(request, stage_id, cancel, tx).await
            }
        };

        if let Err(error) = &streamed.outcome {
            emit(tx, Event::error(error.code(), &error.to_string(), Some(stage_id)));
            if *error == GenerationError::Cancelled {
                info!(case_id = %ctx.case.id, stage = stage_id, "Stage stream cancelled");
                return Ok(None);
            }
        }

        let length = streamed
            .outcome
            .as_ref()
            .map(|text| text.chars().count())
            .unwrap_or(0);
        let run = self.settle(stage, streamed.outcome);
        self.record(&ctx.case.id, &run, &mut ctx.prior).await?;

        if run.error.is_none() {
            emit(
                tx,
                Event::stage(
                    EventType::End,
                    stage_id,
                    stage.display_name(),
                    extra(vec![
                        ("total_chunks", json!(streamed.chunks)),
                        ("total_length", json!(length)),
                    ]),
                ),
            );
            let mut metadata = json!({
                "stage_id": stage_id,
                "provider": self.client.provider_name(),
                "model": self.client.model_name(),
                "total_chunks": streamed.chunks,
                "total_length": length,
                "latency_ms": streamed.latency_ms,
                "next_stage": run.next.as_str(),
            });
            if let Some(ready) = run.payload.get("ready") {
                metadata["ready"] = ready.clone();
            }
            emit(tx, Event::from_payload(EventType::Metadata, &metadata));
        }
        Ok(Some(run))
    }

    fn emit_stage_complete(&self, tx: &EventSender, run: &StageRun) {
        emit(
            tx,
            Event::stage(
                EventType::StageComplete,
                run.stage.as_str(),
                run.stage.display_name(),
                extra(vec![
                    ("next_stage", json!(run.next.as_str())),
                    ("result", Value::Object(run.payload.clone())),
                ]),
            ),
        );
    }

    async fn produce_backend(
        &self,
        ctx: &mut CaseContext,
        stage: BackendStage,
        input: Option<&str>,
        cancel: &CancellationToken,
        tx: &EventSender,
    ) -> Result<(), WorkflowError> {
        let Some(run) = self.stream_backend(ctx, stage, input, cancel, tx).await? else {
            return Ok(());
        };

        let group = stage.group();
        let (backend_results, prior) = self.group_state(&ctx.case.id, group).await?;
        let request = GenerationRequest::new(prompts::summary_prompt(group, &prior));
        let summary = self.client.invoke(&request).await.outcome;
        self.finish_rollup(&ctx.case.id, group, backend_results, summary)
            .await?;
        self.advance_case(&mut ctx.case, run.next).await?;

        if run.error.is_none() {
            self.emit_stage_complete(tx, &run);
        }
        Ok(())
    }

    async fn produce_group(
        &self,
        ctx: &mut CaseContext,
        group: StageGroup,
        input: Option<&str>,
        cancel: &CancellationToken,
        tx: &EventSender,
    ) -> Result<(), WorkflowError> {
        let group_id = group.as_str();
        let total = group.stages().len();
        emit(tx, self.start_event(group_id, group.display_name()));

        for (done, &stage) in group.stages().iter().enumerate() {
            let routed = input.filter(|_| stage.accepts_input());
            let Some(run) = self.stream_backend(ctx, stage, routed, cancel, tx).await? else {
                return Ok(());
            };
            if run.error.is_none() {
                self.emit_stage_complete(tx, &run);
            }
            emit(tx, Event::progress(group_id, done + 1, total));
        }

        let (backend_results, prior) = self.group_state(&ctx.case.id, group).await?;
        let request = GenerationRequest::new(prompts::summary_prompt(group, &prior));
        let summary = self.stream_generation(request, group_id, cancel, tx).await;

        if let Err(error) = &summary.outcome {
            emit(tx, Event::error(error.code(), &error.to_string(), Some(group_id)));
            if *error == GenerationError::Cancelled {
                return Ok(());
            }
        }

        let rollup = self
            .finish_rollup(&ctx.case.id, group, backend_results, summary.outcome)
            .await?;
        self.advance_case(&mut ctx.case, rollup.next).await?;

        if rollup.summary_error.is_none() {
            emit(
                tx,
                Event::stage(
                    EventType::End,
                    group_id,
                    group.display_name(),
                    extra(vec![("total_chunks", json!(summary.chunks))]),
                ),
            );
            emit(
                tx,
                Event::stage(
                    EventType::StageComplete,
                    group_id,
                    group.display_name(),
                    extra(vec![
                        ("next_stage", json!(rollup.next.as_str())),
                        (
                            "summary",
                            rollup.payload.get("summary").cloned().unwrap_or(Value::Null),
                        ),
                    ]),
                ),
            );
        }
        Ok(())
    }
}
