//! Shared test utilities for integration tests
//!
//! Builds executors over the scripted provider and an in-memory store, with a
//! responder that answers each stage prompt with a recognisable reply.

use casework::generation::{GenerationClient, GenerationSettings};
use casework::provider::{ChatMessage, ScriptStep, ScriptedProvider};
use casework::store::InMemoryResultStore;
use casework::workflow::prompts;
use casework::workflow::{ErrorPolicy, ExecutorSettings, StageExecutor};
use std::sync::{Arc, Mutex};

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

pub const VALIDATION_READY: &str = "Status: ✅ Yes – All data is available.";
pub const VALIDATION_PENDING: &str = "Status: ❌ No – need a recent WBC count.";
pub const COUNTERFACTUAL_REPLY: &str =
    "## Causal Pathways\nSmoking → COPD → dyspnoea\n## Differentials\nAsthma is less likely";

/// Reply the scripted responder gives for each template
const REPLIES: &[(&str, &str)] = &[
    (prompts::CASE_ANALYSIS_SUMMARY, "SUMMARY case analysis"),
    (prompts::DIAGNOSIS_SUMMARY, "SUMMARY diagnosis"),
    (prompts::TREATMENT_SUMMARY, "SUMMARY treatment"),
    (prompts::EXTRACTION, "FACTORS fever, cough, 40 pack-years"),
    (prompts::CAUSAL_ANALYSIS, "LINKS smoking drives airway damage"),
    (prompts::VALIDATION, VALIDATION_READY),
    (prompts::COUNTERFACTUAL, COUNTERFACTUAL_REPLY),
    (prompts::DIAGNOSIS, "DIAGNOSIS community acquired pneumonia"),
    (prompts::TREATMENT_PLANNING, "PLAN antibiotics and oxygen"),
    (prompts::PATIENT_SPECIFIC, "TAILORED amoxicillin, no penicillin allergy"),
    (prompts::FINAL_PLAN, "FINAL amoxicillin 1 g tid for 5 days"),
    (prompts::NOTE, "NOTE Subjective: fever"),
];

fn opening_line(template: &str) -> &str {
    template.lines().next().unwrap_or(template)
}

/// Which template a rendered prompt came from, by its opening line
pub fn reply_for(prompt: &str) -> &'static str {
    REPLIES
        .iter()
        .find(|(template, _)| prompt.contains(opening_line(template)))
        .map(|(_, reply)| *reply)
        .unwrap_or("UNRECOGNISED")
}

fn rendered_prompt(messages: &[ChatMessage]) -> &str {
    messages.first().map(|m| m.content.as_str()).unwrap_or("")
}

/// Answers every prompt from the reply table
pub fn stage_responder() -> ScriptedProvider {
    ScriptedProvider::with_responder("scripted-model", |messages| {
        ScriptStep::Reply(reply_for(rendered_prompt(messages)).to_string())
    })
}

/// Like [`stage_responder`], but validation answers with `validation`
pub fn responder_with_validation(validation: &'static str) -> ScriptedProvider {
    ScriptedProvider::with_responder("scripted-model", move |messages| {
        let prompt = rendered_prompt(messages);
        if prompt.contains(opening_line(prompts::VALIDATION)) {
            ScriptStep::Reply(validation.to_string())
        } else {
            ScriptStep::Reply(reply_for(prompt).to_string())
        }
    })
}

pub fn no_retry_settings() -> GenerationSettings {
    GenerationSettings {
        max_retries: 0,
        ..GenerationSettings::default()
    }
}

pub fn executor_with(provider: ScriptedProvider, policy: ErrorPolicy) -> StageExecutor {
    StageExecutor::new(
        Arc::new(GenerationClient::new(Arc::new(provider), no_retry_settings())),
        Arc::new(InMemoryResultStore::new()),
        ExecutorSettings {
            error_policy: policy,
            ..ExecutorSettings::default()
        },
    )
}

pub fn executor(provider: ScriptedProvider) -> StageExecutor {
    executor_with(provider, ErrorPolicy::Advance)
}

/// Run `f` with `vars` set, restoring the previous values afterwards
pub fn with_env<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(name, _)| (name.to_string(), std::env::var(name).ok()))
        .collect();
    for (name, value) in vars {
        match value {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    let result = f();

    for (name, value) in saved {
        match value {
            Some(value) => std::env::set_var(&name, value),
            None => std::env::remove_var(&name),
        }
    }
    result
}
