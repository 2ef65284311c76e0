//! Stage prompt templates and rendering.
//!
//! Templates live under `prompts/` and are embedded at build time. Placeholders
//! are `{name}` and are filled in a single pass.

use super::stage::{BackendStage, StageGroup};
use crate::store::StageResult;
use std::collections::HashMap;

pub const EXTRACTION: &str = include_str!("../../prompts/extraction.md");
pub const CAUSAL_ANALYSIS: &str = include_str!("../../prompts/causal_analysis.md");
pub const VALIDATION: &str = include_str!("../../prompts/validation.md");
pub const COUNTERFACTUAL: &str = include_str!("../../prompts/counterfactual.md");
pub const DIAGNOSIS: &str = include_str!("../../prompts/diagnosis.md");
pub const TREATMENT_PLANNING: &str = include_str!("../../prompts/treatment_planning.md");
pub const PATIENT_SPECIFIC: &str = include_str!("../../prompts/patient_specific.md");
pub const FINAL_PLAN: &str = include_str!("../../prompts/final_plan.md");
pub const CASE_ANALYSIS_SUMMARY: &str = include_str!("../../prompts/case_analysis_summary.md");
pub const DIAGNOSIS_SUMMARY: &str = include_str!("../../prompts/diagnosis_summary.md");
pub const TREATMENT_SUMMARY: &str = include_str!("../../prompts/treatment_summary.md");
pub const NOTE: &str = include_str!("../../prompts/note.md");

/// Marker a validation reply must contain to let the pipeline move on
pub const READY_MARKER: &str = "✅ Yes";

/// Single pass over `template`; inserted values are never scanned again and
/// unknown `{name}` tokens are left as written.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| (*value, close))
        });
        match value {
            Some((value, close)) => {
                rendered.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                rendered.push('{');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Text produced so far by each backend stage of one case
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorOutputs {
    texts: HashMap<BackendStage, String>,
}

impl PriorOutputs {
    /// Results of groups, unknown names and failed stages contribute nothing.
    pub fn from_results(results: &[StageResult]) -> Self {
        let mut prior = Self::default();
        for record in results {
            let Some(stage) = BackendStage::ALL
                .iter()
                .copied()
                .find(|s| s.as_str() == record.stage_name)
            else {
                continue;
            };
            if let Some(text) = record.result.get(stage.output_key()).and_then(|v| v.as_str()) {
                prior.insert(stage, text);
            }
        }
        prior
    }

    pub fn insert(&mut self, stage: BackendStage, text: impl Into<String>) {
        self.texts.insert(stage, text.into());
    }

    pub fn get(&self, stage: BackendStage) -> Option<&str> {
        self.texts.get(&stage).map(String::as_str)
    }

    /// Empty string when the stage has produced nothing yet
    pub fn text(&self, stage: BackendStage) -> &str {
        self.get(stage).unwrap_or("")
    }

    fn text_or<'a>(&'a self, stage: BackendStage, fallback: Option<&'a str>) -> &'a str {
        self.get(stage).or(fallback).unwrap_or("")
    }
}

fn with_additional(mut context: String, heading: &str, input: Option<&str>) -> String {
    if let Some(extra) = input.filter(|s| !s.trim().is_empty()) {
        context.push_str(&format!("\n\n{}:\n{}", heading, extra));
    }
    context
}

/// Prompt for one backend stage, `None` for `initial`.
///
/// Stages read the outputs of the stages before them. A missing predecessor
/// output falls back to the caller's input where the stage has a single source.
pub fn stage_prompt(
    stage: BackendStage,
    case_text: &str,
    prior: &PriorOutputs,
    input: Option<&str>,
) -> Option<String> {
    use BackendStage::*;

    let prompt = match stage {
        Initial => return None,
        Extraction => render(EXTRACTION, &[("case_text", input.unwrap_or(case_text))]),
        CausalAnalysis => render(
            CAUSAL_ANALYSIS,
            &[("extracted_factors", prior.text_or(Extraction, input))],
        ),
        Validation => {
            let context = format!(
                "Extracted Factors:\n{}\n\nCausal Links:\n{}",
                prior.text(Extraction),
                prior.text(CausalAnalysis)
            );
            let context = with_additional(context, "Additional Information", input);
            render(VALIDATION, &[("combined_context", &context)])
        }
        Counterfactual => {
            let context = format!(
                "Extracted Factors:\n{}\n\nCausal Links:\n{}\n\nValidation:\n{}",
                prior.text(Extraction),
                prior.text(CausalAnalysis),
                prior.text(Validation)
            );
            let context = with_additional(context, "Additional Information", input);
            render(COUNTERFACTUAL, &[("combined_context", &context)])
        }
        Diagnosis => {
            let analysis = match prior.get(Counterfactual) {
                Some(text) => with_additional(text.to_string(), "Additional Information", input),
                None => input.unwrap_or("").to_string(),
            };
            render(DIAGNOSIS, &[("counterfactual_analysis", &analysis)])
        }
        TreatmentPlanning => render(
            TREATMENT_PLANNING,
            &[("diagnosis", prior.text_or(Diagnosis, input))],
        ),
        PatientSpecific => {
            let context = format!(
                "Diagnosis:\n{}\n\nTreatment Options:\n{}",
                prior.text(Diagnosis),
                prior.text(TreatmentPlanning)
            );
            let context = with_additional(context, "Patient-Specific Information", input);
            render(PATIENT_SPECIFIC, &[("combined_context", &context)])
        }
        FinalPlan => {
            let context = format!(
                "Treatment Options:\n{}\n\nPatient-Specific Plan:\n{}",
                prior.text(TreatmentPlanning),
                prior.text(PatientSpecific)
            );
            let context = with_additional(context, "Additional Information", input);
            render(FINAL_PLAN, &[("combined_context", &context)])
        }
    };
    Some(prompt)
}

pub fn summary_prompt(group: StageGroup, prior: &PriorOutputs) -> String {
    use BackendStage::*;

    match group {
        StageGroup::PatientCaseAnalysis => render(
            CASE_ANALYSIS_SUMMARY,
            &[
                ("extracted_factors", prior.text(Extraction)),
                ("causal_links", prior.text(CausalAnalysis)),
                ("validation_result", prior.text(Validation)),
            ],
        ),
        StageGroup::Diagnosis => render(
            DIAGNOSIS_SUMMARY,
            &[
                ("counterfactual_analysis", prior.text(Counterfactual)),
                ("diagnosis", prior.text(Diagnosis)),
            ],
        ),
        StageGroup::TreatmentPlanning => render(
            TREATMENT_SUMMARY,
            &[
                ("treatment_plan", prior.text(TreatmentPlanning)),
                ("patient_specific_plan", prior.text(PatientSpecific)),
                ("final_treatment_plan", prior.text(FinalPlan)),
            ],
        ),
    }
}

pub fn note_prompt(case_text: &str, prior: &PriorOutputs) -> String {
    use BackendStage::*;

    let plan = prior.get(FinalPlan).unwrap_or_else(|| prior.text(TreatmentPlanning));
    render(
        NOTE,
        &[
            ("case_details", case_text),
            ("extracted_factors", prior.text(Extraction)),
            ("diagnosis_analysis", prior.text(Diagnosis)),
            ("treatment_plan", plan),
        ],
    )
}

pub fn is_ready(validation_text: &str) -> bool {
    validation_text.contains(READY_MARKER)
}
