//! Stage names and the static transition table.
//!
//! Nine backend stages run in a fixed order. Three groups each cover a
//! contiguous run of them. `complete` is terminal for both sequences.

use crate::error::WorkflowError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendStage {
    Initial,
    Extraction,
    CausalAnalysis,
    Validation,
    Counterfactual,
    Diagnosis,
    TreatmentPlanning,
    PatientSpecific,
    FinalPlan,
}

impl BackendStage {
    pub const ALL: [BackendStage; 9] = [
        BackendStage::Initial,
        BackendStage::Extraction,
        BackendStage::CausalAnalysis,
        BackendStage::Validation,
        BackendStage::Counterfactual,
        BackendStage::Diagnosis,
        BackendStage::TreatmentPlanning,
        BackendStage::PatientSpecific,
        BackendStage::FinalPlan,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendStage::Initial => "initial",
            BackendStage::Extraction => "extraction",
            BackendStage::CausalAnalysis => "causal_analysis",
            BackendStage::Validation => "validation",
            BackendStage::Counterfactual => "counterfactual",
            BackendStage::Diagnosis => "diagnosis",
            BackendStage::TreatmentPlanning => "treatment_planning",
            BackendStage::PatientSpecific => "patient_specific",
            BackendStage::FinalPlan => "final_plan",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            BackendStage::Initial => "Initial Case",
            BackendStage::Extraction => "Factor Extraction",
            BackendStage::CausalAnalysis => "Causal Analysis",
            BackendStage::Validation => "Information Validation",
            BackendStage::Counterfactual => "Counterfactual Analysis",
            BackendStage::Diagnosis => "Diagnosis Ranking",
            BackendStage::TreatmentPlanning => "Treatment Planning",
            BackendStage::PatientSpecific => "Patient-Specific Plan",
            BackendStage::FinalPlan => "Final Treatment Plan",
        }
    }

    /// Position in pipeline order, 0-based
    pub fn index(self) -> usize {
        self as usize
    }

    /// Static successor; `final_plan` leads to `complete`.
    pub fn successor(self) -> Stage {
        match Self::ALL.get(self.index() + 1) {
            Some(next) => Stage::Backend(*next),
            None => Stage::Complete,
        }
    }

    pub fn group(self) -> StageGroup {
        match self {
            BackendStage::Initial
            | BackendStage::Extraction
            | BackendStage::CausalAnalysis
            | BackendStage::Validation => StageGroup::PatientCaseAnalysis,
            BackendStage::Counterfactual | BackendStage::Diagnosis => StageGroup::Diagnosis,
            BackendStage::TreatmentPlanning
            | BackendStage::PatientSpecific
            | BackendStage::FinalPlan => StageGroup::TreatmentPlanning,
        }
    }

    /// Key under which the stage's text lands in its result payload
    pub fn output_key(self) -> &'static str {
        match self {
            BackendStage::Initial => "case_text",
            BackendStage::Extraction => "extracted_factors",
            BackendStage::CausalAnalysis => "causal_links",
            BackendStage::Validation => "validation_result",
            BackendStage::Counterfactual => "counterfactual_analysis",
            BackendStage::Diagnosis => "diagnosis",
            BackendStage::TreatmentPlanning => "treatment_plan",
            BackendStage::PatientSpecific => "patient_specific_plan",
            BackendStage::FinalPlan => "final_treatment_plan",
        }
    }

    /// Stages that receive caller input when their group runs as a whole
    pub fn accepts_input(self) -> bool {
        matches!(
            self,
            BackendStage::Initial
                | BackendStage::Extraction
                | BackendStage::Diagnosis
                | BackendStage::PatientSpecific
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageGroup {
    PatientCaseAnalysis,
    Diagnosis,
    TreatmentPlanning,
}

impl StageGroup {
    pub const ALL: [StageGroup; 3] = [
        StageGroup::PatientCaseAnalysis,
        StageGroup::Diagnosis,
        StageGroup::TreatmentPlanning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageGroup::PatientCaseAnalysis => "patient_case_analysis_group",
            StageGroup::Diagnosis => "diagnosis_group",
            StageGroup::TreatmentPlanning => "treatment_planning_group",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            StageGroup::PatientCaseAnalysis => "Patient Case Analysis",
            StageGroup::Diagnosis => "Diagnosis",
            StageGroup::TreatmentPlanning => "Treatment Planning",
        }
    }

    pub fn stages(self) -> &'static [BackendStage] {
        match self {
            StageGroup::PatientCaseAnalysis => &BackendStage::ALL[0..4],
            StageGroup::Diagnosis => &BackendStage::ALL[4..6],
            StageGroup::TreatmentPlanning => &BackendStage::ALL[6..9],
        }
    }

    pub fn successor(self) -> Stage {
        match self {
            StageGroup::PatientCaseAnalysis => Stage::Group(StageGroup::Diagnosis),
            StageGroup::Diagnosis => Stage::Group(StageGroup::TreatmentPlanning),
            StageGroup::TreatmentPlanning => Stage::Complete,
        }
    }
}

/// Any name a caller can hand to the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Backend(BackendStage),
    Group(StageGroup),
    Complete,
}

pub const COMPLETE: &str = "complete";

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Backend(stage) => stage.as_str(),
            Stage::Group(group) => group.as_str(),
            Stage::Complete => COMPLETE,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Stage::Backend(stage) => stage.display_name(),
            Stage::Group(group) => group.display_name(),
            Stage::Complete => "Complete",
        }
    }

    /// Pipeline position used to keep approval monotonic. A group ranks with
    /// its first backend stage.
    pub fn rank(self) -> usize {
        match self {
            Stage::Backend(stage) => stage.index(),
            Stage::Group(group) => group.stages()[0].index(),
            Stage::Complete => BackendStage::ALL.len(),
        }
    }

    /// `None` for `complete`
    pub fn successor(self) -> Option<Stage> {
        match self {
            Stage::Backend(stage) => Some(stage.successor()),
            Stage::Group(group) => Some(group.successor()),
            Stage::Complete => None,
        }
    }

    pub fn is_complete(self) -> bool {
        self == Stage::Complete
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BackendStage> for Stage {
    fn from(stage: BackendStage) -> Self {
        Stage::Backend(stage)
    }
}

impl From<StageGroup> for Stage {
    fn from(group: StageGroup) -> Self {
        Stage::Group(group)
    }
}

impl FromStr for Stage {
    type Err = WorkflowError;

    /// Accepts `causal_analysis` and `causal-analysis` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        if normalized == COMPLETE {
            return Ok(Stage::Complete);
        }
        if let Some(stage) = BackendStage::ALL.iter().find(|b| b.as_str() == normalized) {
            return Ok(Stage::Backend(*stage));
        }
        if let Some(group) = StageGroup::ALL.iter().find(|g| g.as_str() == normalized) {
            return Ok(Stage::Group(*group));
        }
        Err(WorkflowError::UnknownStage(s.to_string()))
    }
}
