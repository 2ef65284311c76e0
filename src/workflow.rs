//! Staged case workflow: stage table, prompts, batch execution and live
//! streaming.

pub mod executor;
pub mod prompts;
pub mod sections;
pub mod stage;
pub mod streaming;

pub use executor::{
    ApprovalOutcome, CaseStatus, ErrorPolicy, ExecutorSettings, StageExecutor, StageFailure,
    StageOutcome,
};
pub use sections::extract_relevant_sections;
pub use stage::{BackendStage, Stage, StageGroup, COMPLETE};
pub use streaming::StageStream;
