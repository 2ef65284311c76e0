//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::WorkflowError;

/// Workflow errors carry their stable code; everything else prints its
/// context chain.
pub fn map_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<WorkflowError>() {
        Some(workflow) => format!("error[{}]: {}", workflow.code(), workflow),
        None => format!("error: {:#}", e),
    }
}
