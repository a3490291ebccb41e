//! Engine error taxonomy.

use crate::types::{RunId, RunStatus, StepId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Serializable discriminant of an engine error, recorded on failed steps and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateWorkflow,
    DuplicateStep,
    CyclicDependency,
    UnresolvedDependency,
    UnreachableEntry,
    InvalidInputReference,
    DuplicateHandler,
    UnknownStepType,
    HandlerExecution,
    Timeout,
    InputResolution,
    NotFound,
    InvalidRunState,
    ContextAlreadyInitialized,
    Storage,
}

impl ErrorKind {
    /// Raised while validating or compiling a workflow definition
    pub fn is_definition_error(self) -> bool {
        matches!(
            self,
            ErrorKind::DuplicateWorkflow
                | ErrorKind::DuplicateStep
                | ErrorKind::CyclicDependency
                | ErrorKind::UnresolvedDependency
                | ErrorKind::UnreachableEntry
                | ErrorKind::InvalidInputReference
        )
    }

    /// Participates in the per-step attempt budget
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::HandlerExecution | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::DuplicateWorkflow => "DuplicateWorkflowError",
            ErrorKind::DuplicateStep => "DuplicateStepError",
            ErrorKind::CyclicDependency => "CyclicDependencyError",
            ErrorKind::UnresolvedDependency => "UnresolvedDependencyError",
            ErrorKind::UnreachableEntry => "UnreachableEntryError",
            ErrorKind::InvalidInputReference => "InvalidInputReferenceError",
            ErrorKind::DuplicateHandler => "DuplicateHandlerError",
            ErrorKind::UnknownStepType => "UnknownStepTypeError",
            ErrorKind::HandlerExecution => "HandlerExecutionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::InputResolution => "InputResolutionError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::InvalidRunState => "InvalidRunStateError",
            ErrorKind::ContextAlreadyInitialized => "ContextAlreadyInitializedError",
            ErrorKind::Storage => "StorageError",
        };
        f.write_str(s)
    }
}

/// Errors produced by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow {0} already exists")]
    DuplicateWorkflow(WorkflowId),

    #[error("workflow {workflow} declares step {step} more than once")]
    DuplicateStep { workflow: WorkflowId, step: StepId },

    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<StepId> },

    #[error("step {step} depends on unknown step {dependency}")]
    UnresolvedDependency { step: StepId, dependency: StepId },

    #[error("entry step {entry} is not defined in workflow {workflow}")]
    UnreachableEntry { workflow: WorkflowId, entry: StepId },

    #[error("step {step} has invalid input reference {reference}: {reason}")]
    InvalidInputReference {
        step: StepId,
        reference: String,
        reason: String,
    },

    #[error("a handler is already registered for step type '{0}'")]
    DuplicateHandler(String),

    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),

    #[error("step {step} failed: {message}")]
    HandlerExecution {
        step: StepId,
        message: String,
        detail: Option<serde_json::Value>,
    },

    #[error("step {step} timed out after {timeout_ms}ms")]
    Timeout { step: StepId, timeout_ms: u64 },

    #[error("could not resolve inputs for step {step}: {reason}")]
    InputResolution { step: StepId, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("run {run_id} is {status}")]
    InvalidRunState { run_id: RunId, status: RunStatus },

    #[error("application context is already initialized")]
    ContextAlreadyInitialized,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DuplicateWorkflow(_) => ErrorKind::DuplicateWorkflow,
            EngineError::DuplicateStep { .. } => ErrorKind::DuplicateStep,
            EngineError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            EngineError::UnresolvedDependency { .. } => ErrorKind::UnresolvedDependency,
            EngineError::UnreachableEntry { .. } => ErrorKind::UnreachableEntry,
            EngineError::InvalidInputReference { .. } => ErrorKind::InvalidInputReference,
            EngineError::DuplicateHandler(_) => ErrorKind::DuplicateHandler,
            EngineError::UnknownStepType(_) => ErrorKind::UnknownStepType,
            EngineError::HandlerExecution { .. } => ErrorKind::HandlerExecution,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::InputResolution { .. } => ErrorKind::InputResolution,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::InvalidRunState { .. } => ErrorKind::InvalidRunState,
            EngineError::ContextAlreadyInitialized => ErrorKind::ContextAlreadyInitialized,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn workflow_not_found(id: &WorkflowId) -> Self {
        EngineError::NotFound {
            entity: "workflow",
            id: id.to_string(),
        }
    }

    pub fn run_not_found(id: &RunId) -> Self {
        EngineError::NotFound {
            entity: "run",
            id: id.to_string(),
        }
    }

    /// Step-level error detail for recording on a `StepResult`
    pub fn to_step_error(&self) -> crate::types::StepError {
        let detail = match self {
            EngineError::HandlerExecution { detail, .. } => detail.clone(),
            _ => None,
        };
        crate::types::StepError {
            kind: self.kind(),
            message: self.to_string(),
            detail,
        }
    }
}

fn format_cycle(cycle: &[StepId]) -> String {
    cycle
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = EngineError::CyclicDependency {
            cycle: vec![StepId::new("a"), StepId::new("b"), StepId::new("a")],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert!(err.kind().is_definition_error());
    }

    #[test]
    fn test_only_execution_errors_are_retryable() {
        assert!(ErrorKind::HandlerExecution.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::UnknownStepType.is_retryable());
        assert!(!ErrorKind::InputResolution.is_retryable());
    }

    #[test]
    fn test_handler_detail_carried_to_step_error() {
        let err = EngineError::HandlerExecution {
            step: StepId::new("score"),
            message: "model unavailable".to_string(),
            detail: Some(serde_json::json!({ "code": 503 })),
        };
        let step_error = err.to_step_error();
        assert_eq!(step_error.kind, ErrorKind::HandlerExecution);
        assert_eq!(step_error.message, "step score failed: model unavailable");
        assert_eq!(step_error.detail, Some(serde_json::json!({ "code": 503 })));
    }
}
