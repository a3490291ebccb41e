use crate::types::{RunId, StepId, ValueMap, WorkflowId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Failure reported by a step handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Handler-specific payload kept on the failed step result
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// What a handler can see about the run it executes in
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    /// 1-based attempt number
    pub attempt: u32,
    run_inputs: Arc<ValueMap>,
    dependency_outputs: Arc<BTreeMap<StepId, ValueMap>>,
}

impl StepContext {
    pub fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        step_id: StepId,
        run_inputs: ValueMap,
        dependency_outputs: BTreeMap<StepId, ValueMap>,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            step_id,
            attempt: 1,
            run_inputs: Arc::new(run_inputs),
            dependency_outputs: Arc::new(dependency_outputs),
        }
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn run_inputs(&self) -> &ValueMap {
        &self.run_inputs
    }

    pub fn run_input(&self, key: &str) -> Option<&Value> {
        self.run_inputs.get(key)
    }

    /// Outputs of a succeeded direct dependency
    pub fn dependency_output(&self, step_id: &str) -> Option<&ValueMap> {
        self.dependency_outputs.get(step_id)
    }

    pub fn dependency_value(&self, step_id: &str, key: &str) -> Option<&Value> {
        self.dependency_output(step_id).and_then(|outputs| outputs.get(key))
    }

    /// All dependency outputs ordered by step id
    pub fn dependency_outputs(&self) -> impl Iterator<Item = (&StepId, &ValueMap)> {
        self.dependency_outputs.iter()
    }
}

/// Executable logic bound to a step type
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    /// Run one attempt of a step with its resolved inputs
    async fn execute(&self, inputs: ValueMap, ctx: StepContext) -> Result<ValueMap, HandlerError>;
}

/// Adapts a synchronous closure into a [`StepHandler`].
///
/// The closure runs on the blocking thread pool, so a closure that never returns is still
/// bounded by the executor's timeout. The abandoned thread keeps running until the closure
/// returns on its own.
pub struct FnHandler<F> {
    func: Arc<F>,
}

impl<F> FnHandler<F>
where
    F: Fn(ValueMap, &StepContext) -> Result<ValueMap, HandlerError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait::async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(ValueMap, &StepContext) -> Result<ValueMap, HandlerError> + Send + Sync + 'static,
{
    async fn execute(&self, inputs: ValueMap, ctx: StepContext) -> Result<ValueMap, HandlerError> {
        let func = self.func.clone();
        tokio::task::spawn_blocking(move || func(inputs, &ctx))
            .await
            .map_err(|e| HandlerError::new(format!("handler panicked: {}", e)))?
    }
}
