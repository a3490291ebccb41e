// Process-wide engine context

use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventLog, MemoryEventLog};
use crate::storage::{InMemoryStore, WorkflowStore};
use crate::types::{Run, RunId, ValueMap, Workflow, WorkflowId};
use crate::workflow::{
    dag, ExecutionPlan, HandlerError, HandlerRegistry, RunExecutor, StepContext, StepHandler,
};
use std::sync::{Arc, OnceLock};

static CONTEXT: OnceLock<AppContext> = OnceLock::new();

/// Store, registry, journal and executor wired together.
///
/// Handlers are expected to be registered at startup, before the first run executes.
#[derive(Clone)]
pub struct AppContext {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<HandlerRegistry>,
    event_log: Arc<dyn EventLog>,
    executor: Arc<RunExecutor>,
}

impl AppContext {
    pub fn new(store: Arc<dyn WorkflowStore>, event_log: Arc<dyn EventLog>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            registry.clone(),
            event_log.clone(),
        ));
        Self {
            store,
            registry,
            event_log,
            executor,
        }
    }

    /// Context backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryEventLog::new()),
        )
    }

    /// The process-wide context, built in memory on first use
    pub fn global() -> &'static AppContext {
        CONTEXT.get_or_init(|| {
            tracing::info!("Initializing in-memory application context");
            AppContext::in_memory()
        })
    }

    /// Install a configured context as the process-wide one.
    /// Fails once any context exists.
    pub fn install(ctx: AppContext) -> EngineResult<&'static AppContext> {
        CONTEXT
            .set(ctx)
            .map_err(|_| EngineError::ContextAlreadyInitialized)?;
        CONTEXT.get().ok_or(EngineError::ContextAlreadyInitialized)
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<RunExecutor> {
        &self.executor
    }

    pub fn register_step_handler(
        &self,
        step_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> EngineResult<()> {
        self.registry.register(step_type, handler)
    }

    pub fn register_fn<F>(&self, step_type: impl Into<String>, func: F) -> EngineResult<()>
    where
        F: Fn(ValueMap, &StepContext) -> Result<ValueMap, HandlerError> + Send + Sync + 'static,
    {
        self.registry.register_fn(step_type, func)
    }

    /// Validate and persist a workflow. Invalid definitions are never stored.
    pub fn create_workflow(&self, workflow: &Workflow) -> EngineResult<Arc<ExecutionPlan>> {
        let plan = dag::compile(workflow)?;
        self.store.create_workflow(workflow)?;
        tracing::info!(
            "Created workflow {} v{} with {} steps",
            workflow.id,
            workflow.version,
            plan.len()
        );
        Ok(self.executor.cache_plan(plan))
    }

    pub fn get_workflow(&self, workflow_id: &WorkflowId) -> EngineResult<Workflow> {
        self.store.get_workflow(workflow_id)
    }

    pub fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        self.store.list_workflows()
    }

    /// Compiled plan of a stored workflow
    pub fn plan(&self, workflow_id: &WorkflowId) -> EngineResult<Arc<ExecutionPlan>> {
        let workflow = self.store.get_workflow(workflow_id)?;
        self.executor.plan(&workflow)
    }

    pub async fn create_run(&self, workflow_id: &WorkflowId, inputs: ValueMap) -> EngineResult<Run> {
        self.executor.create_run(workflow_id, inputs).await
    }

    pub async fn execute_run(&self, run_id: RunId) -> EngineResult<Run> {
        self.executor.execute_run(run_id).await
    }

    pub async fn run_workflow(&self, workflow_id: &WorkflowId, inputs: ValueMap) -> EngineResult<Run> {
        self.executor.run_workflow(workflow_id, inputs).await
    }

    pub fn get_run(&self, run_id: &RunId) -> EngineResult<Run> {
        self.store.get_run(run_id)
    }

    pub fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> EngineResult<Vec<Run>> {
        self.store.list_runs(workflow_id)
    }

    /// Journal of a run, oldest first
    pub async fn run_events(&self, run_id: RunId) -> EngineResult<Vec<Event>> {
        self.store.get_run(&run_id)?;
        Ok(self.event_log.get_run_events(run_id).await?)
    }
}

/// The process-wide context
pub fn get_context() -> &'static AppContext {
    AppContext::global()
}

/// Register a handler on the process-wide context
pub fn register_step_handler(
    step_type: impl Into<String>,
    handler: Arc<dyn StepHandler>,
) -> EngineResult<()> {
    get_context().register_step_handler(step_type, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{InputValue, RunStatus, Step};
    use crate::workflow::builtin::EchoHandler;
    use serde_json::json;

    #[test]
    fn test_global_context_is_shared() {
        let first = get_context();
        let second = AppContext::global();
        assert!(std::ptr::eq(first, second));

        register_step_handler("context-test-echo", Arc::new(EchoHandler)).unwrap();
        assert!(second.registry().contains("context-test-echo"));

        let err = register_step_handler("context-test-echo", Arc::new(EchoHandler)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateHandler);
    }

    #[test]
    fn test_install_after_first_use_fails() {
        get_context();
        let Err(err) = AppContext::install(AppContext::in_memory()) else {
            panic!("a second context was installed");
        };
        assert_eq!(err.kind(), ErrorKind::ContextAlreadyInitialized);
    }

    #[test]
    fn test_invalid_workflow_not_persisted() {
        let ctx = AppContext::in_memory();
        let wf = Workflow::new("loop", "Loop", "a")
            .with_step(Step::new("a", "echo").depends_on("b"))
            .with_step(Step::new("b", "echo").depends_on("a"));

        let err = ctx.create_workflow(&wf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert_eq!(ctx.get_workflow(&wf.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(ctx.list_workflows().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_workflow_rejected() {
        let ctx = AppContext::in_memory();
        let wf = Workflow::single_step("once", Step::new("a", "echo"));
        ctx.create_workflow(&wf).unwrap();

        let err = ctx.create_workflow(&wf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateWorkflow);
        assert_eq!(ctx.plan(&wf.id).unwrap().order().len(), 1);
    }

    #[tokio::test]
    async fn test_single_step_run_through_context() {
        let ctx = AppContext::in_memory();
        ctx.register_fn("shout", |inputs, _ctx| {
            let text = inputs
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HandlerError::new("text is required"))?;
            let mut out = ValueMap::new();
            out.insert("text".to_string(), json!(text.to_uppercase()));
            Ok(out)
        })
        .unwrap();

        let wf = Workflow::single_step(
            "reply-ada",
            Step::new("reply", "shout").input("text", InputValue::run_input("line")),
        );
        ctx.create_workflow(&wf).unwrap();

        let mut inputs = ValueMap::new();
        inputs.insert("line".to_string(), json!("hello"));
        let run = ctx.run_workflow(&wf.id, inputs).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.outputs("reply").unwrap()["text"], json!("HELLO"));
        assert_eq!(ctx.get_run(&run.id).unwrap(), run);
        assert_eq!(ctx.list_runs(Some(&wf.id)).unwrap().len(), 1);

        let events = ctx.run_events(run.id).await.unwrap();
        assert!(events.last().unwrap().event_type.is_terminal());
        assert_eq!(
            ctx.run_events(RunId::new()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
