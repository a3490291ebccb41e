use super::dag::{self, ExecutionPlan};
use super::handler::{StepContext, StepHandler};
use super::inputs;
use super::registry::HandlerRegistry;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventLog, EventType};
use crate::storage::WorkflowStore;
use crate::types::{
    Run, RunFailure, RunId, RunStatus, Step, StepError, StepId, StepResult, StepStatus, ValueMap,
    Workflow, WorkflowId,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Creates runs and drives them through their compiled plan.
///
/// Steps of one run execute strictly one after another in plan order. Independent runs may
/// execute concurrently on the same executor.
pub struct RunExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<HandlerRegistry>,
    event_log: Arc<dyn EventLog>,
    // Workflows are immutable, so a cached plan never goes stale
    plans: RwLock<HashMap<WorkflowId, Arc<ExecutionPlan>>>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<HandlerRegistry>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            store,
            registry,
            event_log,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Compiled plan for a workflow, compiled on first use
    pub fn plan(&self, workflow: &Workflow) -> EngineResult<Arc<ExecutionPlan>> {
        if let Some(plan) = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&workflow.id)
        {
            return Ok(plan.clone());
        }

        let plan = Arc::new(dag::compile(workflow)?);
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        let cached = plans.entry(workflow.id.clone()).or_insert(plan).clone();
        Ok(cached)
    }

    /// Cache a plan compiled from the stored definition of its workflow
    pub(crate) fn cache_plan(&self, plan: ExecutionPlan) -> Arc<ExecutionPlan> {
        let plan = Arc::new(plan);
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan.workflow_id().clone(), plan.clone());
        plan
    }

    /// Persist a new run of a workflow in `Created` status.
    ///
    /// The workflow is compiled first, so a definition error means no run is created.
    pub async fn create_run(&self, workflow_id: &WorkflowId, inputs: ValueMap) -> EngineResult<Run> {
        let workflow = self.store.get_workflow(workflow_id)?;
        self.plan(&workflow)?;

        let run = self.store.create_run(&workflow, inputs)?;
        tracing::info!(
            "Created run {} for workflow {} v{}",
            run.id,
            workflow.id,
            workflow.version
        );

        self.emit(
            run.id,
            EventType::RunCreated {
                workflow_id: workflow.id.clone(),
                workflow_version: workflow.version,
            },
        )
        .await;

        Ok(run)
    }

    /// Execute a created run to a terminal status and return the final record.
    ///
    /// Step failures are reported through the returned run (`Failed` with `failure` set), not
    /// as an error. Errors are returned for unknown runs, runs that were already started, and
    /// storage failures.
    pub async fn execute_run(&self, run_id: RunId) -> EngineResult<Run> {
        let mut run = self.store.start_run(&run_id)?;
        let started = Instant::now();

        tracing::info!("Starting run {} of workflow {}", run.id, run.workflow_id);

        let failure = self.drive(&mut run).await?;

        let duration_ms = elapsed_ms(started);
        let now = Utc::now();
        run.completed_at = Some(now);
        run.updated_at = now;

        let event = match failure {
            None => {
                run.status = RunStatus::Succeeded;
                tracing::info!("Run {} succeeded in {}ms", run.id, duration_ms);
                EventType::RunSucceeded { duration_ms }
            }
            Some(failure) => {
                run.status = RunStatus::Failed;
                tracing::error!(
                    "Run {} failed at step {}: {}",
                    run.id,
                    failure
                        .step_id
                        .as_ref()
                        .map_or("<none>", |s| s.as_str()),
                    failure.error.message
                );
                let event = EventType::RunFailed {
                    step_id: failure.step_id.clone(),
                    kind: failure.error.kind,
                    message: failure.error.message.clone(),
                    duration_ms,
                };
                run.failure = Some(failure);
                event
            }
        };

        // Terminal status and the failing step's error are written in one update
        self.store.update_run(&run)?;
        self.emit(run.id, event).await;

        Ok(run)
    }

    /// Create a run and execute it immediately
    pub async fn run_workflow(&self, workflow_id: &WorkflowId, inputs: ValueMap) -> EngineResult<Run> {
        let run = self.create_run(workflow_id, inputs).await?;
        self.execute_run(run.id).await
    }

    /// Walk the plan. `Ok(None)` means every step succeeded.
    async fn drive(&self, run: &mut Run) -> EngineResult<Option<RunFailure>> {
        let workflow = match self.store.get_workflow(&run.workflow_id) {
            Ok(workflow) => workflow,
            Err(e @ EngineError::NotFound { .. }) => return Ok(Some(run_failure(None, &e))),
            Err(e) => return Err(e),
        };
        let plan = match self.plan(&workflow) {
            Ok(plan) => plan,
            Err(e) => return Ok(Some(run_failure(None, &e))),
        };

        for step_id in plan.order() {
            step_result_mut(run, step_id);
        }
        run.updated_at = Utc::now();
        self.store.update_run(run)?;
        self.emit(
            run.id,
            EventType::RunStarted {
                planned_steps: plan.order().to_vec(),
            },
        )
        .await;

        // Resolve every handler up front so a missing one fails the run before any step runs
        let mut steps: Vec<(&Step, Arc<dyn StepHandler>)> = Vec::with_capacity(plan.len());
        for step_id in plan.order() {
            let Some(step) = workflow.step(step_id.as_str()) else {
                let e = EngineError::NotFound {
                    entity: "step",
                    id: step_id.to_string(),
                };
                return Ok(Some(run_failure(Some(step_id.clone()), &e)));
            };

            match self.registry.resolve(&step.step_type) {
                Ok(handler) => steps.push((step, handler)),
                Err(e) => {
                    tracing::error!("Step {} cannot run: {}", step.id, e);
                    let error = fail_step(run, &step.id, &e);
                    return Ok(Some(RunFailure {
                        step_id: Some(step.id.clone()),
                        error,
                    }));
                }
            }
        }

        for (step, handler) in steps {
            if let Some(error) = self.run_step(run, step, handler).await? {
                return Ok(Some(RunFailure {
                    step_id: Some(step.id.clone()),
                    error,
                }));
            }
        }

        Ok(None)
    }

    /// Run one step to a terminal status, retrying within its attempt budget.
    /// Returns the error detail when the step failed.
    async fn run_step(
        &self,
        run: &mut Run,
        step: &Step,
        handler: Arc<dyn StepHandler>,
    ) -> EngineResult<Option<StepError>> {
        // Only succeeded dependencies are visible to the step
        let dependency_outputs: BTreeMap<StepId, ValueMap> = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                run.outputs(dep.as_str())
                    .map(|outputs| (dep.clone(), outputs.clone()))
            })
            .collect();

        let result = step_result_mut(run, &step.id);
        result.status = StepStatus::Running;
        result.started_at = Some(Utc::now());

        let inputs = match inputs::resolve_inputs(step, &run.inputs, &dependency_outputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::error!("Step {} of run {}: {}", step.id, run.id, e);
                return Ok(Some(fail_step(run, &step.id, &e)));
            }
        };

        let ctx = StepContext::new(
            run.id,
            run.workflow_id.clone(),
            step.id.clone(),
            run.inputs.clone(),
            dependency_outputs,
        );
        let budget = step.policy.attempt_budget();
        let mut attempt = 0;

        loop {
            attempt += 1;
            step_result_mut(run, &step.id).attempts = attempt;
            run.updated_at = Utc::now();
            self.store.update_run(run)?;

            tracing::info!(
                "Executing step {} (attempt {}/{}) for run {}",
                step.id,
                attempt,
                budget,
                run.id
            );
            self.emit(
                run.id,
                EventType::StepStarted {
                    step_id: step.id.clone(),
                    attempt,
                },
            )
            .await;

            let started = Instant::now();
            match run_attempt(handler.as_ref(), step, inputs.clone(), ctx.for_attempt(attempt)).await
            {
                Ok(outputs) => {
                    let duration_ms = elapsed_ms(started);
                    let now = Utc::now();
                    let result = step_result_mut(run, &step.id);
                    result.status = StepStatus::Succeeded;
                    result.outputs = outputs;
                    result.ended_at = Some(now);
                    run.updated_at = now;
                    self.store.update_run(run)?;

                    self.emit(
                        run.id,
                        EventType::StepSucceeded {
                            step_id: step.id.clone(),
                            attempts: attempt,
                            duration_ms,
                        },
                    )
                    .await;
                    return Ok(None);
                }
                Err(e) => {
                    let will_retry = should_retry(&e, attempt, budget);
                    tracing::warn!(
                        "Step {} attempt {}/{} failed: {}",
                        step.id,
                        attempt,
                        budget,
                        e
                    );

                    self.emit(
                        run.id,
                        EventType::StepAttemptFailed {
                            step_id: step.id.clone(),
                            attempt,
                            kind: e.kind(),
                            message: e.to_string(),
                            will_retry,
                        },
                    )
                    .await;

                    if !will_retry {
                        return Ok(Some(fail_step(run, &step.id, &e)));
                    }

                    let delay = step.policy.backoff_after(attempt);
                    if !delay.is_zero() {
                        tracing::info!(
                            "Retrying step {} after {:?} (attempt {})",
                            step.id,
                            delay,
                            attempt + 1
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to record event for run {}: {:#}", run_id, e);
        }
    }
}

/// One handler invocation bounded by the step's timeout
async fn run_attempt(
    handler: &dyn StepHandler,
    step: &Step,
    inputs: ValueMap,
    ctx: StepContext,
) -> EngineResult<ValueMap> {
    let timeout = Duration::from_millis(step.policy.timeout_ms);
    match tokio::time::timeout(timeout, handler.execute(inputs, ctx)).await {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(e)) => Err(EngineError::HandlerExecution {
            step: step.id.clone(),
            message: e.message,
            detail: e.detail,
        }),
        Err(_) => Err(EngineError::Timeout {
            step: step.id.clone(),
            timeout_ms: step.policy.timeout_ms,
        }),
    }
}

/// Another attempt is made only for transient failures with budget left
fn should_retry(error: &EngineError, attempt: u32, budget: u32) -> bool {
    error.kind().is_retryable() && attempt < budget
}

fn step_result_mut<'a>(run: &'a mut Run, step_id: &StepId) -> &'a mut StepResult {
    run.step_results
        .entry(step_id.clone())
        .or_insert_with(|| StepResult::pending(step_id.clone()))
}

/// Mark a step failed. The caller persists it together with the run's terminal status.
fn fail_step(run: &mut Run, step_id: &StepId, error: &EngineError) -> StepError {
    let detail = error.to_step_error();
    let now = Utc::now();
    let result = step_result_mut(run, step_id);
    result.status = StepStatus::Failed;
    result.error = Some(detail.clone());
    result.ended_at = Some(now);
    run.updated_at = now;
    detail
}

fn run_failure(step_id: Option<StepId>, error: &EngineError) -> RunFailure {
    RunFailure {
        step_id,
        error: error.to_step_error(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
