pub mod event_log;
pub mod memory;
pub mod redb_store;

pub use event_log::JsonlEventLog;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;

use crate::error::{EngineError, EngineResult};
use crate::types::{Run, RunId, RunStatus, ValueMap, Workflow, WorkflowId};

/// Keyed storage for workflow definitions and run records.
///
/// Every run write replaces the whole record atomically, so readers never observe a
/// partially written run.
pub trait WorkflowStore: Send + Sync {
    /// Persist a new workflow definition
    fn create_workflow(&self, workflow: &Workflow) -> EngineResult<()>;

    /// Get a workflow by ID
    fn get_workflow(&self, workflow_id: &WorkflowId) -> EngineResult<Workflow>;

    /// List all workflows, ordered by ID
    fn list_workflows(&self) -> EngineResult<Vec<Workflow>>;

    /// Persist a new run in `Created` status with no step results
    fn create_run(&self, workflow: &Workflow, inputs: ValueMap) -> EngineResult<Run>;

    /// Get a run by ID
    fn get_run(&self, run_id: &RunId) -> EngineResult<Run>;

    /// Replace a run record. Fails once the stored run is terminal.
    fn update_run(&self, run: &Run) -> EngineResult<()>;

    /// Atomically move a run from `Created` to `Running` and return it
    fn start_run(&self, run_id: &RunId) -> EngineResult<Run>;

    /// List runs, most recent first, optionally restricted to one workflow
    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> EngineResult<Vec<Run>>;
}

/// Reject writes to runs that already reached a terminal status
pub(crate) fn ensure_replaceable(stored: &Run) -> EngineResult<()> {
    if stored.status.is_terminal() {
        return Err(EngineError::InvalidRunState {
            run_id: stored.id,
            status: stored.status,
        });
    }
    Ok(())
}

/// Apply the `Created -> Running` transition in place
pub(crate) fn begin_run(run: &mut Run) -> EngineResult<()> {
    if run.status != RunStatus::Created {
        return Err(EngineError::InvalidRunState {
            run_id: run.id,
            status: run.status,
        });
    }
    let now = chrono::Utc::now();
    run.status = RunStatus::Running;
    run.started_at = Some(now);
    run.updated_at = now;
    Ok(())
}

pub(crate) fn sort_runs(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `WorkflowStore` implementation must share.

    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{Step, StepResult, StepStatus};

    fn workflow(id: &str) -> Workflow {
        Workflow::new(id, "Greeting", "greet").with_step(Step::new("greet", "echo"))
    }

    pub fn workflows_are_write_once(store: &dyn WorkflowStore) {
        store.create_workflow(&workflow("greeting")).unwrap();

        let err = store.create_workflow(&workflow("greeting")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateWorkflow);

        let fetched = store.get_workflow(&WorkflowId::new("greeting")).unwrap();
        assert_eq!(fetched, workflow("greeting"));

        store.create_workflow(&workflow("another")).unwrap();
        let ids: Vec<String> = store
            .list_workflows()
            .unwrap()
            .into_iter()
            .map(|w| w.id.0)
            .collect();
        assert_eq!(ids, vec!["another".to_string(), "greeting".to_string()]);

        let err = store.get_workflow(&WorkflowId::new("missing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    pub fn run_lifecycle(store: &dyn WorkflowStore) {
        let wf = workflow("lifecycle");
        store.create_workflow(&wf).unwrap();

        let mut inputs = ValueMap::new();
        inputs.insert("name".to_string(), serde_json::json!("Ada"));
        let run = store.create_run(&wf, inputs.clone()).unwrap();
        assert_eq!(run.status, RunStatus::Created);
        assert!(run.step_results.is_empty());
        assert_eq!(store.get_run(&run.id).unwrap(), run);

        let mut running = store.start_run(&run.id).unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(
            store.start_run(&run.id).unwrap_err().kind(),
            ErrorKind::InvalidRunState
        );

        let mut result = StepResult::pending(wf.entry.clone());
        result.status = StepStatus::Succeeded;
        result.attempts = 1;
        running.step_results.insert(wf.entry.clone(), result);
        running.status = RunStatus::Succeeded;
        store.update_run(&running).unwrap();

        let stored = store.get_run(&run.id).unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.inputs, inputs);
        assert_eq!(stored.step_results.len(), 1);

        running.status = RunStatus::Failed;
        let err = store.update_run(&running).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRunState);
        assert_eq!(store.get_run(&run.id).unwrap().status, RunStatus::Succeeded);
    }

    pub fn unknown_runs_not_found(store: &dyn WorkflowStore) {
        let wf = workflow("ghost");
        let ghost = Run::new(&wf, ValueMap::new());

        assert_eq!(store.get_run(&ghost.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.update_run(&ghost).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.start_run(&ghost.id).unwrap_err().kind(), ErrorKind::NotFound);
    }

    pub fn runs_listed_per_workflow(store: &dyn WorkflowStore) {
        let first = workflow("first");
        let second = workflow("second");
        store.create_workflow(&first).unwrap();
        store.create_workflow(&second).unwrap();

        let older = store.create_run(&first, ValueMap::new()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = store.create_run(&first, ValueMap::new()).unwrap();
        store.create_run(&second, ValueMap::new()).unwrap();

        let runs = store.list_runs(Some(&first.id)).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(runs[1].id, older.id);
        assert_eq!(store.list_runs(None).unwrap().len(), 3);
    }
}
