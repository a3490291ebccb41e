use super::{begin_run, ensure_replaceable, sort_runs, WorkflowStore};
use crate::error::{EngineError, EngineResult};
use crate::types::{Run, RunId, ValueMap, Workflow, WorkflowId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-local store backed by hash maps.
///
/// Run writes take the runs write lock for the whole replace, which is what makes them atomic.
#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
        lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
        lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkflowStore for InMemoryStore {
    fn create_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        let mut workflows = Self::write(&self.workflows);
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::DuplicateWorkflow(workflow.id.clone()));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> EngineResult<Workflow> {
        Self::read(&self.workflows)
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::workflow_not_found(workflow_id))
    }

    fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = Self::read(&self.workflows).values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    fn create_run(&self, workflow: &Workflow, inputs: ValueMap) -> EngineResult<Run> {
        let run = Run::new(workflow, inputs);
        Self::write(&self.runs).insert(run.id, run.clone());
        Ok(run)
    }

    fn get_run(&self, run_id: &RunId) -> EngineResult<Run> {
        Self::read(&self.runs)
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    fn update_run(&self, run: &Run) -> EngineResult<()> {
        let mut runs = Self::write(&self.runs);
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| EngineError::run_not_found(&run.id))?;
        ensure_replaceable(stored)?;
        *stored = run.clone();
        Ok(())
    }

    fn start_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let mut runs = Self::write(&self.runs);
        let stored = runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::run_not_found(run_id))?;
        begin_run(stored)?;
        Ok(stored.clone())
    }

    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> EngineResult<Vec<Run>> {
        let mut runs: Vec<Run> = Self::read(&self.runs)
            .values()
            .filter(|r| workflow_id.map_or(true, |id| &r.workflow_id == id))
            .cloned()
            .collect();
        sort_runs(&mut runs);
        Ok(runs)
    }
}
