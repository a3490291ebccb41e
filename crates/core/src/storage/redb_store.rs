use super::{begin_run, ensure_replaceable, sort_runs, WorkflowStore};
use crate::error::{EngineError, EngineResult};
use crate::types::{Run, RunId, ValueMap, Workflow, WorkflowId};
use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Workflow store persisted in an embedded redb database.
///
/// Records are stored as JSON. Each run write happens in its own write transaction, so a
/// replacement is either fully visible or not at all.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> EngineResult<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _workflows_table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_run(&self, run_id: &RunId) -> EngineResult<Option<Run>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run: Run =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write of one run inside a single write transaction
    fn modify_run<F>(&self, run_id: &RunId, modify: F) -> EngineResult<Run>
    where
        F: FnOnce(&mut Run) -> EngineResult<()>,
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let run = {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run_id.to_string();
            let mut run: Run = {
                let guard = table
                    .get(key.as_str())
                    .context("Failed to get run")?
                    .ok_or_else(|| EngineError::run_not_found(run_id))?;
                let stored: Run =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                stored
            };

            modify(&mut run)?;

            let value = serde_json::to_vec(&run).context("Failed to serialize run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
            run
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(run)
    }
}

impl WorkflowStore for RedbStore {
    fn create_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open table")?;

            let key = workflow.id.as_str();
            let exists = table.get(key).context("Failed to get workflow")?.is_some();
            if exists {
                return Err(EngineError::DuplicateWorkflow(workflow.id.clone()));
            }

            let value = serde_json::to_vec(workflow).context("Failed to serialize workflow")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert workflow")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> EngineResult<Workflow> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        let guard = table
            .get(workflow_id.as_str())
            .context("Failed to get workflow")?
            .ok_or_else(|| EngineError::workflow_not_found(workflow_id))?;
        let workflow: Workflow =
            serde_json::from_slice(guard.value()).context("Failed to deserialize workflow")?;
        Ok(workflow)
    }

    fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        // Keys iterate in order, so the result is already sorted by ID
        let mut workflows = Vec::new();
        for item in table.iter().context("Failed to iterate workflows")? {
            let (_key, value) = item.context("Failed to read item")?;
            let workflow: Workflow = serde_json::from_slice(value.value())
                .context("Failed to deserialize workflow")?;
            workflows.push(workflow);
        }

        Ok(workflows)
    }

    fn create_run(&self, workflow: &Workflow, inputs: ValueMap) -> EngineResult<Run> {
        let run = Run::new(workflow, inputs);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(&run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;

        Ok(run)
    }

    fn get_run(&self, run_id: &RunId) -> EngineResult<Run> {
        self.read_run(run_id)?
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    fn update_run(&self, run: &Run) -> EngineResult<()> {
        self.modify_run(&run.id, |stored| {
            ensure_replaceable(stored)?;
            *stored = run.clone();
            Ok(())
        })?;
        Ok(())
    }

    fn start_run(&self, run_id: &RunId) -> EngineResult<Run> {
        self.modify_run(run_id, begin_run)
    }

    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> EngineResult<Vec<Run>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: Run =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            if workflow_id.map_or(true, |id| &run.workflow_id == id) {
                runs.push(run);
            }
        }

        sort_runs(&mut runs);
        Ok(runs)
    }
}
