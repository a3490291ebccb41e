use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Opaque key/value payload used for run inputs, step inputs after resolution and step outputs
pub type ValueMap = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a step, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Whether re-running a workflow is expected to reproduce identical outputs.
///
/// Descriptive only: the engine records it but never rejects a handler on its basis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterminismGrade {
    Pure,
    #[default]
    BestEffort,
}

/// Immutable workflow definition (a DAG of steps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub determinism: DeterminismGrade,
    /// Declaration order is the tie-break for compilation
    pub steps: Vec<Step>,
    pub entry: StepId,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            version: default_version(),
            determinism: DeterminismGrade::default(),
            steps: Vec::new(),
            entry: StepId::new(entry),
        }
    }

    /// Workflow consisting of a single step, used for one-off invocations of a handler
    pub fn single_step(id: impl Into<String>, step: Step) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: WorkflowId(id),
            version: default_version(),
            determinism: DeterminismGrade::default(),
            entry: step.id.clone(),
            steps: vec![step],
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_determinism(mut self, determinism: DeterminismGrade) -> Self {
        self.determinism = determinism;
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id.as_str() == step_id)
    }
}

/// A single unit of work within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    /// Tag used to resolve the handler in the registry
    pub step_type: String,
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(default)]
    pub policy: StepPolicy,
}

impl Step {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId(id),
            step_type: step_type.into(),
            depends_on: BTreeSet::new(),
            inputs: BTreeMap::new(),
            policy: StepPolicy::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.insert(StepId::new(step_id));
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_policy(mut self, policy: StepPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A step input: either a literal or a placeholder resolved when the step runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputValue {
    Literal { value: serde_json::Value },
    /// Run-level input supplied at run creation
    RunInput { key: String },
    /// Output of a declared dependency
    StepOutput { step: StepId, key: String },
    /// String with `{{input.KEY}}` / `{{steps.STEP.KEY}}` placeholders
    Template { template: String },
}

impl InputValue {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn run_input(key: impl Into<String>) -> Self {
        Self::RunInput { key: key.into() }
    }

    pub fn step_output(step: impl Into<String>, key: impl Into<String>) -> Self {
        Self::StepOutput {
            step: StepId::new(step),
            key: key.into(),
        }
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
        }
    }
}

/// Attempt and timeout policy for a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Base delay between attempts, doubled after each failure. 0 disables the delay.
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout_ms(),
            backoff_ms: 0,
        }
    }
}

impl StepPolicy {
    pub fn new(max_attempts: u32, timeout_ms: u64) -> Self {
        Self {
            max_attempts,
            timeout_ms,
            backoff_ms: 0,
        }
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Attempt budget, never below one
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the attempt following `failed_attempt`
    pub fn backoff_after(&self, failed_attempt: u32) -> std::time::Duration {
        if self.backoff_ms == 0 {
            return std::time::Duration::ZERO;
        }
        let factor = 2_u64.saturating_pow(failed_attempt.saturating_sub(1));
        std::time::Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of a step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

/// Error detail recorded on a failed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Absent when the run failed before any step was attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub error: StepError,
}

/// A specific execution of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub step_results: BTreeMap<StepId, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// New run in `Created` status with no step results
    pub fn new(workflow: &Workflow, inputs: ValueMap) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            status: RunStatus::Created,
            inputs,
            step_results: BTreeMap::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    /// Outputs of a step, only once it has succeeded
    pub fn outputs(&self, step_id: &str) -> Option<&ValueMap> {
        self.step_results
            .get(step_id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| &r.outputs)
    }
}

/// Outcome of one step within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub outputs: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            outputs: ValueMap::new(),
            error: None,
            attempts: 0,
            started_at: None,
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential() {
        let policy = StepPolicy::new(4, 1_000).with_backoff_ms(100);
        assert_eq!(policy.backoff_after(1).as_millis(), 100);
        assert_eq!(policy.backoff_after(2).as_millis(), 200);
        assert_eq!(policy.backoff_after(3).as_millis(), 400);

        let none = StepPolicy::default();
        assert!(none.backoff_after(3).is_zero());
    }

    #[test]
    fn test_attempt_budget_never_zero() {
        let policy = StepPolicy::new(0, 1_000);
        assert_eq!(policy.attempt_budget(), 1);
    }

    #[test]
    fn test_step_defaults_from_json() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "draft",
            "name": "Draft reply",
            "step_type": "template",
            "inputs": {
                "topic": { "type": "run_input", "key": "topic" },
                "tone": { "type": "literal", "value": "formal" }
            }
        }))
        .unwrap();

        assert_eq!(step.policy, StepPolicy::default());
        assert!(step.depends_on.is_empty());
        assert_eq!(step.inputs["topic"], InputValue::run_input("topic"));
        assert_eq!(step.inputs["tone"], InputValue::literal("formal"));
    }

    #[test]
    fn test_outputs_hidden_until_succeeded() {
        let workflow = Workflow::single_step("one-off", Step::new("a", "echo"));
        let mut run = Run::new(&workflow, ValueMap::new());

        let mut result = StepResult::pending(StepId::new("a"));
        result.status = StepStatus::Running;
        result
            .outputs
            .insert("partial".to_string(), serde_json::json!(true));
        run.step_results.insert(result.step_id.clone(), result);
        assert!(run.outputs("a").is_none());

        run.step_results.get_mut("a").unwrap().status = StepStatus::Succeeded;
        assert_eq!(run.outputs("a").unwrap()["partial"], serde_json::json!(true));
    }
}
