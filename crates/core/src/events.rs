use crate::error::ErrorKind;
use crate::types::{RunId, StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An entry in a run's event journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Run and step lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunCreated {
        workflow_id: WorkflowId,
        workflow_version: u32,
    },
    RunStarted {
        planned_steps: Vec<StepId>,
    },
    RunSucceeded {
        duration_ms: u64,
    },
    RunFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
        kind: ErrorKind,
        message: String,
        duration_ms: u64,
    },

    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepSucceeded {
        step_id: StepId,
        attempts: u32,
        duration_ms: u64,
    },
    StepAttemptFailed {
        step_id: StepId,
        attempt: u32,
        kind: ErrorKind,
        message: String,
        will_retry: bool,
    },
}

impl EventType {
    /// Last event a run emits
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::RunSucceeded { .. } | EventType::RunFailed { .. })
    }
}

/// Event journal writer
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run in emission order
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}

/// Process-local journal
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
