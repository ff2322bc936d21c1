//! Ontology workflow model and state machine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scope::TenantId;

/// Lifecycle state of an ontology workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    AwaitingInput,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::AwaitingInput => "awaiting_input",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    /// Transitions callers are expected to request.
    ///
    /// The repositories do not enforce this table; it exists for the
    /// processing code that drives the workflow.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Paused) | (Running, AwaitingInput) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Paused, Running) | (Paused, Failed) => true,
            (AwaitingInput, Running) | (AwaitingInput, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowState::Pending),
            "running" => Ok(WorkflowState::Running),
            "paused" => Ok(WorkflowState::Paused),
            "awaiting_input" => Ok(WorkflowState::AwaitingInput),
            "completed" => Ok(WorkflowState::Completed),
            "failed" => Ok(WorkflowState::Failed),
            other => Err(StoreError::InvalidInput(format!(
                "unknown workflow state: {}",
                other
            ))),
        }
    }
}

/// Processing phase of an ontology build.
///
/// Relationship candidates are produced between `RelationshipDiscovery` and
/// `RelationshipConfirmation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    SchemaDiscovery,
    RelationshipDiscovery,
    RelationshipConfirmation,
    EntityInference,
    OntologyBuild,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::SchemaDiscovery => "schema_discovery",
            WorkflowPhase::RelationshipDiscovery => "relationship_discovery",
            WorkflowPhase::RelationshipConfirmation => "relationship_confirmation",
            WorkflowPhase::EntityInference => "entity_inference",
            WorkflowPhase::OntologyBuild => "ontology_build",
        }
    }

    /// The phase after this one, `None` at the end of the build
    pub fn next(&self) -> Option<WorkflowPhase> {
        match self {
            WorkflowPhase::SchemaDiscovery => Some(WorkflowPhase::RelationshipDiscovery),
            WorkflowPhase::RelationshipDiscovery => Some(WorkflowPhase::RelationshipConfirmation),
            WorkflowPhase::RelationshipConfirmation => Some(WorkflowPhase::EntityInference),
            WorkflowPhase::EntityInference => Some(WorkflowPhase::OntologyBuild),
            WorkflowPhase::OntologyBuild => None,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema_discovery" => Ok(WorkflowPhase::SchemaDiscovery),
            "relationship_discovery" => Ok(WorkflowPhase::RelationshipDiscovery),
            "relationship_confirmation" => Ok(WorkflowPhase::RelationshipConfirmation),
            "entity_inference" => Ok(WorkflowPhase::EntityInference),
            "ontology_build" => Ok(WorkflowPhase::OntologyBuild),
            other => Err(StoreError::InvalidInput(format!(
                "unknown workflow phase: {}",
                other
            ))),
        }
    }
}

/// Structured progress, replaced wholesale on every update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkflowPhase>,
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkflowProgress {
    pub fn new(phase: WorkflowPhase, current: u32, total: u32) -> Self {
        Self {
            phase: Some(phase),
            current,
            total,
            message: None,
        }
    }

    /// Completion ratio in [0, 1]; zero when the total is unknown
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current.min(self.total) as f64) / (self.total as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One entry of the ordered task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub requires_llm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowTask {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TaskStatus::Pending,
            requires_llm: false,
            error: None,
        }
    }
}

/// A long-running ontology build job.
///
/// `owner_id` and `last_heartbeat` are written only by the lease operations
/// and are either both set or both empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub project_id: TenantId,
    pub ontology_id: Uuid,
    pub state: WorkflowState,
    pub progress: WorkflowProgress,
    pub task_queue: Vec<WorkflowTask>,
    pub config: serde_json::Value,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phase: WorkflowPhase,
    pub datasource_id: Option<Uuid>,
    pub owner_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// A fresh, unowned workflow in `pending`
    pub fn new(project_id: TenantId, ontology_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            ontology_id,
            state: WorkflowState::Pending,
            progress: WorkflowProgress::default(),
            task_queue: Vec::new(),
            config: serde_json::json!({}),
            error_message: None,
            started_at: None,
            completed_at: None,
            phase: WorkflowPhase::SchemaDiscovery,
            datasource_id: None,
            owner_id: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_datasource(mut self, datasource_id: Uuid) -> Self {
        self.datasource_id = Some(datasource_id);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn is_owned(&self) -> bool {
        self.owner_id.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A change applied to a workflow in a single write
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowChange {
    State {
        state: WorkflowState,
        error_message: Option<String>,
    },
    Progress(WorkflowProgress),
    TaskQueue(Vec<WorkflowTask>),
}

impl WorkflowChange {
    pub fn state(state: WorkflowState) -> Self {
        WorkflowChange::State {
            state,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        WorkflowChange::State {
            state: WorkflowState::Failed,
            error_message: Some(error_message.into()),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            WorkflowChange::State { .. } => "state",
            WorkflowChange::Progress(_) => "progress",
            WorkflowChange::TaskQueue(_) => "task_queue",
        }
    }
}

/// An owned workflow whose heartbeat is older than the reaper's threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLease {
    pub workflow_id: Uuid,
    pub project_id: TenantId,
    pub owner_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Pending.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
        assert!(!WorkflowState::AwaitingInput.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for next in [
            WorkflowState::Pending,
            WorkflowState::Running,
            WorkflowState::Paused,
            WorkflowState::AwaitingInput,
        ] {
            assert!(!WorkflowState::Completed.can_transition_to(next));
            assert!(!WorkflowState::Failed.can_transition_to(next));
        }
        assert!(!WorkflowState::Completed.can_transition_to(WorkflowState::Failed));
    }

    #[test]
    fn test_expected_transitions() {
        assert!(WorkflowState::Pending.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::AwaitingInput));
        assert!(WorkflowState::AwaitingInput.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Completed));
        assert!(!WorkflowState::Pending.can_transition_to(WorkflowState::Completed));
    }

    #[test]
    fn test_state_strings_match_serde() {
        let json = serde_json::to_string(&WorkflowState::AwaitingInput).unwrap();
        assert_eq!(json, "\"awaiting_input\"");
        assert_eq!(
            "awaiting_input".parse::<WorkflowState>().unwrap(),
            WorkflowState::AwaitingInput
        );
        assert!("done".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_phase_order() {
        let mut phase = WorkflowPhase::SchemaDiscovery;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(phase, WorkflowPhase::OntologyBuild);
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(WorkflowProgress::default().fraction(), 0.0);
        let progress = WorkflowProgress::new(WorkflowPhase::EntityInference, 3, 4);
        assert!((progress.fraction() - 0.75).abs() < f64::EPSILON);
        let overshoot = WorkflowProgress::new(WorkflowPhase::EntityInference, 9, 4);
        assert_eq!(overshoot.fraction(), 1.0);
    }

    #[test]
    fn test_progress_tolerates_sparse_json() {
        let progress: WorkflowProgress = serde_json::from_str("{}").unwrap();
        assert_eq!(progress, WorkflowProgress::default());
    }

    #[test]
    fn test_new_workflow_is_unowned() {
        let wf = Workflow::new(TenantId::new(Uuid::new_v4()), Uuid::new_v4());
        assert!(!wf.is_owned());
        assert!(wf.last_heartbeat.is_none());
        assert_eq!(wf.state, WorkflowState::Pending);
        assert!(wf.completed_at.is_none());
    }
}
