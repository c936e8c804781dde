use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::JsonMap;
use crate::domain::resources::Resources;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowType {
    MatrixAddition,
    MatrixMultiplication,
    MlTraining,
    Custom,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::MatrixAddition => "MATRIX_ADDITION",
            WorkflowType::MatrixMultiplication => "MATRIX_MULTIPLICATION",
            WorkflowType::MlTraining => "ML_TRAINING",
            WorkflowType::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<WorkflowType> {
        match s {
            "MATRIX_ADDITION" => Some(WorkflowType::MatrixAddition),
            "MATRIX_MULTIPLICATION" => Some(WorkflowType::MatrixMultiplication),
            "ML_TRAINING" => Some(WorkflowType::MlTraining),
            "CUSTOM" => Some(WorkflowType::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    Created,
    Validated,
    Submitted,
    Splitting,
    Assigning,
    Pending,
    Running,
    PartialFailure,
    Reassigning,
    Aggregating,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::Validated => "VALIDATED",
            WorkflowStatus::Submitted => "SUBMITTED",
            WorkflowStatus::Splitting => "SPLITTING",
            WorkflowStatus::Assigning => "ASSIGNING",
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::PartialFailure => "PARTIAL_FAILURE",
            WorkflowStatus::Reassigning => "REASSIGNING",
            WorkflowStatus::Aggregating => "AGGREGATING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    /// The forward edges of the lifecycle graph. `Failed` is reachable from
    /// every non-terminal state and is handled in `can_transition`.
    fn forward_targets(&self) -> &'static [WorkflowStatus] {
        match self {
            WorkflowStatus::Created => &[WorkflowStatus::Validated],
            WorkflowStatus::Validated => &[WorkflowStatus::Submitted],
            WorkflowStatus::Submitted => &[WorkflowStatus::Splitting],
            WorkflowStatus::Splitting => &[WorkflowStatus::Assigning],
            WorkflowStatus::Assigning => &[WorkflowStatus::Pending],
            WorkflowStatus::Pending => &[WorkflowStatus::Running],
            WorkflowStatus::Running => &[WorkflowStatus::Completed, WorkflowStatus::PartialFailure, WorkflowStatus::Aggregating],
            WorkflowStatus::PartialFailure => &[WorkflowStatus::Reassigning],
            WorkflowStatus::Reassigning => &[WorkflowStatus::Running],
            WorkflowStatus::Aggregating => &[WorkflowStatus::Completed],
            WorkflowStatus::Completed => &[],
            WorkflowStatus::Failed => &[],
        }
    }

    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        if target == WorkflowStatus::Failed {
            return !self.is_terminal();
        }
        self.forward_targets().contains(&target)
    }
}

/// A unit of distributed work submitted by a user, decomposed into tasks by
/// the splitter. The status field moves only along the lifecycle graph and
/// only through [`Workflow::transition`].
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub owner: String,
    pub priority: i32,
    pub estimated_resources: Option<Resources>,
    pub max_execution_time_secs: u64,
    /// Remaining reassignment budget for partially failed runs.
    pub retry_count: u32,
    pub input_path: String,
    pub input_data_size_mb: u64,
    pub output_path: String,
    /// Correlation key handed back by the coordinator on submission ack.
    pub coordinator_workflow_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last human-readable failure message; populated on the way to FAILED.
    pub last_error: Option<String>,
}

impl Workflow {
    pub fn new(name: &str, workflow_type: WorkflowType, owner: &str, created_at: DateTime<Utc>) -> Self {
        Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            workflow_type,
            status: WorkflowStatus::Created,
            owner: owner.to_string(),
            priority: 1,
            estimated_resources: None,
            max_execution_time_secs: 3600,
            retry_count: 3,
            input_path: String::new(),
            input_data_size_mb: 0,
            output_path: String::new(),
            coordinator_workflow_id: None,
            tags: Vec::new(),
            metadata: JsonMap::new(),
            created_at,
            submitted_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Moves the workflow along the lifecycle graph.
    ///
    /// # Returns
    /// Returns the new status, or `Error::IllegalTransition` if there is no
    /// edge from the current status to `target`. Callers that may see
    /// duplicate or out-of-order events treat the error as a warn-and-skip,
    /// never as a crash.
    pub fn transition(&mut self, target: WorkflowStatus) -> Result<WorkflowStatus> {
        if !self.status.can_transition(target) {
            return Err(Error::IllegalTransition { from: self.status, to: target });
        }
        log::debug!("Workflow {} transition {} -> {}", self.id, self.status.as_str(), target.as_str());
        self.status = target;
        Ok(target)
    }

    /// Terminal failure with a user-visible reason.
    pub fn fail(&mut self, reason: &str) -> Result<WorkflowStatus> {
        self.last_error = Some(reason.to_string());
        self.transition(WorkflowStatus::Failed)
    }
}

/// Transition helper for shared workflow handles: takes the per-entity lock,
/// applies the transition and downgrades an illegal edge to a warning.
///
/// # Returns
/// Returns `Some(new_status)` when the edge was legal, `None` when the event
/// was a duplicate or arrived out of order.
pub fn try_transition(handle: &Arc<RwLock<Workflow>>, target: WorkflowStatus) -> Option<WorkflowStatus> {
    let mut workflow = handle.write().expect("RwLock poisoned");
    match workflow.transition(target) {
        Ok(status) => Some(status),
        Err(e) => {
            log::warn!("Ignoring transition for workflow {}: {}", workflow.id, e);
            None
        }
    }
}
