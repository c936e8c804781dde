use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Assigned,
    Started,
    Completed,
    Failed,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "ASSIGNED",
            AssignmentStatus::Started => "STARTED",
            AssignmentStatus::Completed => "COMPLETED",
            AssignmentStatus::Failed => "FAILED",
            AssignmentStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<AssignmentStatus> {
        match s {
            "ASSIGNED" => Some(AssignmentStatus::Assigned),
            "STARTED" => Some(AssignmentStatus::Started),
            "COMPLETED" => Some(AssignmentStatus::Completed),
            "FAILED" => Some(AssignmentStatus::Failed),
            "EXPIRED" => Some(AssignmentStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Completed | AssignmentStatus::Failed | AssignmentStatus::Expired)
    }
}

/// The binding of one task to one volunteer. A reassignment after failure
/// creates a new record; completed and failed bindings stay as history.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub volunteer_id: Uuid,
    pub status: AssignmentStatus,
    pub progress: f32,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Result descriptor reported by the volunteer, usually
    /// `{host, port, paths}` pointing at downloadable output files.
    pub result: Option<JsonMap>,
    pub error: Option<String>,
}

impl Assignment {
    pub fn new(task_id: Uuid, volunteer_id: Uuid, assigned_at: DateTime<Utc>) -> Self {
        Assignment {
            id: Uuid::new_v4(),
            task_id,
            volunteer_id,
            status: AssignmentStatus::Assigned,
            progress: 0.0,
            assigned_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}
