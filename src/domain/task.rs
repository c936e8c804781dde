use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Created,
    Assigned,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "CREATED" => Some(TaskStatus::Created),
            "ASSIGNED" => Some(TaskStatus::Assigned),
            "RUNNING" => Some(TaskStatus::Running),
            "PAUSED" => Some(TaskStatus::Paused),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// One entry of a task's input manifest. `url` is where a volunteer fetches
/// the shard from; `container_path` is where the payload expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFile {
    pub container_path: String,
    pub host_path: String,
    pub url: String,
}

/// Container image reference a volunteer pulls to run the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerImage {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ContainerImage {
    pub fn full_name(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.namespace, self.name, self.tag)
    }
}

/// One resource-bounded unit of executable work derived from a workflow
/// shard. Created once by the splitter; identity is immutable afterwards.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub command: String,
    pub required_resources: Resources,
    pub input_files: Vec<InputFile>,
    pub output_files: Vec<String>,
    pub input_size_mb: u64,
    pub image: ContainerImage,
    pub progress: f32,
    pub estimated_max_time_secs: u64,
    pub created_at: DateTime<Utc>,
}
