use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::JsonMap;
use crate::domain::resources::Resources;

/// Unsolicited task event pushed by a volunteer through the coordinator.
/// Every variant carries the (workflow, task, volunteer) key triple; the
/// optional fields depend on the channel the event arrived on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventDto {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub volunteer_id: Uuid,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<JsonMap>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One volunteer entry of a coordinator roster push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolunteerDescriptorDto {
    pub id: Uuid,
    pub name: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

impl VolunteerDescriptorDto {
    pub fn capacity(&self) -> Resources {
        Resources::new(self.cpu_cores, self.ram_mb, self.disk_gb)
    }
}

/// Roster push on WORKFLOW_VOLUNTEER_ASSIGNMENT: the coordinator's pick of
/// volunteers for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterDto {
    pub workflow_id: Uuid,
    pub volunteers: Vec<VolunteerDescriptorDto>,
}

/// Correlated reply envelope body shared by all `*_response` channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyDto {
    pub request_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub info: JsonMap,
}

impl ReplyDto {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Where a volunteer serves its result files from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDescriptorDto {
    pub host: String,
    pub port: u16,
    pub paths: Vec<String>,
}

/// Outbound WORKFLOW_SUBMISSION payload; the correlator adds `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionDto {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub workflow_type: String,
    pub owner: String,
    pub priority: i32,
    #[serde(default)]
    pub estimated_resources: Option<Resources>,
    pub max_execution_time: u64,
    pub input_data_size: u64,
    pub retry_count: u32,
    pub submitted_at: i64,
}
