use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::task::ContainerImage;
use crate::domain::workflow::WorkflowType;
use crate::error::Result;

/// Builds or resolves the container image a volunteer runs for one task.
/// The real build-and-push pipeline lives outside the engine; the engine
/// only needs an image reference per task.
#[async_trait]
pub trait ContainerImageService: Send + Sync {
    async fn prepare_image(&self, task_id: Uuid, workflow_type: WorkflowType) -> Result<ContainerImage>;
}

/// Hands out deterministic image references without touching a container
/// runtime, mirroring the build pipeline's naming scheme. Used whenever the
/// runtime is unavailable.
#[derive(Debug, Clone)]
pub struct SimulatedImageService {
    pub registry: String,
    pub namespace: String,
}

impl Default for SimulatedImageService {
    fn default() -> Self {
        Self { registry: "docker.io".to_string(), namespace: "gridhub".to_string() }
    }
}

fn image_base_name(workflow_type: WorkflowType) -> &'static str {
    match workflow_type {
        WorkflowType::MatrixAddition => "matrix-addition",
        WorkflowType::MatrixMultiplication => "matrix-multiplication",
        WorkflowType::MlTraining => "ml-training",
        WorkflowType::Custom => "custom-task",
    }
}

#[async_trait]
impl ContainerImageService for SimulatedImageService {
    async fn prepare_image(&self, task_id: Uuid, workflow_type: WorkflowType) -> Result<ContainerImage> {
        let hex_id = task_id.simple().to_string();
        let image = ContainerImage {
            registry: self.registry.clone(),
            namespace: self.namespace.clone(),
            name: format!("{}-{}", image_base_name(workflow_type), &hex_id[..8]),
            tag: "latest".to_string(),
        };
        log::info!("Prepared image {} for task {}", image.full_name(), task_id);
        Ok(image)
    }
}
