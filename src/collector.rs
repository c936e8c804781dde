use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::message_dto::ResultDescriptorDto;
use crate::bus::client::BusClient;
use crate::bus::protocol::Channel;
use crate::clock::Clock;
use crate::domain::task::TaskStatus;
use crate::domain::workflow::{try_transition, WorkflowStatus, WorkflowType};
use crate::error::{Error, Result};
use crate::notify::NotificationSink;
use crate::store::{AssignmentStore, TaskStore, WorkflowStore};

/// Merges a directory of per-task results into one artifact.
///
/// # Returns
/// The path of the produced artifact.
#[async_trait]
pub trait ResultAggregator: Send + Sync {
    async fn aggregate(&self, results_dir: &Path) -> Result<PathBuf>;
}

/// Concatenates every downloaded result file, in path order, into a single
/// artifact. Good enough for row-partitioned outputs.
#[derive(Debug, Clone)]
pub struct ConcatAggregator {
    pub artifact_name: String,
}

impl Default for ConcatAggregator {
    fn default() -> Self {
        Self { artifact_name: "merged.out".to_string() }
    }
}

#[async_trait]
impl ResultAggregator for ConcatAggregator {
    async fn aggregate(&self, results_dir: &Path) -> Result<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![results_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if path.file_name().map(|n| n != self.artifact_name.as_str()).unwrap_or(true) {
                    files.push(path);
                }
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(Error::Aggregation(format!("no result files under {}", results_dir.display())));
        }

        let artifact = results_dir.join(&self.artifact_name);
        let mut merged = Vec::new();
        for file in &files {
            merged.extend(tokio::fs::read(file).await?);
        }
        tokio::fs::write(&artifact, merged).await?;
        Ok(artifact)
    }
}

/// Delegates merging to an external script (model averaging and friends).
/// The script receives the results directory and prints the artifact path.
#[derive(Debug, Clone)]
pub struct ScriptAggregator {
    pub script: PathBuf,
}

#[async_trait]
impl ResultAggregator for ScriptAggregator {
    async fn aggregate(&self, results_dir: &Path) -> Result<PathBuf> {
        let output = tokio::process::Command::new(&self.script).arg(results_dir).output().await?;
        if !output.status.success() {
            return Err(Error::Aggregation(format!(
                "merge script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let artifact = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if artifact.is_empty() {
            return Err(Error::Aggregation("merge script printed no artifact path".to_string()));
        }
        Ok(PathBuf::from(artifact))
    }
}

/// On workflow convergence: pulls every completed assignment's result files
/// from the volunteers, runs the aggregation strategy for the workflow type
/// and finishes the workflow either way.
pub struct ResultCollector {
    workflows: WorkflowStore,
    tasks: TaskStore,
    assignments: AssignmentStore,
    http: reqwest::Client,
    aggregators: HashMap<WorkflowType, Arc<dyn ResultAggregator>>,
    bus: BusClient,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    work_dir: PathBuf,
}

impl ResultCollector {
    pub fn new(
        workflows: WorkflowStore,
        tasks: TaskStore,
        assignments: AssignmentStore,
        aggregators: HashMap<WorkflowType, Arc<dyn ResultAggregator>>,
        bus: BusClient,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        work_dir: PathBuf,
    ) -> Self {
        Self { workflows, tasks, assignments, http: reqwest::Client::new(), aggregators, bus, notifier, clock, work_dir }
    }

    /// Downloads result files and aggregates them. Individual download
    /// failures are logged and skipped; a failing aggregation fails the
    /// workflow. Expects the workflow to be in AGGREGATING already.
    pub async fn collect(&self, workflow_id: Uuid) -> Result<PathBuf> {
        let workflow_handle = self
            .workflows
            .get_by_id(&workflow_id)
            .ok_or_else(|| Error::lookup("workflow", workflow_id))?;
        let (workflow_type, output_path, coordinator_id) = {
            let workflow = workflow_handle.read().expect("RwLock poisoned");
            (workflow.workflow_type, workflow.output_path.clone(), workflow.coordinator_workflow_id)
        };

        let results_dir = if output_path.is_empty() {
            self.work_dir.join(workflow_id.to_string()).join("outputs")
        } else {
            PathBuf::from(output_path)
        };

        let outcome = self.download_and_aggregate(workflow_id, workflow_type, &results_dir).await;
        match outcome {
            Ok(artifact) => {
                if try_transition(&workflow_handle, WorkflowStatus::Completed).is_some() {
                    workflow_handle.write().expect("RwLock poisoned").completed_at = Some(self.clock.now_utc());
                    self.notifier.notify(
                        "workflow_status_change",
                        json!({ "workflow_id": workflow_id, "status": "COMPLETED", "message": format!("artifact at {}", artifact.display()) }),
                    );

                    let mut body = crate::api::JsonMap::new();
                    body.insert("workflow_id".to_string(), json!(workflow_id));
                    if let Some(coordinator_id) = coordinator_id {
                        body.insert("coordinator_workflow_id".to_string(), json!(coordinator_id));
                    }
                    body.insert("status".to_string(), Value::String("COMPLETED".to_string()));
                    body.insert("artifact_path".to_string(), json!(artifact.display().to_string()));
                    if let Err(e) = self.bus.publish(Channel::WorkflowFinish, body) {
                        log::error!("Could not publish workflow finish for {}: {}", workflow_id, e);
                    }
                }
                Ok(artifact)
            }
            Err(e) => {
                log::error!("Collecting results for workflow {} failed: {}", workflow_id, e);
                {
                    let mut workflow = workflow_handle.write().expect("RwLock poisoned");
                    if let Err(illegal) = workflow.fail(&e.to_string()) {
                        log::warn!("Ignoring transition for workflow {}: {}", workflow_id, illegal);
                    }
                }
                self.notifier.notify(
                    "workflow_status_change",
                    json!({ "workflow_id": workflow_id, "status": "FAILED", "message": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    async fn download_and_aggregate(&self, workflow_id: Uuid, workflow_type: WorkflowType, results_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(results_dir).await?;

        for task_handle in self.tasks.for_workflow_in_status(&workflow_id, TaskStatus::Completed) {
            let task_id = task_handle.read().expect("RwLock poisoned").id;
            let Some(assignment_handle) = self.assignments.latest_completed_for_task(&task_id) else {
                log::warn!("Task {} completed but has no completed assignment, skipping", task_id);
                continue;
            };
            let result = assignment_handle.read().expect("RwLock poisoned").result.clone();
            let Some(result) = result else {
                log::warn!("Completed assignment of task {} carries no result descriptor, skipping", task_id);
                continue;
            };

            let descriptor: ResultDescriptorDto = match serde_json::from_value(Value::Object(result)) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    log::warn!("Unusable result descriptor for task {}: {}", task_id, e);
                    continue;
                }
            };

            let task_dir = results_dir.join(task_id.to_string());
            tokio::fs::create_dir_all(&task_dir).await?;
            for path in &descriptor.paths {
                if let Err(e) = self.download_one(&descriptor, path, &task_dir).await {
                    // Partial result sets are tolerated.
                    log::warn!("Skipping result file '{}' of task {}: {}", path, task_id, e);
                }
            }
        }

        let aggregator = self
            .aggregators
            .get(&workflow_type)
            .ok_or_else(|| Error::Aggregation(format!("no aggregation strategy for {}", workflow_type.as_str())))?;
        aggregator.aggregate(results_dir).await
    }

    async fn download_one(&self, descriptor: &ResultDescriptorDto, path: &str, task_dir: &Path) -> Result<()> {
        let url = format!("http://{}:{}/{}", descriptor.host, descriptor.port, path.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!("GET {} returned {}", url, response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| Error::Connection(format!("GET {}: {}", url, e)))?;

        let file_name = path.rsplit('/').next().unwrap_or("result.out");
        tokio::fs::write(task_dir.join(file_name), &bytes).await?;
        log::info!("Fetched {} ({} bytes)", url, bytes.len());
        Ok(())
    }
}
