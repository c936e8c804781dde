use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::resources::Resources;
use crate::domain::task::{InputFile, Task, TaskStatus};
use crate::domain::workflow::{try_transition, Workflow, WorkflowStatus, WorkflowType};
use crate::error::{Error, Result};
use crate::image::ContainerImageService;
use crate::notify::NotificationSink;
use crate::store::{TaskStore, VolunteerStore, WorkflowStore};

/// Physically partitions a dataset into contiguous, non-overlapping shard
/// files. Implementations decide what one "sample" is; the splitter only
/// needs the count and the shard files.
#[async_trait]
pub trait DatasetSplitter: Send + Sync {
    /// Number of samples in the dataset, the unit the shard math runs on.
    async fn sample_count(&self, dataset: &Path) -> Result<u64>;

    /// Writes `shard_count` contiguous partitions of `dataset` under
    /// `out_dir/shard_<i>/` and returns one file path per shard, in shard
    /// order. The last shard absorbs the remainder.
    async fn split(&self, dataset: &Path, shard_count: u64, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Splits a CSV dataset by rows. Each shard keeps the header line, rows stay
/// in input order and ranges never overlap.
#[derive(Debug, Clone, Default)]
pub struct CsvRowSplitter;

impl CsvRowSplitter {
    fn read_records(dataset: &Path) -> Result<(csv::StringRecord, Vec<csv::StringRecord>)> {
        let mut reader = csv::Reader::from_path(dataset).map_err(|e| Error::Split(format!("cannot open {}: {}", dataset.display(), e)))?;
        let header = reader.headers().map_err(|e| Error::Split(e.to_string()))?.clone();
        let mut records = Vec::new();
        for record in reader.records() {
            records.push(record.map_err(|e| Error::Split(e.to_string()))?);
        }
        Ok((header, records))
    }
}

#[async_trait]
impl DatasetSplitter for CsvRowSplitter {
    async fn sample_count(&self, dataset: &Path) -> Result<u64> {
        let (_, records) = Self::read_records(dataset)?;
        Ok(records.len() as u64)
    }

    async fn split(&self, dataset: &Path, shard_count: u64, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let (header, records) = Self::read_records(dataset)?;
        let total = records.len() as u64;
        let base = total / shard_count;

        let mut shard_paths = Vec::with_capacity(shard_count as usize);
        let mut cursor = 0u64;
        for shard in 0..shard_count {
            // Last shard takes whatever is left.
            let take = if shard == shard_count - 1 { total - cursor } else { base };

            let shard_dir = out_dir.join(format!("shard_{}", shard));
            tokio::fs::create_dir_all(&shard_dir).await?;
            let shard_path = shard_dir.join("data.csv");

            let mut writer = csv::Writer::from_path(&shard_path).map_err(|e| Error::Split(e.to_string()))?;
            writer.write_record(&header).map_err(|e| Error::Split(e.to_string()))?;
            for record in records.iter().skip(cursor as usize).take(take as usize) {
                writer.write_record(record).map_err(|e| Error::Split(e.to_string()))?;
            }
            writer.flush().map_err(|e| Error::Split(e.to_string()))?;

            cursor += take;
            shard_paths.push(shard_path);
        }
        Ok(shard_paths)
    }
}

/// Delegates the physical split to an external script, the way payload
/// authors ship their own partitioning logic.
///
/// Contract: `script count <dataset>` prints the sample count;
/// `script split <dataset> <shard_count> <out_dir>` prints one shard file
/// path per line.
#[derive(Debug, Clone)]
pub struct ScriptSplitter {
    pub script: PathBuf,
}

impl ScriptSplitter {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.script).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Split(format!(
                "split script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl DatasetSplitter for ScriptSplitter {
    async fn sample_count(&self, dataset: &Path) -> Result<u64> {
        let stdout = self.run(&["count", &dataset.to_string_lossy()]).await?;
        stdout.trim().parse::<u64>().map_err(|e| Error::Split(format!("bad sample count '{}': {}", stdout.trim(), e)))
    }

    async fn split(&self, dataset: &Path, shard_count: u64, out_dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir).await?;
        let stdout = self
            .run(&["split", &dataset.to_string_lossy(), &shard_count.to_string(), &out_dir.to_string_lossy()])
            .await?;
        let paths: Vec<PathBuf> = stdout.lines().filter(|line| !line.trim().is_empty()).map(PathBuf::from).collect();
        if paths.is_empty() {
            return Err(Error::Split("split script produced no shards".to_string()));
        }
        Ok(paths)
    }
}

#[derive(Debug, Clone)]
pub struct SplitterSettings {
    pub work_dir: PathBuf,
    /// Host volunteers fetch shard files from.
    pub manager_host: String,
    pub file_port: u16,
    pub est_sample_size_mb: f64,
}

impl Default for SplitterSettings {
    fn default() -> Self {
        Self { work_dir: PathBuf::from("data"), manager_host: "127.0.0.1".to_string(), file_port: 1010, est_sample_size_mb: 0.5 }
    }
}

/// Partitions a workflow's dataset into resource-bounded shards and
/// materializes one task per shard, sized to the weakest known volunteer.
pub struct WorkflowSplitter {
    workflows: WorkflowStore,
    tasks: TaskStore,
    volunteers: VolunteerStore,
    dataset: Arc<dyn DatasetSplitter>,
    images: Arc<dyn ContainerImageService>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: SplitterSettings,
}

impl WorkflowSplitter {
    pub fn new(
        workflows: WorkflowStore,
        tasks: TaskStore,
        volunteers: VolunteerStore,
        dataset: Arc<dyn DatasetSplitter>,
        images: Arc<dyn ContainerImageService>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: SplitterSettings,
    ) -> Self {
        Self { workflows, tasks, volunteers, dataset, images, notifier, clock, settings }
    }

    /// The minimum capacity across all known volunteers; every task must fit
    /// on the weakest node. Falls back to a fixed floor on an empty pool.
    pub fn min_volunteer_resources(&self) -> Resources {
        self.volunteers.min_capacity().unwrap_or_else(Resources::pool_default)
    }

    /// Shards are sized so one shard's samples fit the weakest volunteer's
    /// RAM at the estimated per-sample footprint.
    pub fn estimate_shard_count(&self, dataset_len: u64, min_ram_mb: u64) -> u64 {
        let samples_per_shard = ((min_ram_mb as f64 / self.settings.est_sample_size_mb).floor() as u64).max(1);
        dataset_len.div_ceil(samples_per_shard).max(1)
    }

    /// Splits the workflow's dataset and creates one task per shard.
    ///
    /// Ends with the workflow in ASSIGNING, or in FAILED when the split
    /// produced no tasks or the dataset could not be partitioned at all.
    /// A single oversized shard is skipped with a log line, never aborting
    /// the remaining shards.
    pub async fn split(&self, workflow_id: Uuid) -> Result<Vec<Uuid>> {
        let handle = self
            .workflows
            .get_by_id(&workflow_id)
            .ok_or_else(|| Error::lookup("workflow", workflow_id))?;

        match self.split_inner(&handle, workflow_id).await {
            Ok(task_ids) => Ok(task_ids),
            Err(e) => {
                let mut workflow = handle.write().expect("RwLock poisoned");
                log::error!("Splitting workflow {} failed: {}", workflow_id, e);
                if let Err(illegal) = workflow.fail(&e.to_string()) {
                    log::warn!("Ignoring transition for workflow {}: {}", workflow_id, illegal);
                }
                drop(workflow);
                self.notify_workflow(workflow_id, WorkflowStatus::Failed, &e.to_string());
                Err(e)
            }
        }
    }

    async fn split_inner(&self, handle: &Arc<RwLock<Workflow>>, workflow_id: Uuid) -> Result<Vec<Uuid>> {
        let (workflow_type, input_path, workflow_name) = {
            let workflow = handle.read().expect("RwLock poisoned");
            (workflow.workflow_type, workflow.input_path.clone(), workflow.name.clone())
        };
        if input_path.is_empty() {
            return Err(Error::Split("workflow has no input dataset".to_string()));
        }

        // Step 1: the common denominator every task must fit.
        let min_resources = self.min_volunteer_resources();

        // Step 2: shard count from dataset length and weakest RAM.
        let dataset = Path::new(&input_path);
        let dataset_len = self.dataset.sample_count(dataset).await?;
        let shard_count = self.estimate_shard_count(dataset_len, min_resources.ram_mb);
        log::info!(
            "Splitting workflow '{}' ({} samples) into {} shard(s) bounded by {:?}",
            workflow_name,
            dataset_len,
            shard_count,
            min_resources
        );

        // Step 3: physical partitioning.
        let inputs_dir = self.settings.work_dir.join(workflow_id.to_string()).join("inputs");
        let shard_paths = self.dataset.split(dataset, shard_count, &inputs_dir).await?;

        // Steps 4-5: one task per shard; oversized shards are skipped.
        let mut task_ids = Vec::new();
        for (index, shard_path) in shard_paths.iter().enumerate() {
            let shard_bytes = tokio::fs::metadata(shard_path).await?.len();
            let shard_mb = shard_bytes / (1024 * 1024);
            if shard_mb > min_resources.disk_gb * 1024 {
                log::warn!("Shard {} of workflow {} is {}MB and exceeds the minimum disk of {}GB, skipping", index, workflow_id, shard_mb, min_resources.disk_gb);
                continue;
            }

            let task_id = Uuid::new_v4();
            let image = self.images.prepare_image(task_id, workflow_type).await?;
            let file_name = shard_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "data".to_string());

            let task = Task {
                id: task_id,
                workflow_id,
                name: format!("{} shard {}", workflow_name, index),
                description: format!("Processes shard {} of workflow '{}'", index, workflow_name),
                status: TaskStatus::Created,
                command: task_command(workflow_type).to_string(),
                required_resources: min_resources,
                input_files: vec![InputFile {
                    container_path: format!("inputs/shard_{}/{}", index, file_name),
                    host_path: shard_path.to_string_lossy().to_string(),
                    url: format!("http://{}:{}/shard_{}/{}", self.settings.manager_host, self.settings.file_port, index, file_name),
                }],
                output_files: vec![format!("outputs/shard_{}/{}", index, output_artifact_name(workflow_type))],
                input_size_mb: shard_mb,
                image,
                progress: 0.0,
                estimated_max_time_secs: 300,
                created_at: self.clock.now_utc(),
            };
            self.tasks.add(task);
            task_ids.push(task_id);
        }

        // Step 6: attach and advance, or fail when nothing materialized.
        if task_ids.is_empty() {
            return Err(Error::Split("no shard fits the weakest volunteer".to_string()));
        }

        if try_transition(handle, WorkflowStatus::Assigning).is_some() {
            self.notify_workflow(workflow_id, WorkflowStatus::Assigning, &format!("{} task(s) created", task_ids.len()));
        }
        log::info!("Workflow {} split into {} task(s)", workflow_id, task_ids.len());
        Ok(task_ids)
    }

    fn notify_workflow(&self, workflow_id: Uuid, status: WorkflowStatus, message: &str) {
        self.notifier.notify(
            "workflow_status_change",
            json!({ "workflow_id": workflow_id, "status": status.as_str(), "message": message }),
        );
    }
}

fn task_command(workflow_type: WorkflowType) -> &'static str {
    match workflow_type {
        WorkflowType::MatrixAddition => "/app/matrix_add",
        WorkflowType::MatrixMultiplication => "/app/matrix_mul",
        WorkflowType::MlTraining => "python /app/train_on_shard.py",
        WorkflowType::Custom => "/app/run",
    }
}

fn output_artifact_name(workflow_type: WorkflowType) -> &'static str {
    match workflow_type {
        WorkflowType::MatrixAddition | WorkflowType::MatrixMultiplication => "result.csv",
        WorkflowType::MlTraining => "model.pth",
        WorkflowType::Custom => "result.out",
    }
}
