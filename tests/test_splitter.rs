use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use grid_manager::clock::ManualClock;
use grid_manager::domain::resources::Resources;
use grid_manager::domain::workflow::{Workflow, WorkflowStatus, WorkflowType};
use grid_manager::image::SimulatedImageService;
use grid_manager::notify::{MemoryNotifier, NotificationSink};
use grid_manager::splitter::{CsvRowSplitter, DatasetSplitter, SplitterSettings, WorkflowSplitter};
use grid_manager::store::{TaskStore, VolunteerStore, WorkflowStore};

struct Harness {
    workflows: WorkflowStore,
    tasks: TaskStore,
    volunteers: VolunteerStore,
    splitter: WorkflowSplitter,
    dir: tempfile::TempDir,
    work_dir: PathBuf,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("work");

    let workflows = WorkflowStore::new();
    let tasks = TaskStore::new();
    let volunteers = VolunteerStore::new();
    let notifier: Arc<dyn NotificationSink> = MemoryNotifier::new();
    let splitter = WorkflowSplitter::new(
        workflows.clone(),
        tasks.clone(),
        volunteers.clone(),
        Arc::new(CsvRowSplitter),
        Arc::new(SimulatedImageService::default()),
        notifier,
        ManualClock::new(0),
        SplitterSettings { work_dir: work_dir.clone(), manager_host: "10.0.0.1".to_string(), file_port: 1010, est_sample_size_mb: 0.5 },
    );
    Harness { workflows, tasks, volunteers, splitter, dir, work_dir }
}

/// A CSV dataset with `rows` records; `pad` controls the row payload size.
fn write_dataset(dir: &Path, rows: usize, pad: usize) -> PathBuf {
    let path = dir.join("dataset.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "sample,value").unwrap();
    for row in 0..rows {
        writeln!(file, "{},{}", row, "v".repeat(pad.max(1))).unwrap();
    }
    path
}

/// A workflow parked in SPLITTING with the dataset attached.
fn seed_workflow(harness: &Harness, input_path: &Path) -> Uuid {
    let mut workflow = Workflow::new("training-run", WorkflowType::MlTraining, "tester", Utc::now());
    workflow.input_path = input_path.to_string_lossy().to_string();
    for status in [WorkflowStatus::Validated, WorkflowStatus::Submitted, WorkflowStatus::Splitting] {
        workflow.transition(status).unwrap();
    }
    let id = workflow.id;
    harness.workflows.add(workflow);
    id
}

fn add_volunteer(harness: &Harness, cpu: u32, ram: u64, disk: u64) {
    harness.volunteers.upsert(Uuid::new_v4(), "node", Resources::new(cpu, ram, disk), Utc::now());
}

/// 10 samples against 1024MB of RAM at 0.5MB each: 2048 samples fit one
/// shard, so exactly one task comes out.
#[tokio::test]
async fn test_small_dataset_yields_exactly_one_task() {
    let h = harness();
    add_volunteer(&h, 2, 1024, 5);
    assert_eq!(h.splitter.estimate_shard_count(10, 1024), 1);

    let dataset = write_dataset(h.dir.path(), 10, 4);
    let workflow_id = seed_workflow(&h, &dataset);

    let task_ids = h.splitter.split(workflow_id).await.unwrap();
    assert_eq!(task_ids.len(), 1);
    assert_eq!(h.workflows.get_by_id(&workflow_id).unwrap().read().unwrap().status, WorkflowStatus::Assigning);

    let task = h.tasks.get_by_id(&task_ids[0]).unwrap();
    let task = task.read().unwrap();
    // Requirements never exceed the weakest volunteer.
    assert_eq!(task.required_resources, Resources::new(2, 1024, 5));
    assert_eq!(task.input_files.len(), 1);
    assert!(task.input_files[0].url.starts_with("http://10.0.0.1:1010/shard_0/"));
    assert!(Path::new(&task.input_files[0].host_path).exists());
    assert!(task.image.full_name().contains("ml-training"));
}

/// Task requirements equal the component-wise minimum over a mixed pool.
#[tokio::test]
async fn test_requirements_bounded_by_weakest_volunteer() {
    let h = harness();
    add_volunteer(&h, 8, 1024, 100);
    add_volunteer(&h, 2, 4096, 3);

    let dataset = write_dataset(h.dir.path(), 50, 4);
    let workflow_id = seed_workflow(&h, &dataset);

    let task_ids = h.splitter.split(workflow_id).await.unwrap();
    assert!(!task_ids.is_empty());
    for task_id in &task_ids {
        let task = h.tasks.get_by_id(task_id).unwrap();
        assert_eq!(task.read().unwrap().required_resources, Resources::new(2, 1024, 3));
    }
}

/// An empty pool falls back to the {1 cpu, 512MB, 1GB} floor.
#[tokio::test]
async fn test_empty_pool_uses_default_floor() {
    let h = harness();
    assert_eq!(h.splitter.min_volunteer_resources(), Resources::pool_default());

    let dataset = write_dataset(h.dir.path(), 10, 4);
    let workflow_id = seed_workflow(&h, &dataset);
    let task_ids = h.splitter.split(workflow_id).await.unwrap();
    assert_eq!(task_ids.len(), 1);
    let task = h.tasks.get_by_id(&task_ids[0]).unwrap();
    assert_eq!(task.read().unwrap().required_resources, Resources::pool_default());
}

/// Contiguous partitioning: shard row counts are len/n with the remainder
/// in the last shard, and concatenating the shards restores the input.
#[tokio::test]
async fn test_csv_splitter_partitions_are_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = write_dataset(dir.path(), 10, 4);
    let out_dir = dir.path().join("inputs");

    let splitter = CsvRowSplitter;
    assert_eq!(splitter.sample_count(&dataset).await.unwrap(), 10);

    let shards = splitter.split(&dataset, 3, &out_dir).await.unwrap();
    assert_eq!(shards.len(), 3);

    let mut all_rows = Vec::new();
    let mut per_shard = Vec::new();
    for shard in &shards {
        let mut reader = csv::Reader::from_path(shard).unwrap();
        let rows: Vec<String> = reader.records().map(|r| r.unwrap()[0].to_string()).collect();
        per_shard.push(rows.len());
        all_rows.extend(rows);
    }
    assert_eq!(per_shard, vec![3, 3, 4]);
    let expected: Vec<String> = (0..10).map(|row| row.to_string()).collect();
    assert_eq!(all_rows, expected);
}

/// When every shard overruns the weakest disk the split yields nothing and
/// the workflow fails instead of advancing.
#[tokio::test]
async fn test_all_shards_oversized_fails_workflow() {
    let h = harness();
    // A volunteer reporting no usable disk: every non-empty shard is too big.
    add_volunteer(&h, 2, 1024, 0);

    // ~2MB of CSV so the shard rounds to a nonzero megabyte count.
    let dataset = write_dataset(h.dir.path(), 2000, 1024);
    let workflow_id = seed_workflow(&h, &dataset);

    assert!(h.splitter.split(workflow_id).await.is_err());
    let workflow = h.workflows.get_by_id(&workflow_id).unwrap();
    let workflow = workflow.read().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.last_error.is_some());
    assert!(h.tasks.for_workflow(&workflow_id).is_empty());
}

/// Shard files land under the per-workflow inputs directory.
#[tokio::test]
async fn test_shards_are_materialized_under_work_dir() {
    let h = harness();
    add_volunteer(&h, 1, 512, 2);

    let dataset = write_dataset(h.dir.path(), 8, 4);
    let workflow_id = seed_workflow(&h, &dataset);
    h.splitter.split(workflow_id).await.unwrap();

    let inputs_dir = h.work_dir.join(workflow_id.to_string()).join("inputs");
    assert!(inputs_dir.join("shard_0").join("data.csv").exists());
}
