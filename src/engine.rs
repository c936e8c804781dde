use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::message_dto::{ReplyDto, RosterDto, SubmissionDto};
use crate::api::JsonMap;
use crate::bus::client::{BusClient, BusListener, Dispatch};
use crate::bus::protocol::{Channel, Inbound};
use crate::clock::{Clock, SystemClock};
use crate::collector::{ConcatAggregator, ResultAggregator, ResultCollector};
use crate::config::ManagerConfig;
use crate::correlator::RequestCorrelator;
use crate::domain::task::TaskStatus;
use crate::domain::workflow::{try_transition, Workflow, WorkflowStatus, WorkflowType};
use crate::error::{Error, Result};
use crate::image::{ContainerImageService, SimulatedImageService};
use crate::notify::{LogNotifier, NotificationSink};
use crate::scheduler::Scheduler;
use crate::splitter::{CsvRowSplitter, DatasetSplitter, SplitterSettings, WorkflowSplitter};
use crate::store::{AssignmentStore, TaskStore, VolunteerStore, WorkflowStore};
use crate::tracker::{Convergence, TaskTracker};

/// The injected collaborator set; production wiring by default, single
/// pieces swapped out in tests.
pub struct Collaborators {
    pub dataset_splitter: Arc<dyn DatasetSplitter>,
    pub image_service: Arc<dyn ContainerImageService>,
    pub aggregators: HashMap<WorkflowType, Arc<dyn ResultAggregator>>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn standard() -> Self {
        let concat: Arc<dyn ResultAggregator> = Arc::new(ConcatAggregator::default());
        let mut aggregators: HashMap<WorkflowType, Arc<dyn ResultAggregator>> = HashMap::new();
        for workflow_type in [WorkflowType::MatrixAddition, WorkflowType::MatrixMultiplication, WorkflowType::MlTraining, WorkflowType::Custom] {
            aggregators.insert(workflow_type, concat.clone());
        }

        Self {
            dataset_splitter: Arc::new(CsvRowSplitter),
            image_service: Arc::new(SimulatedImageService::default()),
            aggregators,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The orchestration engine of the manager node: owns the stores, the
/// correlation layer and the pipeline components, and routes every inbound
/// bus message. Explicitly constructed and explicitly started; holds no
/// global state.
pub struct ManagerEngine {
    cfg: ManagerConfig,
    pub workflows: WorkflowStore,
    pub tasks: TaskStore,
    pub volunteers: VolunteerStore,
    pub assignments: AssignmentStore,
    pub correlator: RequestCorrelator,
    splitter: WorkflowSplitter,
    scheduler: Scheduler,
    tracker: TaskTracker,
    collector: ResultCollector,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
}

impl ManagerEngine {
    pub fn new(cfg: ManagerConfig, bus: BusClient, collaborators: Collaborators) -> Arc<Self> {
        let workflows = WorkflowStore::new();
        let tasks = TaskStore::new();
        let volunteers = VolunteerStore::new();
        let assignments = AssignmentStore::new();

        let correlator = RequestCorrelator::new(bus.clone(), collaborators.clock.clone(), Duration::from_secs(cfg.pending_request_ttl_secs));

        let splitter = WorkflowSplitter::new(
            workflows.clone(),
            tasks.clone(),
            volunteers.clone(),
            collaborators.dataset_splitter,
            collaborators.image_service,
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
            SplitterSettings {
                work_dir: cfg.work_dir.clone(),
                manager_host: cfg.manager_host.clone(),
                file_port: cfg.file_port,
                est_sample_size_mb: cfg.est_sample_size_mb,
            },
        );
        let scheduler = Scheduler::new(
            workflows.clone(),
            tasks.clone(),
            volunteers.clone(),
            assignments.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
        );
        let tracker = TaskTracker::new(
            workflows.clone(),
            tasks.clone(),
            volunteers.clone(),
            assignments.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
        );
        let collector = ResultCollector::new(
            workflows.clone(),
            tasks.clone(),
            assignments.clone(),
            collaborators.aggregators,
            bus.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
            cfg.work_dir.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            workflows,
            tasks,
            volunteers,
            assignments,
            correlator,
            splitter,
            scheduler,
            tracker,
            collector,
            notifier: collaborators.notifier,
            clock: collaborators.clock,
            shutdown_tx,
        })
    }

    /// Starts the receive loop and the pending-request sweeper.
    ///
    /// # Returns
    /// The spawned task handles; join them after `shutdown()` for a clean
    /// exit.
    pub fn start(self: Arc<Self>, listener: BusListener) -> Vec<JoinHandle<()>> {
        let dispatcher: Arc<dyn Dispatch> = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let listener_handle = tokio::spawn(async move {
            listener.run(Channel::inbound(), dispatcher, shutdown_rx).await;
        });

        let sweeper_handle = self
            .correlator
            .spawn_sweeper(Duration::from_secs(self.cfg.sweep_interval_secs), self.shutdown_tx.subscribe());

        vec![listener_handle, sweeper_handle]
    }

    /// Signals every loop spawned by `start` to wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn add_workflow(&self, workflow: Workflow) -> Uuid {
        let id = workflow.id;
        self.workflows.add(workflow);
        id
    }

    /// Validates and submits a workflow to the coordinator over the bus.
    /// The coordinator's ack (matched through the correlator) triggers the
    /// splitting stage.
    ///
    /// # Returns
    /// The correlated request id.
    pub fn submit_workflow(self: Arc<Self>, workflow_id: Uuid) -> Result<Uuid> {
        let handle = self
            .workflows
            .get_by_id(&workflow_id)
            .ok_or_else(|| Error::lookup("workflow", workflow_id))?;

        let submission = {
            let mut workflow = handle.write().expect("RwLock poisoned");
            if workflow.input_path.is_empty() {
                return Err(Error::Split("workflow has no input dataset".to_string()));
            }
            workflow.transition(WorkflowStatus::Validated)?;
            workflow.transition(WorkflowStatus::Submitted)?;
            workflow.submitted_at = Some(self.clock.now_utc());

            SubmissionDto {
                workflow_id: workflow.id,
                workflow_name: workflow.name.clone(),
                workflow_type: workflow.workflow_type.as_str().to_string(),
                owner: workflow.owner.clone(),
                priority: workflow.priority,
                estimated_resources: workflow.estimated_resources,
                max_execution_time: workflow.max_execution_time_secs,
                input_data_size: workflow.input_data_size_mb,
                retry_count: workflow.retry_count,
                submitted_at: self.clock.now_ms(),
            }
        };
        self.notify_workflow(&handle, "workflow submitted");

        let body = match serde_json::to_value(&submission)? {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        };
        let (request_id, reply_rx) = self.correlator.send_correlated(Channel::WorkflowSubmission, body)?;

        let engine = self.clone();
        tokio::spawn(async move {
            match reply_rx.await {
                Ok(reply) => engine.on_submission_reply(workflow_id, reply).await,
                Err(_) => log::warn!("Submission request for workflow {} expired without a reply", workflow_id),
            }
        });

        log::info!("Workflow {} submitted with request {}", workflow_id, request_id);
        Ok(request_id)
    }

    /// Registers this manager with the coordinator and waits for the
    /// correlated reply.
    pub async fn register_manager(&self, host_name: &str, user_id: &str) -> Result<ReplyDto> {
        let mut body = JsonMap::new();
        body.insert("host_name".to_string(), json!(host_name));
        body.insert("user_id".to_string(), json!(user_id));
        self.correlated_roundtrip(Channel::AuthRegister, body).await
    }

    /// Authenticates this manager against the coordinator.
    pub async fn login_manager(&self, manager_id: &str) -> Result<ReplyDto> {
        let mut body = JsonMap::new();
        body.insert("manager_id".to_string(), json!(manager_id));
        self.correlated_roundtrip(Channel::AuthLogin, body).await
    }

    async fn correlated_roundtrip(&self, channel: Channel, body: JsonMap) -> Result<ReplyDto> {
        let (request_id, reply_rx) = self.correlator.send_correlated(channel, body)?;
        log::info!("Request {} sent on '{}'", request_id, channel.as_str());
        let reply = reply_rx
            .await
            .map_err(|_| Error::Connection(format!("request on '{}' expired without a reply", channel.as_str())))?;
        Ok(serde_json::from_value(Value::Object(reply))?)
    }

    /// Coordinator ack for a submission: record the external correlation
    /// key, then split. A rejected submission fails the workflow.
    async fn on_submission_reply(&self, workflow_id: Uuid, reply: JsonMap) {
        let Some(handle) = self.workflows.get_by_id(&workflow_id) else {
            log::error!("Workflow {} vanished before its submission reply", workflow_id);
            return;
        };

        let reply: ReplyDto = match serde_json::from_value(Value::Object(reply)) {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("Unusable submission reply for workflow {}: {}", workflow_id, e);
                return;
            }
        };

        if !reply.is_success() {
            let message = reply.message.unwrap_or_else(|| "submission rejected by coordinator".to_string());
            self.fail_workflow(&handle, &message);
            return;
        }

        let coordinator_id = reply.info.get("workflow_id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok());
        {
            let mut workflow = handle.write().expect("RwLock poisoned");
            workflow.coordinator_workflow_id = coordinator_id;
        }

        if try_transition(&handle, WorkflowStatus::Splitting).is_none() {
            return;
        }
        self.notify_workflow(&handle, "splitting dataset");

        match self.splitter.split(workflow_id).await {
            Ok(task_ids) => log::info!("Workflow {} ready for assignment with {} task(s)", workflow_id, task_ids.len()),
            // The splitter has already moved the workflow to FAILED.
            Err(e) => log::error!("Workflow {} could not be split: {}", workflow_id, e),
        }
    }

    /// Coordinator roster push: run a scheduling pass over the offered
    /// volunteers.
    async fn handle_roster(&self, roster: RosterDto) -> Result<()> {
        let handle = self
            .workflows
            .get_by_id(&roster.workflow_id)
            .or_else(|| self.workflows.find_by_coordinator_id(&roster.workflow_id))
            .ok_or_else(|| Error::lookup("workflow", roster.workflow_id))?;
        let workflow_id = handle.read().expect("RwLock poisoned").id;

        if roster.volunteers.is_empty() {
            log::error!("Roster for workflow {} contains no volunteers", workflow_id);
            return Ok(());
        }

        let plan = self.scheduler.assign(workflow_id, &roster.volunteers).await?;
        for task_id in &plan.unassigned {
            log::warn!("Task {} of workflow {} is waiting for a bigger volunteer", task_id, workflow_id);
        }

        // A roster can also unblock a reassignment that found no volunteer.
        let status = handle.read().expect("RwLock poisoned").status;
        if status == WorkflowStatus::Reassigning && plan.assigned_count() > 0 && try_transition(&handle, WorkflowStatus::Running).is_some() {
            self.notify_workflow(&handle, "reassigned tasks running");
        }
        Ok(())
    }

    /// A terminal task event tipped the workflow over: either aggregate the
    /// results or enter the reassignment path.
    async fn on_convergence(&self, workflow_id: Uuid, convergence: Convergence) -> Result<()> {
        let handle = self
            .workflows
            .get_by_id(&workflow_id)
            .or_else(|| self.workflows.find_by_coordinator_id(&workflow_id))
            .ok_or_else(|| Error::lookup("workflow", workflow_id))?;
        let workflow_id = handle.read().expect("RwLock poisoned").id;

        match convergence {
            Convergence::Completed => {
                // The transition guard makes the collection fire exactly
                // once even when duplicate completions race.
                if try_transition(&handle, WorkflowStatus::Aggregating).is_none() {
                    return Ok(());
                }
                self.notify_workflow(&handle, "aggregating results");
                if let Err(e) = self.collector.collect(workflow_id).await {
                    log::error!("Aggregation for workflow {} failed: {}", workflow_id, e);
                }
            }
            Convergence::PartialFailure => {
                if try_transition(&handle, WorkflowStatus::PartialFailure).is_none() {
                    return Ok(());
                }
                self.notify_workflow(&handle, "some tasks failed");
                self.reassign_failed(&handle, workflow_id).await?;
            }
        }
        Ok(())
    }

    /// Reassignment policy: burn one retry, reset failed tasks to CREATED
    /// and run a scheduling pass over the known pool. With the budget
    /// exhausted the workflow fails; with no volunteer available it stays in
    /// REASSIGNING until the next roster arrives.
    async fn reassign_failed(&self, handle: &Arc<RwLock<Workflow>>, workflow_id: Uuid) -> Result<()> {
        if try_transition(handle, WorkflowStatus::Reassigning).is_none() {
            return Ok(());
        }
        self.notify_workflow(handle, "reassigning failed tasks");

        let out_of_budget = {
            let mut workflow = handle.write().expect("RwLock poisoned");
            if workflow.retry_count == 0 {
                true
            } else {
                workflow.retry_count -= 1;
                false
            }
        };
        if out_of_budget {
            self.fail_workflow(handle, "retry budget exhausted after repeated task failures");
            return Ok(());
        }

        let failed_tasks = self.tasks.for_workflow_in_status(&workflow_id, TaskStatus::Failed);
        for task_handle in &failed_tasks {
            let mut task = task_handle.write().expect("RwLock poisoned");
            task.status = TaskStatus::Created;
            task.progress = 0.0;
        }
        log::info!("Reset {} failed task(s) of workflow {} for reassignment", failed_tasks.len(), workflow_id);

        let plan = self.scheduler.assign(workflow_id, &[]).await?;
        if plan.assigned_count() > 0 {
            if try_transition(handle, WorkflowStatus::Running).is_some() {
                self.notify_workflow(handle, "reassigned tasks running");
            }
        } else {
            log::warn!("No volunteer available to reassign workflow {}, waiting for the next roster", workflow_id);
        }
        Ok(())
    }

    fn fail_workflow(&self, handle: &Arc<RwLock<Workflow>>, reason: &str) {
        {
            let mut workflow = handle.write().expect("RwLock poisoned");
            let id = workflow.id;
            if let Err(e) = workflow.fail(reason) {
                log::warn!("Ignoring transition for workflow {}: {}", id, e);
                return;
            }
            log::error!("Workflow {} failed: {}", id, reason);
        }
        self.notify_workflow(handle, reason);
    }

    fn notify_workflow(&self, handle: &Arc<RwLock<Workflow>>, message: &str) {
        let workflow = handle.read().expect("RwLock poisoned");
        self.notifier.notify(
            "workflow_status_change",
            json!({ "workflow_id": workflow.id, "status": workflow.status.as_str(), "message": message }),
        );
    }
}

#[async_trait]
impl Dispatch for ManagerEngine {
    /// The exhaustive routing table: every inbound message kind has exactly
    /// one home.
    async fn dispatch(&self, message: Inbound) -> Result<()> {
        match message {
            Inbound::Reply { channel: _, body } => {
                self.correlator.on_reply(body);
                Ok(())
            }
            Inbound::TaskAccept(event) => self.tracker.on_accept(&event),
            Inbound::TaskProgress(event) => self.tracker.on_progress(&event),
            Inbound::TaskStatus(event) => self.tracker.on_status(&event),
            Inbound::TaskComplete(event) => match self.tracker.on_complete(&event)? {
                Some(convergence) => self.on_convergence(event.workflow_id, convergence).await,
                None => Ok(()),
            },
            Inbound::TaskFail(event) => match self.tracker.on_fail(&event)? {
                Some(convergence) => self.on_convergence(event.workflow_id, convergence).await,
                None => Ok(()),
            },
            Inbound::Roster(roster) => self.handle_roster(roster).await,
        }
    }
}
