use std::sync::{Arc, RwLock};

use serde_json::json;
use uuid::Uuid;

use crate::api::message_dto::TaskEventDto;
use crate::clock::Clock;
use crate::domain::assignment::{Assignment, AssignmentStatus};
use crate::domain::task::{Task, TaskStatus};
use crate::domain::volunteer::{Volunteer, VolunteerStatus};
use crate::domain::workflow::{try_transition, Workflow, WorkflowStatus};
use crate::error::{Error, Result};
use crate::notify::NotificationSink;
use crate::store::{AssignmentStore, TaskStore, VolunteerStore, WorkflowStore};

/// What a terminal task event means for the whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Every task completed, none failed: results can be collected.
    Completed,
    /// Nothing is in flight anymore but at least one task failed.
    PartialFailure,
}

/// Consumes unsolicited accept/progress/complete/fail events from
/// volunteers and keeps tasks, assignments and workflows consistent under
/// arbitrary interleavings, including duplicates. Handlers run concurrently;
/// every mutation goes through the entity's own handle lock.
pub struct TaskTracker {
    workflows: WorkflowStore,
    tasks: TaskStore,
    volunteers: VolunteerStore,
    assignments: AssignmentStore,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl TaskTracker {
    pub fn new(
        workflows: WorkflowStore,
        tasks: TaskStore,
        volunteers: VolunteerStore,
        assignments: AssignmentStore,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { workflows, tasks, volunteers, assignments, notifier, clock }
    }

    /// A volunteer accepted its assignment and is starting work: the
    /// assignment moves to STARTED (created on the spot if the scheduler's
    /// record never made it here), and task and workflow are promoted to
    /// RUNNING.
    pub fn on_accept(&self, event: &TaskEventDto) -> Result<()> {
        let (workflow_handle, task_handle, volunteer_handle) = self.lookup(event)?;
        let volunteer_id = volunteer_handle.read().expect("RwLock poisoned").id;
        let now = self.clock.now_utc();

        match self.assignments.latest_for_pair(&event.task_id, &volunteer_id) {
            Some(handle) => {
                let mut assignment = handle.write().expect("RwLock poisoned");
                if assignment.status.is_terminal() {
                    log::warn!("Ignoring accept for finished assignment of task {}", event.task_id);
                    return Ok(());
                }
                assignment.status = AssignmentStatus::Started;
                assignment.started_at = Some(now);
            }
            None => {
                let mut assignment = Assignment::new(event.task_id, volunteer_id, now);
                assignment.status = AssignmentStatus::Started;
                assignment.started_at = Some(now);
                self.assignments.add(assignment);
                log::info!("Created assignment on accept for task {} and volunteer {}", event.task_id, event.volunteer_id);
            }
        }

        self.set_task_status(&task_handle, TaskStatus::Running, &volunteer_handle, "started");
        if try_transition(&workflow_handle, WorkflowStatus::Running).is_some() {
            self.notify_workflow(&workflow_handle, "workflow running");
        }
        Ok(())
    }

    /// Progress requires an existing assignment; a report without one
    /// signals an upstream protocol inconsistency and is dropped.
    pub fn on_progress(&self, event: &TaskEventDto) -> Result<()> {
        let (_, task_handle, volunteer_handle) = self.lookup(event)?;
        let volunteer_id = volunteer_handle.read().expect("RwLock poisoned").id;
        let progress = event.progress.unwrap_or(0.0);

        let Some(handle) = self.assignments.latest_for_pair(&event.task_id, &volunteer_id) else {
            log::error!("No assignment between task {} and volunteer {}, dropping progress report", event.task_id, event.volunteer_id);
            return Ok(());
        };

        {
            let mut assignment = handle.write().expect("RwLock poisoned");
            if assignment.status.is_terminal() {
                log::warn!("Ignoring progress for finished assignment of task {}", event.task_id);
                return Ok(());
            }
            assignment.progress = progress;
        }
        task_handle.write().expect("RwLock poisoned").progress = progress;
        Ok(())
    }

    /// Raw assignment status update from the volunteer side.
    pub fn on_status(&self, event: &TaskEventDto) -> Result<()> {
        let (_, _, volunteer_handle) = self.lookup(event)?;
        let volunteer_id = volunteer_handle.read().expect("RwLock poisoned").id;

        let Some(reported) = event.status.as_deref() else {
            return Err(Error::protocol("task/status", "missing status field"));
        };
        let Some(status) = AssignmentStatus::parse(reported) else {
            return Err(Error::protocol("task/status", format!("unknown assignment status '{}'", reported)));
        };

        let Some(handle) = self.assignments.latest_for_pair(&event.task_id, &volunteer_id) else {
            log::error!("No assignment between task {} and volunteer {}, dropping status update", event.task_id, event.volunteer_id);
            return Ok(());
        };
        handle.write().expect("RwLock poisoned").status = status;
        Ok(())
    }

    /// Terminal success for one assignment. Frees the volunteer and reports
    /// whether the workflow converged. Delivering the same completion twice
    /// is absorbed without re-counting.
    pub fn on_complete(&self, event: &TaskEventDto) -> Result<Option<Convergence>> {
        let (workflow_handle, task_handle, volunteer_handle) = self.lookup(event)?;
        let workflow_id = workflow_handle.read().expect("RwLock poisoned").id;
        let volunteer_id = volunteer_handle.read().expect("RwLock poisoned").id;
        let now = self.clock.now_utc();

        match self.assignments.latest_for_pair(&event.task_id, &volunteer_id) {
            Some(handle) => {
                let mut assignment = handle.write().expect("RwLock poisoned");
                if assignment.status == AssignmentStatus::Completed {
                    log::info!("Duplicate completion for task {}, ignoring", event.task_id);
                    return Ok(None);
                }
                assignment.status = AssignmentStatus::Completed;
                assignment.progress = 100.0;
                assignment.completed_at = Some(now);
                assignment.result = event.result.clone();
            }
            None => {
                // No record of this binding; trust the volunteer and keep
                // the result rather than erroring on our own bookkeeping.
                log::warn!("No assignment between task {} and volunteer {}, recording completion post-hoc", event.task_id, event.volunteer_id);
                let mut assignment = Assignment::new(event.task_id, volunteer_id, now);
                assignment.status = AssignmentStatus::Completed;
                assignment.progress = 100.0;
                assignment.started_at = Some(now);
                assignment.completed_at = Some(now);
                assignment.result = event.result.clone();
                self.assignments.add(assignment);
            }
        }

        {
            let mut task = task_handle.write().expect("RwLock poisoned");
            task.status = TaskStatus::Completed;
            task.progress = 100.0;
        }
        self.notify_task(&task_handle, &volunteer_handle, "completed");
        self.free_volunteer(&volunteer_handle);

        Ok(self.convergence(&workflow_id))
    }

    /// Terminal failure for one assignment; mirrors completion but records
    /// the error. Other in-flight assignments are left untouched.
    pub fn on_fail(&self, event: &TaskEventDto) -> Result<Option<Convergence>> {
        let (workflow_handle, task_handle, volunteer_handle) = self.lookup(event)?;
        let workflow_id = workflow_handle.read().expect("RwLock poisoned").id;
        let volunteer_id = volunteer_handle.read().expect("RwLock poisoned").id;
        let now = self.clock.now_utc();
        let error = event.error.clone().unwrap_or_else(|| "task failed on volunteer".to_string());

        match self.assignments.latest_for_pair(&event.task_id, &volunteer_id) {
            Some(handle) => {
                let mut assignment = handle.write().expect("RwLock poisoned");
                if assignment.status == AssignmentStatus::Failed {
                    log::info!("Duplicate failure for task {}, ignoring", event.task_id);
                    return Ok(None);
                }
                assignment.status = AssignmentStatus::Failed;
                assignment.completed_at = Some(now);
                assignment.error = Some(error.clone());
            }
            None => {
                log::warn!("No assignment between task {} and volunteer {}, recording failure post-hoc", event.task_id, event.volunteer_id);
                let mut assignment = Assignment::new(event.task_id, volunteer_id, now);
                assignment.status = AssignmentStatus::Failed;
                assignment.completed_at = Some(now);
                assignment.error = Some(error.clone());
                self.assignments.add(assignment);
            }
        }

        {
            let mut task = task_handle.write().expect("RwLock poisoned");
            task.status = TaskStatus::Failed;
        }
        log::error!("Task {} failed on volunteer {}: {}", event.task_id, event.volunteer_id, error);
        self.notify_task(&task_handle, &volunteer_handle, "failed");
        self.free_volunteer(&volunteer_handle);

        Ok(self.convergence(&workflow_id))
    }

    /// Convergence check: once nothing is in flight anymore, the workflow
    /// either completed cleanly or ended with failures.
    fn convergence(&self, workflow_id: &Uuid) -> Option<Convergence> {
        let tasks = self.tasks.for_workflow(workflow_id);
        if tasks.is_empty() {
            return None;
        }

        let mut in_flight = 0usize;
        let mut failed = 0usize;
        for handle in &tasks {
            match handle.read().expect("RwLock poisoned").status {
                TaskStatus::Completed => {}
                TaskStatus::Failed => failed += 1,
                _ => in_flight += 1,
            }
        }

        match (in_flight, failed) {
            (0, 0) => Some(Convergence::Completed),
            (0, _) => Some(Convergence::PartialFailure),
            _ => {
                log::debug!("Workflow {} still has {} task(s) in flight", workflow_id, in_flight);
                None
            }
        }
    }

    fn lookup(&self, event: &TaskEventDto) -> Result<(Arc<RwLock<Workflow>>, Arc<RwLock<Task>>, Arc<RwLock<Volunteer>>)> {
        let workflow = self
            .workflows
            .get_by_id(&event.workflow_id)
            .or_else(|| self.workflows.find_by_coordinator_id(&event.workflow_id))
            .ok_or_else(|| Error::lookup("workflow", event.workflow_id))?;
        let task = self.tasks.get_by_id(&event.task_id).ok_or_else(|| Error::lookup("task", event.task_id))?;
        let volunteer = self
            .volunteers
            .get_by_coordinator_id(&event.volunteer_id)
            .ok_or_else(|| Error::lookup("volunteer", event.volunteer_id))?;
        Ok((workflow, task, volunteer))
    }

    fn set_task_status(&self, task_handle: &Arc<RwLock<Task>>, status: TaskStatus, volunteer_handle: &Arc<RwLock<Volunteer>>, verb: &str) {
        {
            let mut task = task_handle.write().expect("RwLock poisoned");
            task.status = status;
        }
        self.notify_task(task_handle, volunteer_handle, verb);
    }

    fn free_volunteer(&self, volunteer_handle: &Arc<RwLock<Volunteer>>) {
        let mut volunteer = volunteer_handle.write().expect("RwLock poisoned");
        volunteer.status = VolunteerStatus::Available;
        log::info!("Volunteer '{}' is available again", volunteer.name);
    }

    fn notify_task(&self, task_handle: &Arc<RwLock<Task>>, volunteer_handle: &Arc<RwLock<Volunteer>>, verb: &str) {
        let task = task_handle.read().expect("RwLock poisoned");
        let volunteer_name = volunteer_handle.read().expect("RwLock poisoned").name.clone();
        self.notifier.notify(
            "task_status_change",
            json!({
                "workflow_id": task.workflow_id,
                "task_id": task.id,
                "status": task.status.as_str(),
                "volunteer": volunteer_name,
                "message": format!("Task '{}' {} by {}", task.name, verb, volunteer_name),
            }),
        );
    }

    fn notify_workflow(&self, workflow_handle: &Arc<RwLock<Workflow>>, message: &str) {
        let workflow = workflow_handle.read().expect("RwLock poisoned");
        self.notifier.notify(
            "workflow_status_change",
            json!({ "workflow_id": workflow.id, "status": workflow.status.as_str(), "message": message }),
        );
    }
}
