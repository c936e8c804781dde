use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::message_dto::VolunteerDescriptorDto;
use crate::clock::Clock;
use crate::domain::assignment::Assignment;
use crate::domain::resources::Resources;
use crate::domain::task::{Task, TaskStatus};
use crate::domain::volunteer::{Volunteer, VolunteerStatus};
use crate::domain::workflow::{try_transition, WorkflowStatus};
use crate::error::{Error, Result};
use crate::notify::NotificationSink;
use crate::store::{AssignmentStore, TaskStore, VolunteerStore, WorkflowStore};

/// Outcome of one scheduling pass: tasks per volunteer (keyed by the
/// coordinator's volunteer id) plus the tasks nothing could host. Unassigned
/// tasks are reported, never dropped.
#[derive(Debug, Default)]
pub struct AssignmentPlan {
    pub assigned: HashMap<Uuid, Vec<Uuid>>,
    pub unassigned: Vec<Uuid>,
}

impl AssignmentPlan {
    pub fn assigned_count(&self) -> usize {
        self.assigned.values().map(Vec::len).sum()
    }
}

/// First-come-first-served matching of pending tasks to volunteers under
/// CPU/RAM/disk constraints: tasks in creation order, volunteers scanned in
/// registration order, first fit wins. Deterministic for identical inputs.
pub struct Scheduler {
    workflows: WorkflowStore,
    tasks: TaskStore,
    volunteers: VolunteerStore,
    assignments: AssignmentStore,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    /// Serializes concurrent assignment passes; the residual pool below is
    /// only consistent within one pass.
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        workflows: WorkflowStore,
        tasks: TaskStore,
        volunteers: VolunteerStore,
        assignments: AssignmentStore,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { workflows, tasks, volunteers, assignments, notifier, clock, pass_lock: Mutex::new(()) }
    }

    /// Runs one scheduling pass for a workflow.
    ///
    /// The roster is upserted first; an empty roster falls back to every
    /// already-known available volunteer (the reassignment path). Volunteers
    /// saturated on any dimension are marked busy afterwards, and the
    /// workflow advances to PENDING once at least one task was placed.
    pub async fn assign(&self, workflow_id: Uuid, roster: &[VolunteerDescriptorDto]) -> Result<AssignmentPlan> {
        let _pass = self.pass_lock.lock().await;

        let workflow_handle = self
            .workflows
            .get_by_id(&workflow_id)
            .ok_or_else(|| Error::lookup("workflow", workflow_id))?;

        // Step 1: upsert the roster and build the residual pool.
        let now = self.clock.now_utc();
        let pool_handles: Vec<Arc<RwLock<Volunteer>>> = if roster.is_empty() {
            self.volunteers
                .in_registration_order()
                .into_iter()
                .filter(|handle| handle.read().expect("RwLock poisoned").status == VolunteerStatus::Available)
                .collect()
        } else {
            for descriptor in roster {
                self.volunteers.upsert(descriptor.id, &descriptor.name, descriptor.capacity(), now);
            }
            let roster_ids: Vec<Uuid> = roster.iter().map(|d| d.id).collect();
            self.volunteers
                .in_registration_order()
                .into_iter()
                .filter(|handle| roster_ids.contains(&handle.read().expect("RwLock poisoned").coordinator_volunteer_id))
                .collect()
        };

        let mut pool: Vec<(Arc<RwLock<Volunteer>>, Resources)> = pool_handles
            .into_iter()
            .map(|handle| {
                let capacity = handle.read().expect("RwLock poisoned").capacity;
                (handle, capacity)
            })
            .collect();

        // Step 2: pending tasks, oldest first.
        let mut pending = self.tasks.for_workflow_in_status(&workflow_id, TaskStatus::Created);
        pending.sort_by_key(|handle| handle.read().expect("RwLock poisoned").created_at);

        // Steps 3-4: first fit in registration order; misfits stay CREATED.
        let mut plan = AssignmentPlan::default();
        for task_handle in &pending {
            let (task_id, required) = {
                let task = task_handle.read().expect("RwLock poisoned");
                (task.id, task.required_resources)
            };

            let slot = pool.iter_mut().find(|(_, residual)| residual.fits(&required));
            match slot {
                Some((volunteer_handle, residual)) => {
                    let (volunteer_id, coordinator_id, volunteer_name) = {
                        let volunteer = volunteer_handle.read().expect("RwLock poisoned");
                        (volunteer.id, volunteer.coordinator_volunteer_id, volunteer.name.clone())
                    };

                    self.assignments.add(Assignment::new(task_id, volunteer_id, now));
                    residual.subtract(&required);
                    self.mark_assigned(task_handle, &volunteer_name);
                    plan.assigned.entry(coordinator_id).or_default().push(task_id);
                }
                None => {
                    log::warn!("Task {} stays unassigned, no volunteer fits {:?}", task_id, required);
                    plan.unassigned.push(task_id);
                }
            }
        }

        // Step 5: saturated volunteers go busy.
        for (volunteer_handle, residual) in &pool {
            if residual.is_exhausted() {
                let mut volunteer = volunteer_handle.write().expect("RwLock poisoned");
                volunteer.status = VolunteerStatus::Busy;
                log::info!("Volunteer '{}' saturated, marked busy", volunteer.name);
            }
        }

        // Step 6: at least one placement advances the workflow.
        if plan.assigned_count() > 0 && try_transition(&workflow_handle, WorkflowStatus::Pending).is_some() {
            self.notifier.notify(
                "workflow_status_change",
                json!({ "workflow_id": workflow_id, "status": WorkflowStatus::Pending.as_str(), "message": format!("{} task(s) assigned", plan.assigned_count()) }),
            );
        }

        log::info!(
            "Scheduling pass for workflow {}: {} assigned across {} volunteer(s), {} unassigned",
            workflow_id,
            plan.assigned_count(),
            plan.assigned.len(),
            plan.unassigned.len()
        );
        Ok(plan)
    }

    fn mark_assigned(&self, task_handle: &Arc<RwLock<Task>>, volunteer_name: &str) {
        let mut task = task_handle.write().expect("RwLock poisoned");
        task.status = TaskStatus::Assigned;
        self.notifier.notify(
            "task_status_change",
            json!({
                "workflow_id": task.workflow_id,
                "task_id": task.id,
                "status": task.status.as_str(),
                "volunteer": volunteer_name,
                "message": format!("Task '{}' assigned to {}", task.name, volunteer_name),
            }),
        );
    }
}
