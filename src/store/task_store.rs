use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::domain::task::{Task, TaskStatus};

new_key_type! {
    pub struct TaskKey;
}

#[derive(Debug)]
struct StoreInner {
    slots: SlotMap<TaskKey, Arc<RwLock<Task>>>,
    id_index: HashMap<Uuid, TaskKey>,

    /// Per-workflow task keys in insertion order, which is creation order.
    workflow_index: HashMap<Uuid, Vec<TaskKey>>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                slots: SlotMap::with_key(),
                id_index: HashMap::new(),
                workflow_index: HashMap::new(),
            })),
        }
    }

    pub fn add(&self, task: Task) -> TaskKey {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let id = task.id;
        let workflow_id = task.workflow_id;
        let key = guard.slots.insert(Arc::new(RwLock::new(task)));
        guard.id_index.insert(id, key);
        guard.workflow_index.entry(workflow_id).or_default().push(key);
        key
    }

    pub fn get_by_id(&self, id: &Uuid) -> Option<Arc<RwLock<Task>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.id_index.get(id)?;
        guard.slots.get(*key).cloned()
    }

    /// All tasks of one workflow, in creation order.
    pub fn for_workflow(&self, workflow_id: &Uuid) -> Vec<Arc<RwLock<Task>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .workflow_index
            .get(workflow_id)
            .map(|keys| keys.iter().filter_map(|key| guard.slots.get(*key).cloned()).collect())
            .unwrap_or_default()
    }

    /// Tasks of one workflow currently in `status`, in creation order.
    pub fn for_workflow_in_status(&self, workflow_id: &Uuid, status: TaskStatus) -> Vec<Arc<RwLock<Task>>> {
        self.for_workflow(workflow_id)
            .into_iter()
            .filter(|handle| handle.read().expect("RwLock poisoned").status == status)
            .collect()
    }

    pub fn count_for_workflow_in_status(&self, workflow_id: &Uuid, status: TaskStatus) -> usize {
        self.for_workflow_in_status(workflow_id, status).len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("RwLock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
