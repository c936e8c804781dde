use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::domain::assignment::{Assignment, AssignmentStatus};

new_key_type! {
    pub struct AssignmentKey;
}

#[derive(Debug)]
struct StoreInner {
    slots: SlotMap<AssignmentKey, Arc<RwLock<Assignment>>>,

    /// History per (task, volunteer) pair, oldest first. Reassignments
    /// append; nothing is ever overwritten.
    pair_index: HashMap<(Uuid, Uuid), Vec<AssignmentKey>>,

    /// All assignment keys per task, oldest first.
    task_index: HashMap<Uuid, Vec<AssignmentKey>>,
}

#[derive(Debug, Clone)]
pub struct AssignmentStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                slots: SlotMap::with_key(),
                pair_index: HashMap::new(),
                task_index: HashMap::new(),
            })),
        }
    }

    pub fn add(&self, assignment: Assignment) -> AssignmentKey {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let pair = (assignment.task_id, assignment.volunteer_id);
        let task_id = assignment.task_id;
        let key = guard.slots.insert(Arc::new(RwLock::new(assignment)));
        guard.pair_index.entry(pair).or_default().push(key);
        guard.task_index.entry(task_id).or_default().push(key);
        key
    }

    /// The most recent assignment binding `task_id` to `volunteer_id`, the
    /// one unsolicited task events refer to.
    pub fn latest_for_pair(&self, task_id: &Uuid, volunteer_id: &Uuid) -> Option<Arc<RwLock<Assignment>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let keys = guard.pair_index.get(&(*task_id, *volunteer_id))?;
        keys.last().and_then(|key| guard.slots.get(*key).cloned())
    }

    pub fn for_task(&self, task_id: &Uuid) -> Vec<Arc<RwLock<Assignment>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .task_index
            .get(task_id)
            .map(|keys| keys.iter().filter_map(|key| guard.slots.get(*key).cloned()).collect())
            .unwrap_or_default()
    }

    /// The most recent completed assignment of a task, holding the result
    /// descriptor the collector downloads from.
    pub fn latest_completed_for_task(&self, task_id: &Uuid) -> Option<Arc<RwLock<Assignment>>> {
        self.for_task(task_id)
            .into_iter()
            .rev()
            .find(|handle| handle.read().expect("RwLock poisoned").status == AssignmentStatus::Completed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("RwLock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}
