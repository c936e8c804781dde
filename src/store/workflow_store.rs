use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::domain::workflow::Workflow;

new_key_type! {
    pub struct WorkflowKey;
}

#[derive(Debug)]
struct StoreInner {
    /// Workflow storage.
    slots: SlotMap<WorkflowKey, Arc<RwLock<Workflow>>>,

    /// Index lookup of the internal key by the workflow's uuid.
    id_index: HashMap<Uuid, WorkflowKey>,
}

/// All workflows known to this manager. The store lock only guards the maps;
/// entity mutation happens under each workflow's own handle lock, which is
/// the per-entity critical section for concurrent event handlers.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner { slots: SlotMap::with_key(), id_index: HashMap::new() })) }
    }

    /// Adds a workflow to the store.
    ///
    /// # Returns
    /// Returns the internal key for the new entry.
    pub fn add(&self, workflow: Workflow) -> WorkflowKey {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let id = workflow.id;
        let key = guard.slots.insert(Arc::new(RwLock::new(workflow)));
        guard.id_index.insert(id, key);
        key
    }

    pub fn get(&self, key: WorkflowKey) -> Option<Arc<RwLock<Workflow>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.slots.get(key).cloned()
    }

    pub fn get_by_id(&self, id: &Uuid) -> Option<Arc<RwLock<Workflow>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.id_index.get(id)?;
        guard.slots.get(*key).cloned()
    }

    /// Lookup through the coordinator's correlation key, for events that
    /// only carry the external workflow id.
    pub fn find_by_coordinator_id(&self, coordinator_id: &Uuid) -> Option<Arc<RwLock<Workflow>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .slots
            .values()
            .find(|handle| handle.read().expect("RwLock poisoned").coordinator_workflow_id.as_ref() == Some(coordinator_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("RwLock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}
