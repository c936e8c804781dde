use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::resources::Resources;
use crate::domain::volunteer::{Volunteer, VolunteerStatus};

new_key_type! {
    pub struct VolunteerKey;
}

#[derive(Debug)]
struct StoreInner {
    slots: SlotMap<VolunteerKey, Arc<RwLock<Volunteer>>>,

    /// Index lookup by the coordinator's volunteer id, the upsert key.
    coordinator_index: HashMap<Uuid, VolunteerKey>,

    /// Keys in registration order; the scheduler's first-fit scan order.
    registration_order: Vec<VolunteerKey>,
}

#[derive(Debug, Clone)]
pub struct VolunteerStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl VolunteerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                slots: SlotMap::with_key(),
                coordinator_index: HashMap::new(),
                registration_order: Vec::new(),
            })),
        }
    }

    /// Creates or refreshes a volunteer from a roster entry. An existing
    /// volunteer keeps its registration slot; capacities are overwritten
    /// with the reported values and the status resets to available.
    pub fn upsert(&self, coordinator_id: Uuid, name: &str, capacity: Resources, now: DateTime<Utc>) -> Arc<RwLock<Volunteer>> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if let Some(key) = guard.coordinator_index.get(&coordinator_id).copied() {
            if let Some(handle) = guard.slots.get(key).cloned() {
                {
                    let mut volunteer = handle.write().expect("RwLock poisoned");
                    volunteer.name = name.to_string();
                    volunteer.capacity = capacity;
                    volunteer.status = VolunteerStatus::Available;
                }
                return handle;
            }
        }

        let volunteer = Volunteer::new(coordinator_id, name, capacity, now);
        let key = guard.slots.insert(Arc::new(RwLock::new(volunteer)));
        guard.coordinator_index.insert(coordinator_id, key);
        guard.registration_order.push(key);
        guard.slots.get(key).cloned().expect("just inserted")
    }

    pub fn get_by_coordinator_id(&self, coordinator_id: &Uuid) -> Option<Arc<RwLock<Volunteer>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.coordinator_index.get(coordinator_id)?;
        guard.slots.get(*key).cloned()
    }

    /// All volunteers, earliest registered first.
    pub fn in_registration_order(&self) -> Vec<Arc<RwLock<Volunteer>>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.registration_order.iter().filter_map(|key| guard.slots.get(*key).cloned()).collect()
    }

    /// The common denominator every task must fit: the minimum capacity
    /// across the whole pool.
    ///
    /// # Returns
    /// Returns `None` when no volunteer is known yet.
    pub fn min_capacity(&self) -> Option<Resources> {
        self.in_registration_order()
            .iter()
            .map(|handle| handle.read().expect("RwLock poisoned").capacity)
            .reduce(|acc, capacity| acc.min(&capacity))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("RwLock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VolunteerStore {
    fn default() -> Self {
        Self::new()
    }
}
