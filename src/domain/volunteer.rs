use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolunteerStatus {
    Available,
    Busy,
}

impl VolunteerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolunteerStatus::Available => "available",
            VolunteerStatus::Busy => "busy",
        }
    }
}

/// A remote compute node offering capacity. Upserted from coordinator roster
/// pushes, keyed by the coordinator's volunteer id; `registered_at` fixes the
/// first-fit scan order.
#[derive(Debug, Clone)]
pub struct Volunteer {
    pub id: Uuid,
    pub coordinator_volunteer_id: Uuid,
    pub name: String,
    pub capacity: Resources,
    pub status: VolunteerStatus,
    pub registered_at: DateTime<Utc>,
}

impl Volunteer {
    pub fn new(coordinator_volunteer_id: Uuid, name: &str, capacity: Resources, registered_at: DateTime<Utc>) -> Self {
        Volunteer {
            id: Uuid::new_v4(),
            coordinator_volunteer_id,
            name: name.to_string(),
            capacity,
            status: VolunteerStatus::Available,
            registered_at,
        }
    }
}
