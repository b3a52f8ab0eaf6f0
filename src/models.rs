use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::filter::{GroupFilter, RollState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub filter: GroupFilter,
    pub run_at: Option<DateTime<Utc>>,
    pub student_count: u32,
}

impl Group {
    /// A freshly defined group has never been run and owns no members.
    pub fn new(name: String, filter: GroupFilter) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            filter,
            run_at: None,
            student_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roll {
    pub id: Uuid,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollStateEntry {
    pub roll_id: Uuid,
    pub student_id: Uuid,
    pub state: RollState,
}

/// A completed roll together with every state recorded on it.
#[derive(Debug, Clone)]
pub struct RollSession {
    pub roll: Roll,
    pub entries: Vec<RollStateEntry>,
}

/// One student selected by a group filter, with the count that selected them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StudentMatch {
    pub student_id: Uuid,
    pub incident_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group_id: Uuid,
    pub student_id: Uuid,
    pub incident_count: u32,
}

/// A member of a group joined with the student's name, as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStudent {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub incident_count: u32,
}
