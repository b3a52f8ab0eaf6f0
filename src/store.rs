use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Group, GroupMembership, GroupStudent, RollSession, Student};

/// Read-only access to completed rolls and the student roster.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Rolls completed at or after `since`, each with its recorded states.
    async fn rolls_completed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RollSession>, StoreError>;

    async fn students(&self) -> Result<Vec<Student>, StoreError>;
}

/// Group definitions, their materialized membership and the run lock.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// All groups, ordered by name then id.
    async fn list_groups(&self) -> Result<Vec<Group>, StoreError>;

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, StoreError>;

    async fn insert_group(&self, group: &Group) -> Result<Group, StoreError>;

    /// Writes the group's name and filter. Run metadata is left as stored.
    async fn update_group(&self, group: &Group) -> Result<Option<Group>, StoreError>;

    /// Deletes the group and its membership. Returns `false` if it did not exist.
    async fn delete_group(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn group_students(&self, id: Uuid) -> Result<Vec<GroupStudent>, StoreError>;

    /// Replaces the group's membership with `rows` and saves its run metadata
    /// in one atomic unit. On error the previous membership is untouched.
    async fn swap_membership(
        &self,
        group: &Group,
        rows: &[GroupMembership],
    ) -> Result<Group, StoreError>;

    /// Returns `false` if another run already holds the lock.
    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError>;

    async fn release_run_lock(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
pub use memory::MemoryStore;
