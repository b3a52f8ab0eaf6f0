use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Group, GroupMembership, StudentMatch};
use crate::store::GroupStore;

pub fn membership_rows(group: &Group, matches: &[StudentMatch]) -> Vec<GroupMembership> {
    matches
        .iter()
        .map(|matched| GroupMembership {
            group_id: group.id,
            student_id: matched.student_id,
            incident_count: matched.incident_count,
        })
        .collect()
}

/// Replaces `group`'s membership with `matches` and stamps the run metadata.
///
/// The store applies the swap as a single unit, so a failure leaves the group's
/// previous membership and run metadata in place.
pub async fn materialize(
    store: &dyn GroupStore,
    group: &Group,
    matches: &[StudentMatch],
    as_of: DateTime<Utc>,
) -> Result<Group, StoreError> {
    let student_count = u32::try_from(matches.len()).map_err(|_| StoreError::CorruptRow {
        table: "groups",
        id: group.id,
        reason: format!("{} matched students overflows student_count", matches.len()),
    })?;

    let mut updated = group.clone();
    updated.run_at = Some(as_of);
    updated.student_count = student_count;

    let rows = membership_rows(group, matches);
    store.swap_membership(&updated, &rows).await
}
