use uuid::Uuid;

use crate::error::{EngineError, ValidationError};
use crate::filter::{parse_incidents, parse_weeks, GroupFilter};
use crate::models::{Group, GroupStudent};
use crate::store::GroupStore;

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub number_of_weeks: i64,
    pub roll_states: String,
    pub incidents: i64,
    pub comparator: String,
}

/// Fields to change on an existing group; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub number_of_weeks: Option<i64>,
    pub roll_states: Option<String>,
    pub incidents: Option<i64>,
    pub comparator: Option<String>,
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    Ok(name.to_string())
}

pub async fn create_group(store: &dyn GroupStore, input: NewGroup) -> Result<Group, EngineError> {
    let name = validate_name(&input.name)?;
    let filter = GroupFilter::parse(
        input.number_of_weeks,
        &input.roll_states,
        input.incidents,
        &input.comparator,
    )?;

    Ok(store.insert_group(&Group::new(name, filter)).await?)
}

pub async fn update_group(
    store: &dyn GroupStore,
    id: Uuid,
    patch: GroupPatch,
) -> Result<Group, EngineError> {
    let mut group = store
        .get_group(id)
        .await?
        .ok_or(EngineError::GroupNotFound(id))?;

    if let Some(name) = patch.name {
        group.name = validate_name(&name)?;
    }
    if let Some(weeks) = patch.number_of_weeks {
        group.filter.number_of_weeks = parse_weeks(weeks)?;
    }
    if let Some(states) = patch.roll_states {
        group.filter.roll_states = states.parse()?;
    }
    if let Some(incidents) = patch.incidents {
        group.filter.incidents = parse_incidents(incidents)?;
    }
    if let Some(comparator) = patch.comparator {
        group.filter.comparator = comparator.parse()?;
    }

    store
        .update_group(&group)
        .await?
        .ok_or(EngineError::GroupNotFound(id))
}

pub async fn delete_group(store: &dyn GroupStore, id: Uuid) -> Result<(), EngineError> {
    if store.delete_group(id).await? {
        Ok(())
    } else {
        Err(EngineError::GroupNotFound(id))
    }
}

pub async fn list_groups(store: &dyn GroupStore) -> Result<Vec<Group>, EngineError> {
    Ok(store.list_groups().await?)
}

pub async fn group_students(
    store: &dyn GroupStore,
    id: Uuid,
) -> Result<Vec<GroupStudent>, EngineError> {
    if store.get_group(id).await?.is_none() {
        return Err(EngineError::GroupNotFound(id));
    }
    Ok(store.group_students(id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Comparator, RollState};
    use crate::store::MemoryStore;

    fn chronic_absence() -> NewGroup {
        NewGroup {
            name: "Chronic absence".to_string(),
            number_of_weeks: 2,
            roll_states: "absent".to_string(),
            incidents: 3,
            comparator: ">".to_string(),
        }
    }

    #[tokio::test]
    async fn created_groups_start_stale() {
        let store = MemoryStore::new();

        let group = create_group(&store, chronic_absence()).await.unwrap();

        assert_eq!(group.run_at, None);
        assert_eq!(group.student_count, 0);
        assert_eq!(store.group(group.id), Some(group));
    }

    #[tokio::test]
    async fn invalid_filters_never_reach_the_store() {
        let store = MemoryStore::new();

        let bad_states = NewGroup {
            roll_states: "foo,bar".to_string(),
            ..chronic_absence()
        };
        let err = create_group(&store, bad_states).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownRollState(ref s)) if s == "foo"
        ));

        let bad_comparator = NewGroup {
            comparator: "=".to_string(),
            ..chronic_absence()
        };
        let err = create_group(&store, bad_comparator).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownComparator(_))
        ));

        let unnamed = NewGroup {
            name: "   ".to_string(),
            ..chronic_absence()
        };
        let err = create_group(&store, unnamed).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MissingField("name"))
        ));

        assert!(store.list_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_keeps_unspecified_fields() {
        let store = MemoryStore::new();
        let group = create_group(&store, chronic_absence()).await.unwrap();

        let patch = GroupPatch {
            roll_states: Some("absent,late".to_string()),
            comparator: Some("<".to_string()),
            ..GroupPatch::default()
        };
        let updated = update_group(&store, group.id, patch).await.unwrap();

        assert_eq!(updated.name, "Chronic absence");
        assert_eq!(updated.filter.number_of_weeks, 2);
        assert_eq!(updated.filter.incidents, 3);
        assert_eq!(updated.filter.comparator, Comparator::LessThan);
        assert!(updated.filter.roll_states.contains(RollState::Late));
    }

    #[tokio::test]
    async fn rejected_update_leaves_group_unchanged() {
        let store = MemoryStore::new();
        let group = create_group(&store, chronic_absence()).await.unwrap();

        let patch = GroupPatch {
            name: Some("Renamed".to_string()),
            number_of_weeks: Some(0),
            ..GroupPatch::default()
        };
        let err = update_group(&store, group.id, patch).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidWeeks(0))
        ));
        assert_eq!(store.group(group.id), Some(group));
    }

    #[tokio::test]
    async fn unknown_group_ids_are_reported() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            update_group(&store, id, GroupPatch::default()).await,
            Err(EngineError::GroupNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            delete_group(&store, id).await,
            Err(EngineError::GroupNotFound(_))
        ));
        assert!(matches!(
            group_students(&store, id).await,
            Err(EngineError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_group() {
        let store = MemoryStore::new();
        let group = create_group(&store, chronic_absence()).await.unwrap();

        delete_group(&store, group.id).await.unwrap();

        assert!(list_groups(&store).await.unwrap().is_empty());
    }
}
