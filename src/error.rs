use thiserror::Error;
use uuid::Uuid;

/// A group definition was rejected before reaching the store or the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("roll states must name at least one of unmark, present, absent, late")]
    EmptyRollStates,

    #[error("unknown roll state `{0}` (expected unmark, present, absent or late)")]
    UnknownRollState(String),

    #[error("unknown comparator `{0}` (expected `<` or `>`)")]
    UnknownComparator(String),

    #[error("number of weeks must be between 1 and {max}, got {0}", max = crate::filter::MAX_WEEKS)]
    InvalidWeeks(i64),

    #[error("incident threshold must be between 0 and {max}, got {0}", max = crate::filter::MAX_INCIDENTS)]
    InvalidIncidents(i64),
}

/// A read or write against the attendance or group store failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("stored {table} row {id} is invalid: {reason}")]
    CorruptRow {
        table: &'static str,
        id: Uuid,
        reason: String,
    },

    #[error("group {0} no longer exists")]
    MissingGroup(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another run holds the run lock; membership is left untouched.
    #[error("a group run is already in progress")]
    RunInProgress,

    #[error("group {0} not found")]
    GroupNotFound(Uuid),
}
