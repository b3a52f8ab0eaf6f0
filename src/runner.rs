use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, StoreError};
use crate::materialize::materialize;
use crate::models::{Group, Student};
use crate::store::{AttendanceStore, GroupStore};
use crate::window::{self, Eligibility, Window};

/// Per-run lifecycle of a group. `Evaluating` never outlives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Stale,
    Evaluating,
    Materialized,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GroupState::Stale => "stale",
            GroupState::Evaluating => "evaluating",
            GroupState::Materialized => "materialized",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancelled,
    EarlierFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Materialized { student_count: u32 },
    Failed { error: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub group_id: Uuid,
    pub group_name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl GroupOutcome {
    /// State the group was left in when the run finished.
    pub fn state(&self) -> GroupState {
        match self.outcome {
            Outcome::Materialized { .. } => GroupState::Materialized,
            Outcome::Failed { .. } | Outcome::Skipped { .. } => GroupState::Stale,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub as_of: DateTime<Utc>,
    pub eligibility: Eligibility,
    pub groups: Vec<GroupOutcome>,
}

impl RunReport {
    fn new(as_of: DateTime<Utc>, eligibility: Eligibility) -> Self {
        Self {
            as_of,
            eligibility,
            groups: Vec::new(),
        }
    }

    fn record(&mut self, group: &Group, outcome: Outcome) {
        self.groups.push(GroupOutcome {
            group_id: group.id,
            group_name: group.name.clone(),
            outcome,
        });
    }

    /// Every group was materialized.
    pub fn is_success(&self) -> bool {
        self.groups
            .iter()
            .all(|group| group.state() == GroupState::Materialized)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GroupOutcome> {
        self.groups
            .iter()
            .filter(|group| matches!(group.outcome, Outcome::Failed { .. }))
    }

    pub fn materialized(&self) -> usize {
        self.groups
            .iter()
            .filter(|group| group.state() == GroupState::Materialized)
            .count()
    }
}

pub struct GroupRunner {
    attendance: Arc<dyn AttendanceStore>,
    groups: Arc<dyn GroupStore>,
    eligibility: Eligibility,
    active: Mutex<()>,
    interrupt: Arc<AtomicBool>,
}

impl GroupRunner {
    pub fn new(attendance: Arc<dyn AttendanceStore>, groups: Arc<dyn GroupStore>) -> Self {
        Self {
            attendance,
            groups,
            eligibility: Eligibility::default(),
            active: Mutex::new(()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    /// Flag that stops the current and any later run before its next group.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Recomputes every group as of the current instant.
    pub async fn run_now(&self) -> Result<RunReport, EngineError> {
        self.run_all(Utc::now()).await
    }

    /// Recomputes every group as of `as_of`.
    ///
    /// Returns `RunInProgress` without touching any membership if another run
    /// holds the lock. Per-group failures are reported in the returned report.
    pub async fn run_all(&self, as_of: DateTime<Utc>) -> Result<RunReport, EngineError> {
        let _active = self
            .active
            .try_lock()
            .map_err(|_| EngineError::RunInProgress)?;

        if !self.groups.try_acquire_run_lock().await? {
            return Err(EngineError::RunInProgress);
        }

        let result = self.run_locked(as_of).await;
        let released = self.groups.release_run_lock().await;

        match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "failed to release run lock after aborted run");
                Err(err)
            }
        }
    }

    async fn run_locked(&self, as_of: DateTime<Utc>) -> Result<RunReport, EngineError> {
        let groups = self.groups.list_groups().await?;
        let roster = match self.eligibility {
            Eligibility::Roster => Some(self.attendance.students().await?),
            Eligibility::Recorded => None,
        };

        info!(groups = groups.len(), %as_of, eligibility = ?self.eligibility, "starting group run");

        let mut report = RunReport::new(as_of, self.eligibility);
        let mut halted: Option<SkipReason> = None;

        for group in &groups {
            if halted.is_none() && self.interrupt.load(Ordering::SeqCst) {
                warn!(group = %group.name, "group run cancelled");
                halted = Some(SkipReason::Cancelled);
            }

            if let Some(reason) = halted {
                report.record(group, Outcome::Skipped { reason });
                continue;
            }

            match self.refresh_group(group, as_of, roster.as_deref()).await {
                Ok(updated) => {
                    info!(
                        group = %updated.name,
                        students = updated.student_count,
                        state = %GroupState::Materialized,
                        "group refreshed"
                    );
                    report.record(
                        group,
                        Outcome::Materialized {
                            student_count: updated.student_count,
                        },
                    );
                }
                Err(err) => {
                    warn!(
                        group = %group.name,
                        group_id = %group.id,
                        error = %err,
                        state = %GroupState::Stale,
                        "group refresh failed; stopping run"
                    );
                    report.record(
                        group,
                        Outcome::Failed {
                            error: err.to_string(),
                        },
                    );
                    halted = Some(SkipReason::EarlierFailure);
                }
            }
        }

        info!(
            materialized = report.materialized(),
            total = report.groups.len(),
            "group run finished"
        );
        Ok(report)
    }

    /// Evaluates one group completely before writing anything for it.
    async fn refresh_group(
        &self,
        group: &Group,
        as_of: DateTime<Utc>,
        roster: Option<&[Student]>,
    ) -> Result<Group, StoreError> {
        let window = Window::trailing(as_of, group.filter.number_of_weeks);
        debug!(
            group = %group.name,
            start = %window.start,
            end = %window.end,
            state = %GroupState::Evaluating,
            "evaluating group"
        );

        let sessions = self.attendance.rolls_completed_since(window.start).await?;
        let matches = window::evaluate(&group.filter, as_of, &sessions, roster);

        materialize(self.groups.as_ref(), group, &matches, as_of).await
    }
}
