use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::filter::GroupFilter;
use crate::models::{RollSession, Student, StudentMatch};

/// Which students are eligible to match a group at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// Only students with at least one qualifying entry in the window.
    #[default]
    Recorded,
    /// Every student on the roster, starting from an incident count of zero.
    Roster,
}

/// Trailing half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn trailing(as_of: DateTime<Utc>, number_of_weeks: u32) -> Self {
        let span = Duration::days(7 * i64::from(number_of_weeks));
        let start = as_of
            .checked_sub_signed(span)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end: as_of }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Counts qualifying entries per student within the window.
///
/// When a roster is supplied every rostered student starts at zero, so students
/// with no qualifying entries are still considered by the comparator.
pub fn count_incidents(
    filter: &GroupFilter,
    window: Window,
    sessions: &[RollSession],
    roster: Option<&[Student]>,
) -> BTreeMap<Uuid, u32> {
    let mut counts: BTreeMap<Uuid, u32> = BTreeMap::new();

    if let Some(students) = roster {
        for student in students {
            counts.insert(student.id, 0);
        }
    }

    for session in sessions {
        if !window.contains(session.roll.completed_at) {
            continue;
        }

        for entry in &session.entries {
            if filter.roll_states.contains(entry.state) {
                *counts.entry(entry.student_id).or_insert(0) += 1;
            }
        }
    }

    counts
}

/// Students matching `filter` as of `as_of`, ordered by student id.
pub fn evaluate(
    filter: &GroupFilter,
    as_of: DateTime<Utc>,
    sessions: &[RollSession],
    roster: Option<&[Student]>,
) -> Vec<StudentMatch> {
    let window = Window::trailing(as_of, filter.number_of_weeks);

    count_incidents(filter, window, sessions, roster)
        .into_iter()
        .filter(|(_, count)| filter.admits(*count))
        .map(|(student_id, incident_count)| StudentMatch {
            student_id,
            incident_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RollState;
    use crate::models::{Roll, RollStateEntry};
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 16, 9, 0, 0).unwrap()
    }

    fn session(completed_at: DateTime<Utc>, marks: &[(Uuid, RollState)]) -> RollSession {
        let roll_id = Uuid::new_v4();
        RollSession {
            roll: Roll {
                id: roll_id,
                completed_at,
            },
            entries: marks
                .iter()
                .map(|(student_id, state)| RollStateEntry {
                    roll_id,
                    student_id: *student_id,
                    state: *state,
                })
                .collect(),
        }
    }

    /// One roll per day going back from `as_of`, each marking `student` with `state`.
    fn daily_sessions(student: Uuid, state: RollState, days: i64) -> Vec<RollSession> {
        (1..=days)
            .map(|day| session(as_of() - Duration::days(day), &[(student, state)]))
            .collect()
    }

    fn absent_filter(comparator: &str) -> GroupFilter {
        GroupFilter::parse(2, "absent", 3, comparator).unwrap()
    }

    #[test]
    fn window_spans_whole_weeks() {
        let window = Window::trailing(as_of(), 2);
        assert_eq!(window.start, as_of() - Duration::days(14));
        assert_eq!(window.end, as_of());
    }

    #[test]
    fn greater_than_includes_counts_above_threshold() {
        let student = Uuid::new_v4();
        let sessions = daily_sessions(student, RollState::Absent, 4);

        let matches = evaluate(&absent_filter(">"), as_of(), &sessions, None);
        assert_eq!(
            matches,
            vec![StudentMatch {
                student_id: student,
                incident_count: 4
            }]
        );
    }

    #[test]
    fn greater_than_excludes_count_equal_to_threshold() {
        let student = Uuid::new_v4();
        let sessions = daily_sessions(student, RollState::Absent, 3);

        assert!(evaluate(&absent_filter(">"), as_of(), &sessions, None).is_empty());
    }

    #[test]
    fn less_than_includes_only_counts_below_threshold() {
        let two = Uuid::new_v4();
        let three = Uuid::new_v4();
        let mut sessions = daily_sessions(two, RollState::Absent, 2);
        sessions.extend(daily_sessions(three, RollState::Absent, 3));

        let matches = evaluate(&absent_filter("<"), as_of(), &sessions, None);
        assert_eq!(
            matches,
            vec![StudentMatch {
                student_id: two,
                incident_count: 2
            }]
        );
    }

    #[test]
    fn lower_bound_is_inclusive_and_upper_bound_exclusive() {
        let student = Uuid::new_v4();
        let filter = GroupFilter::parse(2, "absent", 0, ">").unwrap();
        let start = as_of() - Duration::days(14);

        let at_start = vec![session(start, &[(student, RollState::Absent)])];
        assert_eq!(evaluate(&filter, as_of(), &at_start, None).len(), 1);

        let before_start = vec![session(
            start - Duration::nanoseconds(1),
            &[(student, RollState::Absent)],
        )];
        assert!(evaluate(&filter, as_of(), &before_start, None).is_empty());

        let at_end = vec![session(as_of(), &[(student, RollState::Absent)])];
        assert!(evaluate(&filter, as_of(), &at_end, None).is_empty());
    }

    #[test]
    fn only_selected_states_are_counted() {
        let student = Uuid::new_v4();
        let mut sessions = daily_sessions(student, RollState::Late, 3);
        sessions.extend(daily_sessions(student, RollState::Present, 5));
        sessions.push(session(
            as_of() - Duration::hours(1),
            &[(student, RollState::Unmark)],
        ));

        let filter = GroupFilter::parse(1, "late,unmark", 0, ">").unwrap();
        let matches = evaluate(&filter, as_of(), &sessions, None);
        assert_eq!(matches[0].incident_count, 4);
    }

    #[test]
    fn entries_outside_window_are_ignored() {
        let student = Uuid::new_v4();
        let mut sessions = daily_sessions(student, RollState::Absent, 2);
        sessions.push(session(
            as_of() - Duration::days(30),
            &[(student, RollState::Absent)],
        ));

        let filter = GroupFilter::parse(2, "absent", 0, ">").unwrap();
        let matches = evaluate(&filter, as_of(), &sessions, None);
        assert_eq!(matches[0].incident_count, 2);
    }

    #[test]
    fn recorded_eligibility_skips_students_without_entries() {
        let quiet = Student {
            id: Uuid::new_v4(),
            first_name: "Noah".to_string(),
            last_name: "Kim".to_string(),
        };
        let filter = absent_filter("<");

        assert!(evaluate(&filter, as_of(), &[], None).is_empty());

        let matches = evaluate(&filter, as_of(), &[], Some(std::slice::from_ref(&quiet)));
        assert_eq!(
            matches,
            vec![StudentMatch {
                student_id: quiet.id,
                incident_count: 0
            }]
        );
    }

    #[test]
    fn roster_never_admits_zero_for_greater_than() {
        let student = Student {
            id: Uuid::new_v4(),
            first_name: "Avery".to_string(),
            last_name: "Lee".to_string(),
        };
        let filter = GroupFilter::parse(2, "absent", 0, ">").unwrap();

        assert!(evaluate(&filter, as_of(), &[], Some(std::slice::from_ref(&student))).is_empty());
    }

    #[test]
    fn every_state_is_countable() {
        let student = Uuid::new_v4();
        let sessions: Vec<RollSession> = RollState::ALL
            .iter()
            .enumerate()
            .map(|(offset, state)| {
                session(
                    as_of() - Duration::days(offset as i64 + 1),
                    &[(student, *state)],
                )
            })
            .collect();

        let filter = GroupFilter::parse(1, "unmark,present,absent,late", 3, ">").unwrap();
        assert_eq!(evaluate(&filter, as_of(), &sessions, None)[0].incident_count, 4);
    }
}
