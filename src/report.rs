use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{Group, GroupStudent};
use crate::runner::{Outcome, RunReport, SkipReason};

/// Number of groups whose filter counts each roll state, most common first.
pub fn summarize_by_state(groups: &[Group]) -> Vec<(String, usize)> {
    let mut map: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for group in groups {
        for state in group.filter.roll_states.iter() {
            *map.entry(state.to_string()).or_insert(0) += 1;
        }
    }

    let mut summaries: Vec<(String, usize)> = map.into_iter().collect();
    summaries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    summaries
}

pub fn build_report(generated_at: DateTime<Utc>, groups: &[(Group, Vec<GroupStudent>)]) -> String {
    let definitions: Vec<Group> = groups.iter().map(|(group, _)| group.clone()).collect();
    let summaries = summarize_by_state(&definitions);

    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Group Report");
    let _ = writeln!(output, "Generated at {}", generated_at.to_rfc3339());
    let _ = writeln!(output);
    let _ = writeln!(output, "## Tracked Roll States");

    if summaries.is_empty() {
        let _ = writeln!(output, "No groups defined.");
    } else {
        for (state, count) in summaries.iter() {
            let _ = writeln!(output, "- {}: {} group(s)", state, count);
        }
    }

    for (group, students) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", group.name);
        let _ = writeln!(output, "Filter: {}", group.filter);

        match group.run_at {
            Some(run_at) => {
                let _ = writeln!(
                    output,
                    "Last run {} with {} student(s)",
                    run_at.to_rfc3339(),
                    group.student_count
                );
            }
            None => {
                let _ = writeln!(output, "Never run.");
                continue;
            }
        }

        if students.is_empty() {
            let _ = writeln!(output, "No students matched.");
        } else {
            for student in students.iter() {
                let _ = writeln!(
                    output,
                    "- {} ({} incident(s))",
                    student.full_name, student.incident_count
                );
            }
        }
    }

    output
}

/// One line per group describing how the run left it.
pub fn summarize_run(report: &RunReport) -> String {
    let mut output = String::new();

    let _ = writeln!(
        output,
        "Group run as of {} ({} of {} groups materialized)",
        report.as_of.to_rfc3339(),
        report.materialized(),
        report.groups.len()
    );

    for group in &report.groups {
        let detail = match &group.outcome {
            Outcome::Materialized { student_count } => format!("{student_count} student(s)"),
            Outcome::Failed { error } => format!("failed: {error}"),
            Outcome::Skipped {
                reason: SkipReason::Cancelled,
            } => "skipped: run cancelled".to_string(),
            Outcome::Skipped {
                reason: SkipReason::EarlierFailure,
            } => "skipped: earlier group failed".to_string(),
        };
        let _ = writeln!(
            output,
            "- {} [{}] {}",
            group.group_name,
            group.state(),
            detail
        );
    }

    output
}
