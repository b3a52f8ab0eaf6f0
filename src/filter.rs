use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollState {
    Unmark,
    Present,
    Absent,
    Late,
}

impl RollState {
    pub const ALL: [RollState; 4] = [
        RollState::Unmark,
        RollState::Present,
        RollState::Absent,
        RollState::Late,
    ];

    /// Token used in stored roll-state lists and roll-state rows.
    pub fn as_str(self) -> &'static str {
        match self {
            RollState::Unmark => "unmark",
            RollState::Present => "present",
            RollState::Absent => "absent",
            RollState::Late => "late",
        }
    }
}

impl fmt::Display for RollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollState {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let token = value.trim();
        if token == "unmarked" {
            return Ok(RollState::Unmark);
        }
        RollState::ALL
            .into_iter()
            .find(|state| state.as_str() == token)
            .ok_or_else(|| ValidationError::UnknownRollState(token.to_string()))
    }
}

/// Non-empty set of roll states a group counts as incidents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollStateSet(BTreeSet<RollState>);

impl RollStateSet {
    pub fn new(states: impl IntoIterator<Item = RollState>) -> Result<Self, ValidationError> {
        let states: BTreeSet<RollState> = states.into_iter().collect();
        if states.is_empty() {
            return Err(ValidationError::EmptyRollStates);
        }
        Ok(Self(states))
    }

    pub fn contains(&self, state: RollState) -> bool {
        self.0.contains(&state)
    }

    pub fn iter(&self) -> impl Iterator<Item = RollState> + '_ {
        self.0.iter().copied()
    }

    /// Comma-delimited form written to `groups.roll_states`.
    pub fn to_token_list(&self) -> String {
        self.iter()
            .map(RollState::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for RollStateSet {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyRollStates);
        }
        let states = raw
            .split(',')
            .map(str::parse::<RollState>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(states)
    }
}

impl fmt::Display for RollStateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token_list())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::LessThan => "<",
            Comparator::GreaterThan => ">",
        }
    }

    /// Whether `count` satisfies the comparator against `threshold`. Strict in both directions.
    pub fn holds(self, count: u32, threshold: u32) -> bool {
        match self {
            Comparator::LessThan => count < threshold,
            Comparator::GreaterThan => count > threshold,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparator {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "<" => Ok(Comparator::LessThan),
            ">" => Ok(Comparator::GreaterThan),
            other => Err(ValidationError::UnknownComparator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupFilter {
    pub number_of_weeks: u32,
    pub roll_states: RollStateSet,
    pub incidents: u32,
    pub comparator: Comparator,
}

impl GroupFilter {
    /// Parses raw filter fields, rejecting the first invalid one.
    pub fn parse(
        number_of_weeks: i64,
        roll_states: &str,
        incidents: i64,
        comparator: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            number_of_weeks: parse_weeks(number_of_weeks)?,
            roll_states: roll_states.parse()?,
            incidents: parse_incidents(incidents)?,
            comparator: comparator.parse()?,
        })
    }

    /// Whether an incident count places a student in the group.
    pub fn admits(&self, incident_count: u32) -> bool {
        self.comparator.holds(incident_count, self.incidents)
    }
}

impl fmt::Display for GroupFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} over {} week(s)",
            self.roll_states, self.comparator, self.incidents, self.number_of_weeks
        )
    }
}

/// Longest window a group may look back over (about a thousand years).
pub const MAX_WEEKS: u32 = 52_000;

/// Largest threshold that still fits the INTEGER `incidents` column.
pub const MAX_INCIDENTS: u32 = i32::MAX as u32;

pub fn parse_weeks(value: i64) -> Result<u32, ValidationError> {
    match u32::try_from(value) {
        Ok(weeks) if (1..=MAX_WEEKS).contains(&weeks) => Ok(weeks),
        _ => Err(ValidationError::InvalidWeeks(value)),
    }
}

pub fn parse_incidents(value: i64) -> Result<u32, ValidationError> {
    match u32::try_from(value) {
        Ok(incidents) if incidents <= MAX_INCIDENTS => Ok(incidents),
        _ => Err(ValidationError::InvalidIncidents(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roll_state_lists() {
        let states: RollStateSet = "absent, late".parse().unwrap();
        assert!(states.contains(RollState::Absent));
        assert!(states.contains(RollState::Late));
        assert!(!states.contains(RollState::Present));
        assert_eq!(states.to_token_list(), "absent,late");
    }

    #[test]
    fn unmarked_is_accepted_as_unmark() {
        let states: RollStateSet = "unmarked,unmark".parse().unwrap();
        assert_eq!(states.iter().collect::<Vec<_>>(), vec![RollState::Unmark]);
    }

    #[test]
    fn rejects_unknown_roll_states() {
        assert_eq!(
            "foo,bar".parse::<RollStateSet>(),
            Err(ValidationError::UnknownRollState("foo".to_string()))
        );
        assert_eq!(
            "absent,,late".parse::<RollStateSet>(),
            Err(ValidationError::UnknownRollState(String::new()))
        );
    }

    #[test]
    fn rejects_empty_roll_states() {
        assert_eq!("".parse::<RollStateSet>(), Err(ValidationError::EmptyRollStates));
        assert_eq!("  ".parse::<RollStateSet>(), Err(ValidationError::EmptyRollStates));
        assert_eq!(RollStateSet::new(Vec::new()), Err(ValidationError::EmptyRollStates));
    }

    #[test]
    fn comparator_accepts_only_two_symbols() {
        assert_eq!("<".parse::<Comparator>(), Ok(Comparator::LessThan));
        assert_eq!(">".parse::<Comparator>(), Ok(Comparator::GreaterThan));
        for bad in ["=", "<=", ">=", "", " <", "lt"] {
            assert_eq!(
                bad.parse::<Comparator>(),
                Err(ValidationError::UnknownComparator(bad.to_string()))
            );
        }
    }

    #[test]
    fn comparators_are_strict() {
        assert!(Comparator::GreaterThan.holds(4, 3));
        assert!(!Comparator::GreaterThan.holds(3, 3));
        assert!(Comparator::LessThan.holds(2, 3));
        assert!(!Comparator::LessThan.holds(3, 3));
    }

    #[test]
    fn group_filter_validates_every_field() {
        let filter = GroupFilter::parse(2, "absent", 3, ">").unwrap();
        assert_eq!(filter.number_of_weeks, 2);
        assert_eq!(filter.incidents, 3);
        assert_eq!(filter.comparator, Comparator::GreaterThan);

        assert_eq!(
            GroupFilter::parse(0, "absent", 3, ">"),
            Err(ValidationError::InvalidWeeks(0))
        );
        assert_eq!(
            GroupFilter::parse(2, "absent", -1, ">"),
            Err(ValidationError::InvalidIncidents(-1))
        );
        assert_eq!(
            GroupFilter::parse(2, "absent", 3, "="),
            Err(ValidationError::UnknownComparator("=".to_string()))
        );
    }

    #[test]
    fn bounds_fit_integer_columns_and_a_finite_window() {
        assert_eq!(parse_weeks(i64::from(MAX_WEEKS)), Ok(MAX_WEEKS));
        assert_eq!(
            parse_weeks(i64::from(MAX_WEEKS) + 1),
            Err(ValidationError::InvalidWeeks(i64::from(MAX_WEEKS) + 1))
        );
        assert_eq!(
            GroupFilter::parse(3_000_000_000, "absent", 1, ">"),
            Err(ValidationError::InvalidWeeks(3_000_000_000))
        );
        assert_eq!(
            GroupFilter::parse(1_000_000, "absent", 1, ">"),
            Err(ValidationError::InvalidWeeks(1_000_000))
        );

        assert_eq!(parse_incidents(i64::from(i32::MAX)), Ok(MAX_INCIDENTS));
        assert_eq!(
            GroupFilter::parse(2, "absent", 3_000_000_000, ">"),
            Err(ValidationError::InvalidIncidents(3_000_000_000))
        );
    }

    #[test]
    fn display_reads_like_a_rule() {
        let filter = GroupFilter::parse(4, "late,absent", 1, "<").unwrap();
        assert_eq!(filter.to_string(), "[absent,late] < 1 over 4 week(s)");
    }
}
