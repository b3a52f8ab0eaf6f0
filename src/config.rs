use anyhow::{bail, Context};

use crate::window::Eligibility;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "ATTENDANCE_GROUPS_MAX_CONNECTIONS";
pub const INCLUDE_UNRECORDED: &str = "ATTENDANCE_GROUPS_INCLUDE_UNRECORDED";

/// A run pins one pooled connection for its advisory lock and needs another for its queries.
pub const MIN_CONNECTIONS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub max_connections: u32,
    pub eligibility: Eligibility,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup(DATABASE_URL)
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let max_connections = match lookup(MAX_CONNECTIONS) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|value| *value >= MIN_CONNECTIONS)
                .with_context(|| {
                    format!("{MAX_CONNECTIONS} must be at least {MIN_CONNECTIONS}, got `{raw}`")
                })?,
            None => 5,
        };

        let eligibility = match lookup(INCLUDE_UNRECORDED) {
            Some(raw) => match parse_flag(&raw) {
                Some(true) => Eligibility::Roster,
                Some(false) => Eligibility::Recorded,
                None => bail!("{INCLUDE_UNRECORDED} must be true or false, got `{raw}`"),
            },
            None => Eligibility::Recorded,
        };

        Ok(Self {
            database_url,
            max_connections,
            eligibility,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
