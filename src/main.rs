use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod filter;
mod groups;
mod materialize;
mod models;
mod report;
mod runner;
mod store;
mod window;

use crate::db::PgStore;
use crate::groups::{GroupPatch, NewGroup};
use crate::runner::GroupRunner;
use crate::window::Eligibility;

#[derive(Parser)]
#[command(name = "attendance-groups")]
#[command(about = "Attendance incident groups recomputed from roll history", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample students, rolls and groups
    Seed,
    /// Import roll-state entries from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Manage group definitions
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },
    /// Recompute membership of every group now
    Run {
        /// Evaluate as of this RFC 3339 instant instead of now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
        /// Let students with no qualifying entries match `<` filters
        #[arg(long)]
        include_unrecorded: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report of groups and their members
    Report {
        #[arg(long, default_value = "groups.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Define a new group
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        weeks: i64,
        /// Comma-separated roll states: unmark, present, absent, late
        #[arg(long)]
        states: String,
        #[arg(long)]
        incidents: i64,
        /// `<` or `>`
        #[arg(long)]
        comparator: String,
    },
    /// Change fields of an existing group
    Update {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        weeks: Option<i64>,
        #[arg(long)]
        states: Option<String>,
        #[arg(long)]
        incidents: Option<i64>,
        #[arg(long)]
        comparator: Option<String>,
    },
    /// Delete a group and its membership
    Delete {
        #[arg(long)]
        id: Uuid,
    },
    /// List all groups
    List,
    /// List the students currently in a group
    Students {
        #[arg(long)]
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("attendance_groups=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = config::Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(store.pool(), &csv).await?;
            println!("Inserted {inserted} roll states from {}.", csv.display());
        }
        Commands::Group { action } => run_group_command(&store, action).await?,
        Commands::Run {
            as_of,
            include_unrecorded,
            json,
        } => {
            let eligibility = if include_unrecorded {
                Eligibility::Roster
            } else {
                settings.eligibility
            };
            let runner =
                GroupRunner::new(store.clone(), store.clone()).with_eligibility(eligibility);

            let interrupt = runner.interrupt_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current group");
                    interrupt.store(true, Ordering::SeqCst);
                }
            });

            let report = match as_of {
                Some(as_of) => runner.run_all(as_of).await?,
                None => runner.run_now().await?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report::summarize_run(&report));
            }

            if !report.is_success() {
                let failed: Vec<&str> = report
                    .failures()
                    .map(|group| group.group_name.as_str())
                    .collect();
                bail!(
                    "group run incomplete: {} of {} groups materialized (failed: {})",
                    report.materialized(),
                    report.groups.len(),
                    if failed.is_empty() { "none".to_string() } else { failed.join(", ") }
                );
            }
        }
        Commands::Report { out } => {
            let mut listed = Vec::new();
            for group in groups::list_groups(&*store).await? {
                let students = groups::group_students(&*store, group.id).await?;
                listed.push((group, students));
            }
            let report = report::build_report(Utc::now(), &listed);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn run_group_command(store: &PgStore, action: GroupCommand) -> anyhow::Result<()> {
    match action {
        GroupCommand::Create {
            name,
            weeks,
            states,
            incidents,
            comparator,
        } => {
            let group = groups::create_group(
                store,
                NewGroup {
                    name,
                    number_of_weeks: weeks,
                    roll_states: states,
                    incidents,
                    comparator,
                },
            )
            .await?;
            println!("Created group {} ({}).", group.name, group.id);
        }
        GroupCommand::Update {
            id,
            name,
            weeks,
            states,
            incidents,
            comparator,
        } => {
            let patch = GroupPatch {
                name,
                number_of_weeks: weeks,
                roll_states: states,
                incidents,
                comparator,
            };
            let group = groups::update_group(store, id, patch).await?;
            println!("Updated group {}: {}.", group.name, group.filter);
        }
        GroupCommand::Delete { id } => {
            groups::delete_group(store, id).await?;
            println!("Deleted group {id}.");
        }
        GroupCommand::List => {
            let groups = groups::list_groups(store).await?;
            if groups.is_empty() {
                println!("No groups defined.");
                return Ok(());
            }
            for group in groups {
                let last_run = group
                    .run_at
                    .map(|run_at| run_at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "- {} {} {} ({} students, last run {})",
                    group.id, group.name, group.filter, group.student_count, last_run
                );
            }
        }
        GroupCommand::Students { id } => {
            let students = groups::group_students(store, id).await?;
            if students.is_empty() {
                println!("No students in this group.");
                return Ok(());
            }
            for student in students {
                println!("- {} ({} incidents)", student.full_name, student.incident_count);
            }
        }
    }

    Ok(())
}
