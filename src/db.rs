use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::filter::{GroupFilter, RollState};
use crate::models::{
    Group, GroupMembership, GroupStudent, Roll, RollSession, RollStateEntry, Student,
};
use crate::store::{AttendanceStore, GroupStore};

/// Key for the session-level advisory lock that serializes group runs.
const RUN_LOCK_KEY: i64 = 0x4154_5447_5250;

const GROUP_COLUMNS: &str =
    "id, name, number_of_weeks, roll_states, incidents, ltmt, run_at, student_count";

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
    /// Connection holding the advisory lock while a run is active.
    run_lock: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            run_lock: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Postgres timestamps start at 4713 BC; earlier window starts match everything anyway.
fn clamp_to_postgres_range(since: DateTime<Utc>) -> DateTime<Utc> {
    match NaiveDate::from_ymd_opt(-4712, 1, 1) {
        Some(floor) => since.max(floor.and_time(NaiveTime::MIN).and_utc()),
        None => since,
    }
}

fn to_u32(table: &'static str, id: Uuid, column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::CorruptRow {
        table,
        id,
        reason: format!("{column} is negative ({value})"),
    })
}

fn to_i32(table: &'static str, id: Uuid, column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::CorruptRow {
        table,
        id,
        reason: format!("{column} {value} does not fit an INTEGER column"),
    })
}

fn group_from_row(row: &PgRow) -> Result<Group, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let number_of_weeks: i32 = row.try_get("number_of_weeks")?;
    let roll_states: String = row.try_get("roll_states")?;
    let incidents: i32 = row.try_get("incidents")?;
    let ltmt: String = row.try_get("ltmt")?;
    let student_count: i32 = row.try_get("student_count")?;

    let filter = GroupFilter::parse(
        i64::from(number_of_weeks),
        &roll_states,
        i64::from(incidents),
        &ltmt,
    )
    .map_err(|err| StoreError::CorruptRow {
        table: "groups",
        id,
        reason: err.to_string(),
    })?;

    Ok(Group {
        id,
        name: row.try_get("name")?,
        filter,
        run_at: row.try_get("run_at")?,
        student_count: to_u32("groups", id, "student_count", student_count)?,
    })
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn rolls_completed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RollSession>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id AS roll_id, r.completed_at, s.student_id, s.state
            FROM attendance_groups.rolls r
            JOIN attendance_groups.student_roll_states s ON s.roll_id = r.id
            WHERE r.completed_at >= $1
            ORDER BY r.completed_at, r.id
            "#,
        )
        .bind(clamp_to_postgres_range(since))
        .fetch_all(&self.pool)
        .await?;

        let mut sessions: Vec<RollSession> = Vec::new();

        for row in rows {
            let roll_id: Uuid = row.try_get("roll_id")?;
            let token: String = row.try_get("state")?;
            let state: RollState = token.parse().map_err(|_| StoreError::CorruptRow {
                table: "student_roll_states",
                id: roll_id,
                reason: format!("unknown state `{token}`"),
            })?;
            let entry = RollStateEntry {
                roll_id,
                student_id: row.try_get("student_id")?,
                state,
            };

            match sessions.last_mut() {
                Some(session) if session.roll.id == roll_id => session.entries.push(entry),
                _ => sessions.push(RollSession {
                    roll: Roll {
                        id: roll_id,
                        completed_at: row.try_get("completed_at")?,
                    },
                    entries: vec![entry],
                }),
            }
        }

        Ok(sessions)
    }

    async fn students(&self) -> Result<Vec<Student>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name FROM attendance_groups.students ORDER BY last_name, first_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            students.push(Student {
                id: row.try_get("id")?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
            });
        }
        Ok(students)
    }
}

#[async_trait]
impl GroupStore for PgStore {
    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM attendance_groups.groups ORDER BY name, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(group_from_row).collect()
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM attendance_groups.groups WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(group_from_row).transpose()
    }

    async fn insert_group(&self, group: &Group) -> Result<Group, StoreError> {
        let filter = &group.filter;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO attendance_groups.groups
            (id, name, number_of_weeks, roll_states, incidents, ltmt, run_at, student_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(group.id)
        .bind(&group.name)
        .bind(to_i32("groups", group.id, "number_of_weeks", filter.number_of_weeks)?)
        .bind(filter.roll_states.to_token_list())
        .bind(to_i32("groups", group.id, "incidents", filter.incidents)?)
        .bind(filter.comparator.symbol())
        .bind(group.run_at)
        .bind(to_i32("groups", group.id, "student_count", group.student_count)?)
        .fetch_one(&self.pool)
        .await?;

        group_from_row(&row)
    }

    async fn update_group(&self, group: &Group) -> Result<Option<Group>, StoreError> {
        let filter = &group.filter;
        let row = sqlx::query(&format!(
            r#"
            UPDATE attendance_groups.groups
            SET name = $2, number_of_weeks = $3, roll_states = $4, incidents = $5, ltmt = $6
            WHERE id = $1
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(group.id)
        .bind(&group.name)
        .bind(to_i32("groups", group.id, "number_of_weeks", filter.number_of_weeks)?)
        .bind(filter.roll_states.to_token_list())
        .bind(to_i32("groups", group.id, "incidents", filter.incidents)?)
        .bind(filter.comparator.symbol())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(group_from_row).transpose()
    }

    async fn delete_group(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM attendance_groups.groups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn group_students(&self, id: Uuid) -> Result<Vec<GroupStudent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.first_name, s.last_name,
                   s.first_name || ' ' || s.last_name AS full_name,
                   gs.incident_count
            FROM attendance_groups.group_students gs
            JOIN attendance_groups.students s ON s.id = gs.student_id
            WHERE gs.group_id = $1
            ORDER BY gs.incident_count DESC, full_name
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            let student_id: Uuid = row.try_get("id")?;
            let incident_count: i32 = row.try_get("incident_count")?;
            students.push(GroupStudent {
                id: student_id,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
                full_name: row.try_get("full_name")?,
                incident_count: to_u32(
                    "group_students",
                    student_id,
                    "incident_count",
                    incident_count,
                )?,
            });
        }
        Ok(students)
    }

    async fn swap_membership(
        &self,
        group: &Group,
        rows: &[GroupMembership],
    ) -> Result<Group, StoreError> {
        let student_ids: Vec<Uuid> = rows.iter().map(|row| row.student_id).collect();
        let incident_counts = rows
            .iter()
            .map(|row| {
                to_i32(
                    "group_students",
                    row.student_id,
                    "incident_count",
                    row.incident_count,
                )
            })
            .collect::<Result<Vec<i32>, _>>()?;

        // Dropping the transaction without commit rolls it back.
        let mut tx = self.pool.begin().await?;

        let saved = sqlx::query(&format!(
            r#"
            UPDATE attendance_groups.groups
            SET run_at = $2, student_count = $3
            WHERE id = $1
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(group.id)
        .bind(group.run_at)
        .bind(to_i32("groups", group.id, "student_count", group.student_count)?)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(saved) = saved else {
            return Err(StoreError::MissingGroup(group.id));
        };

        sqlx::query("DELETE FROM attendance_groups.group_students WHERE group_id = $1")
            .bind(group.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO attendance_groups.group_students (group_id, student_id, incident_count)
            SELECT $1, student_id, incident_count
            FROM UNNEST($2::uuid[], $3::int4[]) AS m(student_id, incident_count)
            "#,
        )
        .bind(group.id)
        .bind(&student_ids)
        .bind(&incident_counts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        group_from_row(&saved)
    }

    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError> {
        let mut held = self.run_lock.lock().await;
        if held.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release_run_lock(&self) -> Result<(), StoreError> {
        let Some(mut conn) = self.run_lock.lock().await.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::Unavailable(
                "run lock was not held by this session".to_string(),
            )),
            Err(err) => {
                // Closing the session drops the lock with it.
                let _ = conn.close().await;
                Err(err.into())
            }
        }
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery",
            "Lee",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules",
            "Moreno",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara",
            "Patel",
        ),
        (
            Uuid::parse_str("8b1e6c0e-5b7a-4f1d-9a53-2f4f0f6c1e77")?,
            "Noah",
            "Kim",
        ),
    ];

    for (id, first_name, last_name) in students {
        sqlx::query(
            r#"
            INSERT INTO attendance_groups.students (id, first_name, last_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (first_name, last_name) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .execute(pool)
        .await?;
    }

    // Ten daily rolls ending yesterday; states cycle per student.
    let patterns: [(&str, [RollState; 5]); 4] = [
        (
            "Lee",
            [
                RollState::Absent,
                RollState::Absent,
                RollState::Present,
                RollState::Absent,
                RollState::Late,
            ],
        ),
        (
            "Moreno",
            [
                RollState::Late,
                RollState::Present,
                RollState::Late,
                RollState::Present,
                RollState::Present,
            ],
        ),
        (
            "Patel",
            [
                RollState::Present,
                RollState::Present,
                RollState::Present,
                RollState::Present,
                RollState::Absent,
            ],
        ),
        (
            "Kim",
            [
                RollState::Present,
                RollState::Unmark,
                RollState::Present,
                RollState::Present,
                RollState::Present,
            ],
        ),
    ];

    let now = Utc::now();
    for day in 1..=10i64 {
        let roll_name = format!("seed-roll-{day:02}");
        sqlx::query(
            r#"
            INSERT INTO attendance_groups.rolls (id, name, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&roll_name)
        .bind(now - Duration::days(day))
        .execute(pool)
        .await?;

        let roll_id: Uuid = sqlx::query("SELECT id FROM attendance_groups.rolls WHERE name = $1")
            .bind(&roll_name)
            .fetch_one(pool)
            .await?
            .get("id");

        for (last_name, states) in patterns {
            let state = states[(day as usize) % states.len()];
            sqlx::query(
                r#"
                INSERT INTO attendance_groups.student_roll_states (id, roll_id, student_id, state)
                SELECT $1, $2, id, $4
                FROM attendance_groups.students WHERE last_name = $3
                ON CONFLICT (roll_id, student_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(roll_id)
            .bind(last_name)
            .bind(state.as_str())
            .execute(pool)
            .await?;
        }
    }

    let groups = vec![
        (
            Uuid::parse_str("5f0c3c1e-1d6e-4c38-9a0a-6b0d1f7a2c11")?,
            "Chronic absence",
            2,
            "absent",
            2,
            ">",
        ),
        (
            Uuid::parse_str("a8d2b6f4-3e1c-4b7a-8f5d-2c9e0a4b6d22")?,
            "Frequently late",
            4,
            "late",
            1,
            ">",
        ),
        (
            Uuid::parse_str("c4e6a8b0-7d2f-4e1a-b3c5-9f8e7d6c5b33")?,
            "Rarely missing",
            2,
            "absent,late,unmark",
            2,
            "<",
        ),
    ];

    for (id, name, weeks, roll_states, incidents, ltmt) in groups {
        // Seed definitions go through the same parser as user input.
        GroupFilter::parse(weeks, roll_states, incidents, ltmt)
            .with_context(|| format!("invalid seed group {name}"))?;

        sqlx::query(
            r#"
            INSERT INTO attendance_groups.groups
            (id, name, number_of_weeks, roll_states, incidents, ltmt)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(weeks as i32)
        .bind(roll_states)
        .bind(incidents as i32)
        .bind(ltmt)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Imports roll-state entries from CSV, creating students and rolls as needed.
///
/// Expected columns: `first_name,last_name,roll_name,completed_at,state`.
/// Returns the number of entries inserted; existing (roll, student) pairs are kept.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        first_name: String,
        last_name: String,
        roll_name: String,
        completed_at: DateTime<Utc>,
        state: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed CSV row on line {line}"))?;
        let state: RollState = row
            .state
            .parse()
            .with_context(|| format!("invalid roll state on line {line}"))?;

        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO attendance_groups.students (id, first_name, last_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (first_name, last_name) DO UPDATE
            SET first_name = EXCLUDED.first_name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.first_name)
        .bind(&row.last_name)
        .fetch_one(pool)
        .await?
        .get("id");

        // Rolls are immutable once recorded, so an existing roll keeps its timestamp.
        let roll_id: Uuid = sqlx::query(
            r#"
            INSERT INTO attendance_groups.rolls (id, name, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.roll_name)
        .bind(row.completed_at)
        .fetch_one(pool)
        .await?
        .get("id");

        let result = sqlx::query(
            r#"
            INSERT INTO attendance_groups.student_roll_states (id, roll_id, student_id, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (roll_id, student_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(roll_id)
        .bind(student_id)
        .bind(state.as_str())
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
