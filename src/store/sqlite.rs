//! SQLite-based progress store.
//!
//! Every change set runs inside one `BEGIN IMMEDIATE` transaction. Versioned
//! updates use `WHERE version = ?` guards, and the one-in-progress-task rule is
//! a partial unique index, so concurrent writers surface as
//! [`StoreError::Conflict`] instead of corrupting state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ChangeSet, ProgressStore, StoreError, Write};
use crate::cohort::CohortScheduleConfig;
use crate::curriculum::{CurriculumPosition, LineRange};
use crate::ids::{CohortId, LearnerId, SessionId, SubmissionId, TaskId};
use crate::notify::{Notification, OutboxEntry};
use crate::session::Session;
use crate::task::{Submission, Task, TaskStatus, VerificationPolicy};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS positions (
    learner_id TEXT NOT NULL,
    cohort_id TEXT NOT NULL,
    page INTEGER NOT NULL,
    line INTEGER NOT NULL,
    stage TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    version INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (learner_id, cohort_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    learner_id TEXT NOT NULL,
    cohort_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    page_ref INTEGER NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    focus_lines TEXT NOT NULL DEFAULT '[]',
    required_count INTEGER NOT NULL,
    current_count INTEGER NOT NULL DEFAULT 0,
    passed_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    remedial_of TEXT,
    remedial_task_id TEXT,
    cancel_reason TEXT,
    deadline TEXT,
    expected_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_in_progress
    ON tasks(learner_id, cohort_id) WHERE status = 'IN_PROGRESS';
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_learner ON tasks(learner_id, cohort_id, created_at);

CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    learner_id TEXT NOT NULL,
    cohort_id TEXT NOT NULL,
    slot INTEGER NOT NULL,
    item INTEGER NOT NULL,
    proof_kind TEXT NOT NULL,
    proof_ref TEXT NOT NULL,
    ai_score INTEGER,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    reviewed_at TEXT,
    reviewer_id TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    UNIQUE (task_id, slot),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status, cohort_id, created_at);

CREATE TABLE IF NOT EXISTS cohort_settings (
    cohort_id TEXT PRIMARY KEY NOT NULL,
    policy TEXT,
    schedule TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(id) WHERE delivered_at IS NULL;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    learner_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    turn INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active ON sessions(learner_id) WHERE active = 1;
"#;

const POSITION_COLUMNS: &str = "learner_id, cohort_id, page, line, stage, active, version, updated_at";

const TASK_COLUMNS: &str = "id, learner_id, cohort_id, stage, page_ref, line_start, line_end, \
     focus_lines, required_count, current_count, passed_count, status, remedial_of, \
     remedial_task_id, cancel_reason, deadline, expected_by, created_at, updated_at, version";

const SUBMISSION_COLUMNS: &str = "id, task_id, learner_id, cohort_id, slot, item, proof_kind, \
     proof_ref, ai_score, status, created_at, reviewed_at, reviewer_id, version";

const SESSION_COLUMNS: &str = "id, learner_id, kind, state, active, turn, created_at, updated_at";

pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressStore {
    /// Open (or create) `progress.db` under `data_dir`.
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create data dir: {}", e)))?;
        Self::open(database_path(&data_dir)).await
    }

    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(|e| {
                StoreError::Backend(format!("Failed to open SQLite database: {}", e))
            })?;

            conn.execute_batch(SCHEMA)
                .map_err(|e| StoreError::Backend(format!("Failed to run schema: {}", e)))?;

            Self::run_migrations(&conn)?;

            tracing::info!("Progress store opened at {}", db_path.display());
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bring databases created by older releases up to the current schema.
    /// CREATE TABLE IF NOT EXISTS doesn't add columns to existing tables.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        if !has_column(conn, "tasks", "expected_by")? {
            tracing::info!("Running migration: adding 'expected_by' column to tasks table");
            conn.execute_batch(
                "ALTER TABLE tasks ADD COLUMN expected_by TEXT NOT NULL DEFAULT '';
                 UPDATE tasks SET expected_by = COALESCE(deadline, updated_at) WHERE expected_by = '';",
            )
            .map_err(|e| StoreError::Backend(format!("Failed to add expected_by column: {}", e)))?;
        }

        if !has_column(conn, "tasks", "focus_lines")? {
            tracing::info!("Running migration: adding 'focus_lines' column to tasks table");
            conn.execute(
                "ALTER TABLE tasks ADD COLUMN focus_lines TEXT NOT NULL DEFAULT '[]'",
                [],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to add focus_lines column: {}", e)))?;
        }

        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(join_error)?
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    conn.prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
        .and_then(|mut stmt| stmt.exists(params![table, column]))
        .map_err(|e| StoreError::Backend(format!("Failed to query table info: {}", e)))
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Backend(format!("Task join error: {}", e))
}

/// Constraint violations and lock contention are retryable conflicts.
fn sql_error(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        match failure.code {
            ErrorCode::ConstraintViolation
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked => return StoreError::Conflict(e.to_string()),
            _ => {}
        }
    }
    StoreError::Backend(e.to_string())
}

fn json_error(e: serde_json::Error) -> StoreError {
    StoreError::Backend(format!("Invalid JSON column: {}", e))
}

fn time_string(time: DateTime<Utc>) -> String {
    time.to_rfc3339()
}

fn conversion_error<E>(e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_col<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(conversion_error)
}

fn parse_opt_col<T>(row: &Row, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| s.parse().map_err(conversion_error)).transpose()
}

fn time_col(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(conversion_error)
}

fn opt_time_col(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(conversion_error)
    })
    .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(conversion_error)
}

fn position_from_row(row: &Row) -> rusqlite::Result<CurriculumPosition> {
    let version: i64 = row.get("version")?;
    Ok(CurriculumPosition {
        learner_id: parse_col(row, "learner_id")?,
        cohort_id: parse_col(row, "cohort_id")?,
        page: row.get("page")?,
        line: row.get("line")?,
        stage: parse_col(row, "stage")?,
        active: row.get("active")?,
        version: version as u64,
        updated_at: time_col(row, "updated_at")?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let version: i64 = row.get("version")?;
    Ok(Task {
        id: parse_col(row, "id")?,
        learner_id: parse_col(row, "learner_id")?,
        cohort_id: parse_col(row, "cohort_id")?,
        stage: parse_col(row, "stage")?,
        page_ref: row.get("page_ref")?,
        line_range: LineRange {
            start: row.get("line_start")?,
            end: row.get("line_end")?,
        },
        focus_lines: json_col(row, "focus_lines")?,
        required_count: row.get("required_count")?,
        current_count: row.get("current_count")?,
        passed_count: row.get("passed_count")?,
        status: parse_col(row, "status")?,
        remedial_of: parse_opt_col(row, "remedial_of")?,
        remedial_task_id: parse_opt_col(row, "remedial_task_id")?,
        cancel_reason: row.get("cancel_reason")?,
        deadline: opt_time_col(row, "deadline")?,
        expected_by: time_col(row, "expected_by")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
        version: version as u64,
    })
}

fn submission_from_row(row: &Row) -> rusqlite::Result<Submission> {
    let version: i64 = row.get("version")?;
    Ok(Submission {
        id: parse_col(row, "id")?,
        task_id: parse_col(row, "task_id")?,
        learner_id: parse_col(row, "learner_id")?,
        cohort_id: parse_col(row, "cohort_id")?,
        slot: row.get("slot")?,
        item: row.get("item")?,
        proof_kind: parse_col(row, "proof_kind")?,
        proof_ref: row.get("proof_ref")?,
        ai_score: row.get("ai_score")?,
        status: parse_col(row, "status")?,
        created_at: time_col(row, "created_at")?,
        reviewed_at: opt_time_col(row, "reviewed_at")?,
        reviewer_id: row.get("reviewer_id")?,
        version: version as u64,
    })
}

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_col(row, "id")?,
        learner_id: parse_col(row, "learner_id")?,
        kind: parse_col(row, "kind")?,
        state: json_col(row, "state")?,
        active: row.get("active")?,
        turn: row.get("turn")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
    })
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(sql_error)?;
    let rows = stmt.query_map(params, map).map_err(sql_error)?;
    rows.collect::<rusqlite::Result<Vec<T>>>().map_err(sql_error)
}

fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Option<T>, StoreError> {
    conn.query_row(sql, params, map).optional().map_err(sql_error)
}

/// Distinguish a lost version race from a row that never existed.
fn guard_failed(conn: &Connection, table: &str, id: &str, what: &str) -> StoreError {
    let exists = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", table),
            params![id],
            |_| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => StoreError::Conflict(format!("{} {} was modified concurrently", what, id)),
        Ok(None) => StoreError::Missing(format!("{} {}", what, id)),
        Err(e) => sql_error(e),
    }
}

fn update_position(conn: &Connection, position: &CurriculumPosition) -> Result<(), StoreError> {
    let affected = conn
        .execute(
            "UPDATE positions
             SET page = ?3, line = ?4, stage = ?5, active = ?6, version = version + 1, updated_at = ?7
             WHERE learner_id = ?1 AND cohort_id = ?2 AND version = ?8",
            params![
                position.learner_id.to_string(),
                position.cohort_id.to_string(),
                position.page,
                position.line,
                position.stage.as_str(),
                position.active,
                time_string(Utc::now()),
                position.version as i64,
            ],
        )
        .map_err(sql_error)?;
    if affected == 1 {
        return Ok(());
    }
    let exists = conn
        .query_row(
            "SELECT 1 FROM positions WHERE learner_id = ?1 AND cohort_id = ?2",
            params![position.learner_id.to_string(), position.cohort_id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .map_err(sql_error)?;
    Err(match exists {
        Some(()) => StoreError::Conflict(format!(
            "position of learner {} was modified concurrently",
            position.learner_id
        )),
        None => StoreError::Missing(format!("enrollment of learner {}", position.learner_id)),
    })
}

fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let focus_lines = serde_json::to_string(&task.focus_lines).map_err(json_error)?;
    conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            TASK_COLUMNS
        ),
        params![
            task.id.to_string(),
            task.learner_id.to_string(),
            task.cohort_id.to_string(),
            task.stage.as_str(),
            task.page_ref,
            task.line_range.start,
            task.line_range.end,
            focus_lines,
            task.required_count,
            task.current_count,
            task.passed_count,
            task.status.as_str(),
            task.remedial_of.map(|id| id.to_string()),
            task.remedial_task_id.map(|id| id.to_string()),
            task.cancel_reason,
            task.deadline.map(time_string),
            time_string(task.expected_by),
            time_string(task.created_at),
            time_string(task.updated_at),
            task.version as i64,
        ],
    )
    .map_err(sql_error)?;
    Ok(())
}

fn update_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let affected = conn
        .execute(
            "UPDATE tasks
             SET current_count = ?2, passed_count = ?3, status = ?4, remedial_task_id = ?5,
                 cancel_reason = ?6, updated_at = ?7, version = version + 1
             WHERE id = ?1 AND version = ?8",
            params![
                task.id.to_string(),
                task.current_count,
                task.passed_count,
                task.status.as_str(),
                task.remedial_task_id.map(|id| id.to_string()),
                task.cancel_reason,
                time_string(task.updated_at),
                task.version as i64,
            ],
        )
        .map_err(sql_error)?;
    if affected == 1 {
        Ok(())
    } else {
        Err(guard_failed(conn, "tasks", &task.id.to_string(), "task"))
    }
}

fn insert_submission(conn: &Connection, sub: &Submission) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO submissions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            SUBMISSION_COLUMNS
        ),
        params![
            sub.id.to_string(),
            sub.task_id.to_string(),
            sub.learner_id.to_string(),
            sub.cohort_id.to_string(),
            sub.slot,
            sub.item,
            sub.proof_kind.as_str(),
            sub.proof_ref,
            sub.ai_score,
            sub.status.as_str(),
            time_string(sub.created_at),
            sub.reviewed_at.map(time_string),
            sub.reviewer_id,
            sub.version as i64,
        ],
    )
    .map_err(sql_error)?;
    Ok(())
}

fn update_submission(conn: &Connection, sub: &Submission) -> Result<(), StoreError> {
    let affected = conn
        .execute(
            "UPDATE submissions
             SET status = ?2, ai_score = ?3, reviewed_at = ?4, reviewer_id = ?5, version = version + 1
             WHERE id = ?1 AND version = ?6",
            params![
                sub.id.to_string(),
                sub.status.as_str(),
                sub.ai_score,
                sub.reviewed_at.map(time_string),
                sub.reviewer_id,
                sub.version as i64,
            ],
        )
        .map_err(sql_error)?;
    if affected == 1 {
        Ok(())
    } else {
        Err(guard_failed(conn, "submissions", &sub.id.to_string(), "submission"))
    }
}

fn insert_outbox(conn: &Connection, notification: &Notification) -> Result<(), StoreError> {
    let payload = serde_json::to_string(notification).map_err(json_error)?;
    conn.execute(
        "INSERT INTO outbox (payload, created_at) VALUES (?1, ?2)",
        params![payload, time_string(Utc::now())],
    )
    .map_err(sql_error)?;
    Ok(())
}

fn outbox_from_row(row: &Row) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.get("id")?,
        notification: json_col(row, "payload")?,
        created_at: time_col(row, "created_at")?,
    })
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get_position(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<CurriculumPosition>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM positions WHERE learner_id = ?1 AND cohort_id = ?2",
                    POSITION_COLUMNS
                ),
                params![learner_id.to_string(), cohort_id.to_string()],
                position_from_row,
            )
        })
        .await
    }

    async fn list_enrollments(
        &self,
        active_only: bool,
    ) -> Result<Vec<CurriculumPosition>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM positions WHERE (?1 = 0 OR active = 1)
                     ORDER BY learner_id, cohort_id",
                    POSITION_COLUMNS
                ),
                params![active_only],
                position_from_row,
            )
        })
        .await
    }

    async fn upsert_position(
        &self,
        position: &CurriculumPosition,
    ) -> Result<CurriculumPosition, StoreError> {
        let position = position.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO positions (learner_id, cohort_id, page, line, stage, active, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                 ON CONFLICT(learner_id, cohort_id) DO UPDATE SET
                    page = excluded.page,
                    line = excluded.line,
                    stage = excluded.stage,
                    active = excluded.active,
                    version = positions.version + 1,
                    updated_at = excluded.updated_at",
                params![
                    position.learner_id.to_string(),
                    position.cohort_id.to_string(),
                    position.page,
                    position.line,
                    position.stage.as_str(),
                    position.active,
                    time_string(Utc::now()),
                ],
            )
            .map_err(sql_error)?;
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM positions WHERE learner_id = ?1 AND cohort_id = ?2",
                    POSITION_COLUMNS
                ),
                params![position.learner_id.to_string(), position.cohort_id.to_string()],
                position_from_row,
            )?
            .ok_or_else(|| StoreError::Missing(format!("enrollment of learner {}", position.learner_id)))
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                task_from_row,
            )
        })
        .await
    }

    async fn find_in_progress_task(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM tasks
                     WHERE learner_id = ?1 AND cohort_id = ?2 AND status = 'IN_PROGRESS'",
                    TASK_COLUMNS
                ),
                params![learner_id.to_string(), cohort_id.to_string()],
                task_from_row,
            )
        })
        .await
    }

    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at, rowid",
                    TASK_COLUMNS
                ),
                params![status.as_str()],
                task_from_row,
            )
        })
        .await
    }

    async fn list_tasks_for_learner(
        &self,
        learner_id: LearnerId,
        cohort_id: CohortId,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM tasks WHERE learner_id = ?1 AND cohort_id = ?2
                     ORDER BY created_at, rowid",
                    TASK_COLUMNS
                ),
                params![learner_id.to_string(), cohort_id.to_string()],
                task_from_row,
            )
        })
        .await
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM submissions WHERE id = ?1", SUBMISSION_COLUMNS),
                params![id.to_string()],
                submission_from_row,
            )
        })
        .await
    }

    async fn list_submissions_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Submission>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM submissions WHERE task_id = ?1 ORDER BY slot",
                    SUBMISSION_COLUMNS
                ),
                params![task_id.to_string()],
                submission_from_row,
            )
        })
        .await
    }

    async fn list_pending_submissions(
        &self,
        cohort_id: Option<CohortId>,
    ) -> Result<Vec<Submission>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM submissions
                     WHERE status = 'PENDING' AND (?1 IS NULL OR cohort_id = ?1)
                     ORDER BY created_at, slot",
                    SUBMISSION_COLUMNS
                ),
                params![cohort_id.map(|c| c.to_string())],
                submission_from_row,
            )
        })
        .await
    }

    async fn get_policy(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<VerificationPolicy>, StoreError> {
        let raw: Option<Option<String>> = self
            .with_conn(move |conn| {
                query_one(
                    conn,
                    "SELECT policy FROM cohort_settings WHERE cohort_id = ?1",
                    params![cohort_id.to_string()],
                    |row| row.get(0),
                )
            })
            .await?;
        raw.flatten()
            .map(|json| serde_json::from_str(&json).map_err(json_error))
            .transpose()
    }

    async fn put_policy(
        &self,
        cohort_id: CohortId,
        policy: &VerificationPolicy,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(policy).map_err(json_error)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cohort_settings (cohort_id, policy, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cohort_id) DO UPDATE SET policy = excluded.policy, updated_at = excluded.updated_at",
                params![cohort_id.to_string(), json, time_string(Utc::now())],
            )
            .map_err(sql_error)?;
            Ok(())
        })
        .await
    }

    async fn get_schedule(
        &self,
        cohort_id: CohortId,
    ) -> Result<Option<CohortScheduleConfig>, StoreError> {
        let raw: Option<Option<String>> = self
            .with_conn(move |conn| {
                query_one(
                    conn,
                    "SELECT schedule FROM cohort_settings WHERE cohort_id = ?1",
                    params![cohort_id.to_string()],
                    |row| row.get(0),
                )
            })
            .await?;
        raw.flatten()
            .map(|json| serde_json::from_str(&json).map_err(json_error))
            .transpose()
    }

    async fn put_schedule(
        &self,
        cohort_id: CohortId,
        schedule: &CohortScheduleConfig,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(schedule).map_err(json_error)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cohort_settings (cohort_id, schedule, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cohort_id) DO UPDATE SET schedule = excluded.schedule, updated_at = excluded.updated_at",
                params![cohort_id.to_string(), json, time_string(Utc::now())],
            )
            .map_err(sql_error)?;
            Ok(())
        })
        .await
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let changes = changes.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;

            if let Some(position) = &changes.position {
                update_position(&tx, position)?;
            }
            for write in &changes.tasks {
                if let Write::Update(task) = write {
                    update_task(&tx, task)?;
                }
            }
            for write in &changes.tasks {
                if let Write::Insert(task) = write {
                    insert_task(&tx, task)?;
                }
            }
            for write in &changes.submissions {
                if let Write::Update(sub) = write {
                    update_submission(&tx, sub)?;
                }
            }
            for write in &changes.submissions {
                if let Write::Insert(sub) = write {
                    insert_submission(&tx, sub)?;
                }
            }
            for notification in &changes.outbox {
                insert_outbox(&tx, notification)?;
            }

            tx.commit().map_err(sql_error)
        })
        .await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(move |conn| {
            query_all(
                conn,
                "SELECT id, payload, created_at FROM outbox
                 WHERE delivered_at IS NULL ORDER BY id LIMIT ?1",
                params![limit as i64],
                outbox_from_row,
            )
        })
        .await
    }

    async fn mark_delivered(&self, ids: &[i64]) -> Result<(), StoreError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_error)?;
            let now = time_string(Utc::now());
            for id in ids {
                tx.execute(
                    "UPDATE outbox SET delivered_at = ?2 WHERE id = ?1 AND delivered_at IS NULL",
                    params![id, now],
                )
                .map_err(sql_error)?;
            }
            tx.commit().map_err(sql_error)
        })
        .await
    }

    async fn get_active_session(
        &self,
        learner_id: LearnerId,
    ) -> Result<Option<Session>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM sessions WHERE learner_id = ?1 AND active = 1",
                    SESSION_COLUMNS
                ),
                params![learner_id.to_string()],
                session_from_row,
            )
        })
        .await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.with_conn(move |conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id.to_string()],
                session_from_row,
            )
        })
        .await
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        let state = serde_json::to_string(&session.state).map_err(json_error)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    SESSION_COLUMNS
                ),
                params![
                    session.id.to_string(),
                    session.learner_id.to_string(),
                    session.kind.as_str(),
                    state,
                    session.active,
                    session.turn,
                    time_string(session.created_at),
                    time_string(session.updated_at),
                ],
            )
            .map_err(sql_error)?;
            Ok(())
        })
        .await
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        let state = serde_json::to_string(&session.state).map_err(json_error)?;
        self.with_conn(move |conn| {
            let affected = conn
                .execute(
                    "UPDATE sessions SET state = ?2, active = ?3, turn = ?4, updated_at = ?5 WHERE id = ?1",
                    params![
                        session.id.to_string(),
                        state,
                        session.active,
                        session.turn,
                        time_string(session.updated_at),
                    ],
                )
                .map_err(sql_error)?;
            if affected == 0 {
                return Err(StoreError::Missing(format!("session {}", session.id)));
            }
            Ok(())
        })
        .await
    }
}

/// Path of the database file a store created with [`SqliteProgressStore::new`] uses.
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("progress.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::Stage;
    use crate::session::SessionKind;
    use crate::task::{Decision, ProofKind, SubmissionStatus, VerificationMode};

    async fn open_store() -> (tempfile::TempDir, SqliteProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProgressStore::new(dir.path().to_path_buf()).await.unwrap();
        (dir, store)
    }

    async fn enrolled(store: &SqliteProgressStore) -> CurriculumPosition {
        let position =
            CurriculumPosition::new(LearnerId::new(), CohortId::new(), 4, 1, Stage::S1Learn)
                .unwrap();
        store.upsert_position(&position).await.unwrap()
    }

    fn in_progress_task(position: &CurriculumPosition) -> Task {
        let mut task = Task::for_position(position, &CohortScheduleConfig::default(), Utc::now());
        task.start(Utc::now()).unwrap();
        task
    }

    #[tokio::test]
    async fn task_and_submission_round_trip() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        let task = in_progress_task(&position);
        let sub = Submission::new(
            task.id(),
            position.learner_id,
            position.cohort_id,
            0,
            1,
            ProofKind::Audio,
            "voice-123",
            Some(91),
            Utc::now(),
        );
        let mut changes = ChangeSet::new();
        changes.insert_task(task.clone()).insert_submission(sub.clone());
        store.commit(&changes).await.unwrap();

        let loaded = store.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(loaded.required_count(), 7);
        assert_eq!(loaded.status(), TaskStatus::InProgress);
        assert_eq!(loaded.line_range(), task.line_range());
        assert_eq!(
            store
                .find_in_progress_task(position.learner_id, position.cohort_id)
                .await
                .unwrap()
                .map(|t| t.id()),
            Some(task.id())
        );

        let subs = store.list_submissions_for_task(task.id()).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].ai_score(), Some(91));
        assert_eq!(subs[0].proof_ref(), "voice-123");
        assert_eq!(
            store.list_pending_submissions(Some(position.cohort_id)).await.unwrap().len(),
            1
        );
        assert!(store
            .list_pending_submissions(Some(CohortId::new()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn versioned_update_detects_lost_race() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        let task = in_progress_task(&position);
        store.commit(ChangeSet::new().insert_task(task.clone())).await.unwrap();

        let mut winner = task.clone();
        winner.record_outcome(true, Utc::now()).unwrap();
        store.commit(ChangeSet::new().update_task(winner)).await.unwrap();

        let mut loser = task;
        loser.record_outcome(true, Utc::now()).unwrap();
        let err = store.commit(ChangeSet::new().update_task(loser)).await.unwrap_err();
        assert!(err.is_conflict());

        let mut ghost = in_progress_task(&position);
        ghost.status = TaskStatus::Cancelled;
        let err = store.commit(ChangeSet::new().update_task(ghost)).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[tokio::test]
    async fn partial_index_enforces_one_in_progress_task() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        store
            .commit(ChangeSet::new().insert_task(in_progress_task(&position)))
            .await
            .unwrap();
        let err = store
            .commit(ChangeSet::new().insert_task(in_progress_task(&position)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back_everything() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        let existing = in_progress_task(&position);
        store.commit(ChangeSet::new().insert_task(existing.clone())).await.unwrap();

        let mut changes = ChangeSet::new();
        changes
            .update_position(position.advanced())
            .insert_task(in_progress_task(&position));
        tokio_test::assert_err!(store.commit(&changes).await);

        let stored = store
            .get_position(position.learner_id, position.cohort_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.stage, Stage::S1Learn);
        assert_eq!(stored.version, position.version);
    }

    #[tokio::test]
    async fn duplicate_slot_is_a_conflict() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        let task = in_progress_task(&position);
        store.commit(ChangeSet::new().insert_task(task.clone())).await.unwrap();

        let make = || {
            Submission::new(
                task.id(),
                position.learner_id,
                position.cohort_id,
                0,
                1,
                ProofKind::Text,
                "a",
                None,
                Utc::now(),
            )
        };
        store.commit(ChangeSet::new().insert_submission(make())).await.unwrap();
        let err = store
            .commit(ChangeSet::new().insert_submission(make()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn submission_decision_persists() {
        let (_dir, store) = open_store().await;
        let position = enrolled(&store).await;
        let task = in_progress_task(&position);
        let sub = Submission::new(
            task.id(),
            position.learner_id,
            position.cohort_id,
            0,
            1,
            ProofKind::Video,
            "clip",
            Some(60),
            Utc::now(),
        );
        let mut changes = ChangeSet::new();
        changes.insert_task(task).insert_submission(sub.clone());
        store.commit(&changes).await.unwrap();

        let mut decided = sub;
        decided.decide(false, Some("ustadh-1"), Utc::now()).unwrap();
        store
            .commit(ChangeSet::new().update_submission(decided.clone()))
            .await
            .unwrap();

        let loaded = store.get_submission(decided.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), SubmissionStatus::Failed);
        assert_eq!(loaded.reviewer_id(), Some("ustadh-1"));
        assert_eq!(loaded.version(), 1);
        assert!(store.list_pending_submissions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbox_survives_reopen_and_is_marked_once() {
        let dir = tempfile::tempdir().unwrap();
        let notification = Notification {
            submission_id: SubmissionId::new(),
            learner_id: LearnerId::new(),
            cohort_id: CohortId::new(),
            task_id: TaskId::new(),
            decision: Decision::PendingHuman,
        };
        {
            let store = SqliteProgressStore::new(dir.path().to_path_buf()).await.unwrap();
            store
                .commit(ChangeSet::new().notify(notification.clone()))
                .await
                .unwrap();
        }
        assert!(database_path(dir.path()).exists());

        let store = SqliteProgressStore::new(dir.path().to_path_buf()).await.unwrap();
        let pending = store.pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].notification, notification);

        store.mark_delivered(&[pending[0].id]).await.unwrap();
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cohort_settings_are_independent_columns() {
        let (_dir, store) = open_store().await;
        let cohort = CohortId::new();
        assert!(store.get_policy(cohort).await.unwrap().is_none());

        let schedule = CohortScheduleConfig {
            repetition_count: 40,
            ..Default::default()
        };
        store.put_schedule(cohort, &schedule).await.unwrap();
        assert!(store.get_policy(cohort).await.unwrap().is_none());

        let policy = VerificationPolicy {
            mode: VerificationMode::SemiAuto,
            ..Default::default()
        };
        store.put_policy(cohort, &policy).await.unwrap();
        assert_eq!(store.get_policy(cohort).await.unwrap(), Some(policy));
        assert_eq!(store.get_schedule(cohort).await.unwrap(), Some(schedule));
    }

    #[tokio::test]
    async fn one_active_session_per_learner() {
        let (_dir, store) = open_store().await;
        let learner = LearnerId::new();
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            learner_id: learner,
            kind: SessionKind::Quiz,
            state: serde_json::json!({"q": 3}),
            active: true,
            turn: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_session(&session).await.unwrap();

        let second = Session {
            id: SessionId::new(),
            ..session.clone()
        };
        assert!(store.insert_session(&second).await.unwrap_err().is_conflict());

        let finished = Session {
            active: false,
            ..session.clone()
        };
        store.update_session(&finished).await.unwrap();
        store.insert_session(&second).await.unwrap();
        assert_eq!(
            store.get_active_session(learner).await.unwrap().map(|s| s.id),
            Some(second.id)
        );
    }
}
