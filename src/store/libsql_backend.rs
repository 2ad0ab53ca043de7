//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::delay::Delays;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{
    Attempt, Operand, Operator, Subtask, SubtaskStatus, Task, TaskId, TaskStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes
/// that span several statements run in a transaction under `write_lock`,
/// since one connection cannot nest transactions.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Open `path`, treating `:memory:` as an in-memory database.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        if path == ":memory:" {
            Self::new_memory().await
        } else {
            Self::new_local(Path::new(path)).await
        }
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_time(t: Option<DateTime<Utc>>) -> libsql::Value {
    match t {
        Some(t) => libsql::Value::Text(t.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_millis(d: Option<Duration>) -> libsql::Value {
    match d {
        Some(d) => libsql::Value::Integer(d.as_millis() as i64),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const TASK_COLUMNS: &str =
    "id, owner_id, expression, status, created_at, last_ping, result, error, root";

const SUBTASK_COLUMNS: &str = "task_id, id, operator, left_operand, right_operand, status, \
     assigned_worker_id, token, delay_ms, started_at, deadline, completed_at, result, error, attempts";

/// Map a row (TASK_COLUMNS order) to a task without subtasks.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id: i64 = row.get(0).map_err(get_err)?;
    let owner_id: String = row.get(1).map_err(get_err)?;
    let expression: String = row.get(2).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let created_str: String = row.get(4).map_err(get_err)?;
    let last_ping_str: String = row.get(5).map_err(get_err)?;
    let result: Option<f64> = row.get(6).ok();
    let error: Option<String> = row.get(7).ok();
    let root_str: String = row.get(8).map_err(get_err)?;

    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown task status {status_str:?}"))
    })?;

    Ok(Task {
        id: id as TaskId,
        owner_id,
        expression,
        status,
        created_at: parse_datetime(&created_str),
        last_ping: parse_datetime(&last_ping_str),
        result,
        error,
        root: from_json::<Operand>(&root_str)?,
        subtasks: Vec::new(),
    })
}

/// Map a row (SUBTASK_COLUMNS order) to `(task_id, subtask)`.
fn row_to_subtask(row: &libsql::Row) -> Result<(TaskId, Subtask), DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("subtask row parse: {e}"));

    let task_id: i64 = row.get(0).map_err(get_err)?;
    let id: i64 = row.get(1).map_err(get_err)?;
    let operator_str: String = row.get(2).map_err(get_err)?;
    let left_str: String = row.get(3).map_err(get_err)?;
    let right_str: String = row.get(4).map_err(get_err)?;
    let status_str: String = row.get(5).map_err(get_err)?;
    let assigned_worker_id: Option<String> = row.get(6).ok();
    let token: i64 = row.get(7).map_err(get_err)?;
    let delay_ms: Option<i64> = row.get(8).ok();
    let started_at: Option<String> = row.get(9).ok();
    let deadline: Option<String> = row.get(10).ok();
    let completed_at: Option<String> = row.get(11).ok();
    let result: Option<f64> = row.get(12).ok();
    let error: Option<String> = row.get(13).ok();
    let attempts_str: String = row.get(14).map_err(get_err)?;

    let operator: Operator = operator_str.parse().map_err(|op| {
        DatabaseError::Serialization(format!("unknown operator {op:?}"))
    })?;
    let status = SubtaskStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown subtask status {status_str:?}"))
    })?;

    let subtask = Subtask {
        id: id as u32,
        operator,
        left: from_json(&left_str)?,
        right: from_json(&right_str)?,
        status,
        assigned_worker_id,
        token: token as u32,
        delay: delay_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        started_at: parse_optional_datetime(started_at),
        deadline: parse_optional_datetime(deadline),
        completed_at: parse_optional_datetime(completed_at),
        result,
        error,
        attempts: from_json::<Vec<Attempt>>(&attempts_str)?,
        ready_seq: None,
    };
    Ok((task_id as TaskId, subtask))
}

/// Run `body` inside BEGIN/COMMIT, rolling back on failure.
macro_rules! in_transaction {
    ($conn:expr, $label:literal, $body:block) => {{
        $conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!(concat!($label, " begin: {}"), e)))?;
        let outcome: Result<(), DatabaseError> = async { $body }.await;
        match outcome {
            Ok(()) => {
                $conn
                    .execute("COMMIT", ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!(concat!($label, " commit: {}"), e)))?;
                Ok(())
            }
            Err(e) => {
                let _ = $conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }};
}

async fn write_subtask(
    conn: &Connection,
    sql: &str,
    task_id: TaskId,
    sub: &Subtask,
) -> Result<(), DatabaseError> {
    conn.execute(
        sql,
        params![
            task_id as i64,
            sub.id as i64,
            sub.operator.name(),
            to_json(&sub.left)?,
            to_json(&sub.right)?,
            sub.status.as_str(),
            opt_text(sub.assigned_worker_id.as_deref()),
            sub.token as i64,
            opt_millis(sub.delay),
            opt_time(sub.started_at),
            opt_time(sub.deadline),
            opt_time(sub.completed_at),
            opt_real(sub.result),
            opt_text(sub.error.as_deref()),
            to_json(&sub.attempts)?,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("write_subtask: {e}")))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();

        in_transaction!(conn, "insert_task", {
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    task.id as i64,
                    task.owner_id.as_str(),
                    task.expression.as_str(),
                    task.status.as_str(),
                    task.created_at.to_rfc3339(),
                    task.last_ping.to_rfc3339(),
                    opt_real(task.result),
                    opt_text(task.error.as_deref()),
                    to_json(&task.root)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

            let sql = format!(
                "INSERT INTO subtasks ({SUBTASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            );
            for sub in &task.subtasks {
                write_subtask(conn, &sql, task.id, sub).await?;
            }
            Ok(())
        })?;

        debug!(task_id = task.id, subtasks = task.subtasks.len(), "Task inserted into DB");
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();

        in_transaction!(conn, "update_task", {
            conn.execute(
                "UPDATE tasks SET status = ?1, last_ping = ?2, result = ?3, error = ?4 WHERE id = ?5",
                params![
                    task.status.as_str(),
                    task.last_ping.to_rfc3339(),
                    opt_real(task.result),
                    opt_text(task.error.as_deref()),
                    task.id as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

            let sql = format!(
                "INSERT OR REPLACE INTO subtasks ({SUBTASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            );
            for sub in &task.subtasks {
                write_subtask(conn, &sql, task.id, sub).await?;
            }
            Ok(())
        })
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        let mut task = match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_task: {e}"))),
        };

        let mut rows = conn
            .query(
                &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 ORDER BY id"),
                params![id as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task subtasks: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task subtasks: {e}")))?
        {
            let (_, sub) = row_to_subtask(&row)?;
            task.subtasks.push(sub);
        }
        Ok(Some(task))
    }

    async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn();

        let mut subtasks: HashMap<TaskId, Vec<Subtask>> = HashMap::new();
        let mut rows = conn
            .query(
                &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks ORDER BY task_id, id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks subtasks: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks subtasks: {e}")))?
        {
            let (task_id, sub) = row_to_subtask(&row)?;
            subtasks.entry(task_id).or_default().push(sub);
        }

        let mut tasks = Vec::new();
        let mut rows = conn
            .query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks: {e}")))?
        {
            let mut task = row_to_task(&row)?;
            task.subtasks = subtasks.remove(&task.id).unwrap_or_default();
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn max_task_id(&self) -> Result<TaskId, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COALESCE(MAX(id), 0) FROM tasks", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("max_task_id: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let max: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("max_task_id: {e}")))?;
                Ok(max.max(0) as TaskId)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("max_task_id: {e}"))),
        }
    }

    // ── Delays ──────────────────────────────────────────────────────

    async fn load_delays(&self) -> Result<Delays, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT operator, delay_ms FROM delays", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_delays: {e}")))?;

        let mut delays = Delays::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_delays: {e}")))?
        {
            let name: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("load_delays row parse: {e}")))?;
            let ms: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("load_delays row parse: {e}")))?;
            match name.parse::<Operator>() {
                Ok(op) => {
                    delays.insert(op, Duration::from_millis(ms.max(0) as u64));
                }
                Err(_) => debug!(operator = %name, "Skipping unknown stored operator"),
            }
        }
        Ok(delays)
    }

    async fn save_delays(&self, delays: &Delays) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        in_transaction!(conn, "save_delays", {
            for (op, delay) in delays {
                conn.execute(
                    "INSERT INTO delays (operator, delay_ms, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(operator) DO UPDATE SET delay_ms = excluded.delay_ms, updated_at = excluded.updated_at",
                    params![op.name(), delay.as_millis() as i64, now.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("save_delays: {e}")))?;
            }
            Ok(())
        })
    }
}
