//! Schema migrations for the libSQL backend.
//!
//! Applied versions are recorded in `schema_history`. A step's DDL and its
//! history row commit together, so a failed step leaves the schema at the
//! previous version.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tasks_and_subtasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                expression TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                last_ping TEXT NOT NULL,
                result REAL,
                error TEXT,
                root TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS subtasks (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                id INTEGER NOT NULL,
                operator TEXT NOT NULL,
                left_operand TEXT NOT NULL,
                right_operand TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'blocked',
                assigned_worker_id TEXT,
                token INTEGER NOT NULL DEFAULT 0,
                delay_ms INTEGER,
                started_at TEXT,
                deadline TEXT,
                completed_at TEXT,
                result REAL,
                error TEXT,
                attempts TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (task_id, id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "operator_delays",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delays (
                operator TEXT PRIMARY KEY,
                delay_ms INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
];

/// Bring the schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let applied = apply(conn, MIGRATIONS).await?;
    let version = schema_version(conn).await?;
    tracing::debug!(version, applied, "Schema up to date");
    Ok(())
}

/// Apply every step of `steps` newer than the recorded version, each in
/// its own transaction. Returns how many ran.
async fn apply(conn: &Connection, steps: &[Migration]) -> Result<usize, DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_history (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_history: {e}")))?;

    let current = schema_version(conn).await?;
    let mut applied = 0;
    for step in steps.iter().filter(|m| m.version > current) {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        apply_step(conn, step).await.map_err(|e| {
            DatabaseError::Migration(format!("V{} ({}): {e}", step.version, step.name))
        })?;
        applied += 1;
    }
    Ok(applied)
}

async fn apply_step(conn: &Connection, step: &Migration) -> Result<(), libsql::Error> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    let outcome = async {
        conn.execute_batch(step.sql).await?;
        conn.execute(
            "INSERT INTO schema_history (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await?;
        Ok::<_, libsql::Error>(())
    }
    .await;

    match outcome {
        Ok(()) => {
            conn.execute("COMMIT", ()).await?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

/// Newest recorded version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = async {
        let mut rows = conn
            .query(
                "SELECT version FROM schema_history ORDER BY version DESC LIMIT 1",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => row.get::<i64>(0),
            None => Ok(0),
        }
    };
    read.await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[test]
    fn versions_strictly_increase() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(MIGRATIONS[0].version, 1);
    }

    #[tokio::test]
    async fn creates_every_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        for table in ["tasks", "subtasks", "delays", "schema_history"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn second_run_applies_nothing() {
        let conn = test_conn().await;
        assert_eq!(apply(&conn, MIGRATIONS).await.unwrap(), MIGRATIONS.len());
        assert_eq!(apply(&conn, MIGRATIONS).await.unwrap(), 0);
        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_step_leaves_no_trace() {
        let conn = test_conn().await;
        let steps = [
            Migration {
                version: 1,
                name: "good",
                sql: "CREATE TABLE good (id INTEGER);",
            },
            Migration {
                version: 2,
                name: "broken",
                sql: "CREATE TABLE half (id INTEGER); CREATE TABLE oops (;",
            },
        ];

        let err = apply(&conn, &steps).await.unwrap_err();
        assert!(err.to_string().contains("V2 (broken)"));
        assert_eq!(schema_version(&conn).await.unwrap(), 1);
        assert!(table_exists(&conn, "good").await);
        assert!(!table_exists(&conn, "half").await);
    }
}
