//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
        name: "run_history",
        sql: r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                dry_run INTEGER NOT NULL DEFAULT 0,
                state_persisted INTEGER NOT NULL DEFAULT 0,
                degraded INTEGER NOT NULL DEFAULT 0,
                signals_in INTEGER NOT NULL DEFAULT 0,
                signals_out INTEGER NOT NULL DEFAULT 0,
                alerts_emitted INTEGER NOT NULL DEFAULT 0,
                alerts_undelivered INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

            CREATE TABLE IF NOT EXISTS source_fetches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                source TEXT NOT NULL,
                ok INTEGER NOT NULL,
                records INTEGER NOT NULL,
                error TEXT,
                latency_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_source_fetches_run ON source_fetches(run_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                location_id TEXT NOT NULL,
                category TEXT NOT NULL,
                severity INTEGER NOT NULL,
                priority TEXT NOT NULL,
                escalated INTEGER NOT NULL DEFAULT 0,
                source_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                emitted_at TEXT NOT NULL,
                delivered INTEGER NOT NULL,
                deliveries TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_run ON alerts(run_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_location ON alerts(location_id, category);

            CREATE TABLE IF NOT EXISTS seen_signals (
                dedupe_key TEXT PRIMARY KEY,
                location_id TEXT NOT NULL,
                category TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                run_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_seen_signals_last_seen ON seen_signals(last_seen_at);
        "#,
    },
    Migration {
        version: 2,
        name: "alert_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS alert_state (
                location_id TEXT NOT NULL,
                category TEXT NOT NULL,
                phase TEXT NOT NULL,
                last_alert_at TEXT,
                last_severity INTEGER,
                cooldown_until TEXT,
                run_id TEXT NOT NULL,
                PRIMARY KEY (location_id, category)
            );

            CREATE TABLE IF NOT EXISTS alert_state_snapshots (
                run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                taken_at TEXT NOT NULL,
                state TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "surge_samples",
        sql: r#"
            CREATE TABLE IF NOT EXISTS surge_samples (
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                location_id TEXT NOT NULL,
                category TEXT NOT NULL,
                publishers INTEGER NOT NULL,
                taken_at TEXT NOT NULL,
                PRIMARY KEY (run_id, location_id, category)
            );
            CREATE INDEX IF NOT EXISTS idx_surge_samples_key
                ON surge_samples(location_id, category, taken_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(version = get_current_version(conn).await?, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
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

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "runs",
            "source_fetches",
            "alerts",
            "seen_signals",
            "alert_state",
            "alert_state_snapshots",
            "surge_samples",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "run_history");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "alert_state");

        let row3 = rows.next().await.unwrap().unwrap();
        assert_eq!(row3.get::<i64>(0).unwrap(), 3);
        assert_eq!(row3.get::<String>(1).unwrap(), "surge_samples");
    }
}
