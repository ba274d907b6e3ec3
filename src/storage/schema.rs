//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tests (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            version INTEGER NOT NULL DEFAULT 0,
            description TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id INTEGER PRIMARY KEY,
            test_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            description TEXT,
            scheduled INTEGER NOT NULL DEFAULT -1,
            started INTEGER NOT NULL DEFAULT -1,
            stopped INTEGER NOT NULL DEFAULT -1,
            completed INTEGER NOT NULL DEFAULT -1,
            progress REAL NOT NULL DEFAULT 0.0,
            results_success INTEGER NOT NULL DEFAULT 0,
            results_fail INTEGER NOT NULL DEFAULT 0,
            results_total INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (test_id, name),
            FOREIGN KEY (test_id) REFERENCES tests(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS properties (
            id INTEGER PRIMARY KEY,
            test_id INTEGER NOT NULL,
            run_id INTEGER NOT NULL DEFAULT 0,
            key TEXT NOT NULL,
            title TEXT,
            description TEXT,
            default_value TEXT NOT NULL DEFAULT '',
            value TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            masked INTEGER NOT NULL DEFAULT 0,
            UNIQUE (test_id, run_id, key),
            FOREIGN KEY (test_id) REFERENCES tests(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_test_runs_active
            ON test_runs(stopped, completed, scheduled);
        CREATE INDEX IF NOT EXISTS idx_properties_owner
            ON properties(test_id, run_id);",
    )?;

    Ok(())
}
