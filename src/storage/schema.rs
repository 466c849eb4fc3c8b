//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::StorageError;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations. Safe to call on every process start.
pub fn migrate(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            script_name TEXT NOT NULL,
            environment TEXT,
            browser TEXT,
            headless INTEGER,
            viewport TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            notes TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            total_duration REAL,
            status TEXT NOT NULL DEFAULT 'running',
            total_steps INTEGER NOT NULL DEFAULT 0,
            failed_steps INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            step_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            duration REAL NOT NULL CHECK (duration >= 0),
            status TEXT NOT NULL,
            error_message TEXT,
            page_url TEXT,
            element_selector TEXT,
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE TABLE IF NOT EXISTS actions (
            id INTEGER PRIMARY KEY,
            step_id INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            duration REAL NOT NULL CHECK (duration >= 0),
            status TEXT NOT NULL,
            target TEXT,
            value TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            FOREIGN KEY (step_id) REFERENCES steps(id),
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE TABLE IF NOT EXISTS browser_metrics (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            page_url TEXT,
            navigation_time REAL,
            page_load_time REAL,
            dom_content_loaded_time REAL,
            network_requests INTEGER,
            failed_network_requests INTEGER,
            memory_usage_mb REAL,
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_script_started ON runs(script_name, started_at);
        CREATE INDEX IF NOT EXISTS idx_steps_run_order ON steps(run_id, step_order);
        CREATE INDEX IF NOT EXISTS idx_steps_name ON steps(name);
        CREATE INDEX IF NOT EXISTS idx_actions_step ON actions(step_id);
        CREATE INDEX IF NOT EXISTS idx_browser_metrics_run ON browser_metrics(run_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    // v2: free-form run labels
    let has_labels: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info('runs') WHERE name = 'labels_json'",
        [],
        |row| row.get(0),
    )?;

    if has_labels == 0 {
        conn.execute(
            "ALTER TABLE runs ADD COLUMN labels_json TEXT NOT NULL DEFAULT '{}'",
            [],
        )?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
