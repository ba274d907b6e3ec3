//! Record DAO -- all reads and compare-and-swap mutations of tests and runs.
//!
//! Every versioned update is a single guarded UPDATE statement: the WHERE
//! clause carries the expected version (or the expected state transition) and
//! zero affected rows means the caller lost the race.

use crate::error::{AppError, AppResult};
use crate::model::{RunRecord, RunState, TestRecord};
use crate::props;
use crate::storage::Pool;
use rusqlite::{params, Row};

#[derive(Clone)]
pub struct Dao {
    pool: Pool,
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn test_from_row(row: &Row<'_>) -> rusqlite::Result<TestRecord> {
    Ok(TestRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        test_id: row.get(1)?,
        test: row.get(2)?,
        name: row.get(3)?,
        version: row.get(4)?,
        description: row.get(5)?,
        scheduled: row.get(6)?,
        started: row.get(7)?,
        stopped: row.get(8)?,
        completed: row.get(9)?,
        progress: row.get(10)?,
        results_success: row.get(11)?,
        results_fail: row.get(12)?,
        results_total: row.get(13)?,
    })
}

const RUN_COLUMNS: &str = "r.id, r.test_id, t.name, r.name, r.version, r.description, \
     r.scheduled, r.started, r.stopped, r.completed, r.progress, \
     r.results_success, r.results_fail, r.results_total";

impl Dao {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ----- tests ---------------------------------------------------------

    /// Create a test, optionally as a copy of an existing one. Copying
    /// duplicates all properties with fresh versions.
    pub fn create_test(
        &self,
        name: &str,
        description: Option<&str>,
        copy_of: Option<&str>,
        expected_version: Option<i64>,
    ) -> AppResult<TestRecord> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("test name must not be empty".into()));
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;

        let source = match copy_of {
            Some(src) => {
                let rec = tx
                    .query_row(
                        "SELECT id, name, version, description, created_at FROM tests WHERE name = ?1",
                        params![src],
                        test_from_row,
                    )
                    .map_err(|_| AppError::NotFound(format!("test '{}'", src)))?;
                if let Some(v) = expected_version {
                    if v != rec.version {
                        return Err(AppError::Conflict(format!(
                            "test '{}' is at version {}, not {}",
                            src, rec.version, v
                        )));
                    }
                }
                Some(rec)
            }
            None => None,
        };

        let description = description
            .map(str::to_string)
            .or_else(|| source.as_ref().and_then(|s| s.description.clone()));

        tx.execute(
            "INSERT INTO tests (name, description) VALUES (?1, ?2)",
            params![name, description],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                AppError::Conflict(format!("test '{}' already exists", name))
            } else {
                e.into()
            }
        })?;
        let test_id = tx.last_insert_rowid();

        match source {
            Some(src) => props::copy_test_properties(&tx, src.id, test_id)?,
            None => props::seed_test(&tx, test_id)?,
        }

        tx.commit().map_err(anyhow::Error::new)?;
        drop(conn);
        self.get_test(name)
    }

    pub fn get_test(&self, name: &str) -> AppResult<TestRecord> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, name, version, description, created_at FROM tests WHERE name = ?1",
            params![name],
            test_from_row,
        )
        .map_err(|_| AppError::NotFound(format!("test '{}'", name)))
    }

    /// Paged listing; zero matches is an empty vec, never an error.
    pub fn list_tests(&self, skip: i64, count: i64) -> AppResult<Vec<TestRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, version, description, created_at FROM tests
             ORDER BY name LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![count, skip], test_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Rename and/or re-describe a test; optimistic on the version.
    pub fn update_test(
        &self,
        old_name: &str,
        new_name: &str,
        description: Option<&str>,
        expected_version: i64,
    ) -> AppResult<TestRecord> {
        if new_name.trim().is_empty() {
            return Err(AppError::Validation("test name must not be empty".into()));
        }
        self.get_test(old_name)?;
        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE tests SET name = ?1, description = COALESCE(?2, description),
                     version = version + 1
                 WHERE name = ?3 AND version = ?4",
                params![new_name, description, old_name, expected_version],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    AppError::Conflict(format!("test '{}' already exists", new_name))
                } else {
                    AppError::from(e)
                }
            })?;
        if changed == 0 {
            return Err(AppError::Conflict(format!(
                "test '{}' was updated concurrently",
                old_name
            )));
        }
        drop(conn);
        self.get_test(new_name)
    }

    /// Delete a test and everything under it. Refused while any run is live.
    pub fn delete_test(&self, name: &str) -> AppResult<()> {
        let test = self.get_test(name)?;
        for run in self.list_runs(name, 0, i64::MAX, None)? {
            if run.state() == RunState::Started {
                return Err(AppError::Conflict(format!(
                    "test '{}' has an active run '{}'",
                    name, run.name
                )));
            }
        }
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM tests WHERE id = ?1", params![test.id])?;
        Ok(())
    }

    // ----- runs ----------------------------------------------------------

    /// Create a run under a test, optionally copying properties and
    /// description from a sibling run. A fresh run carries run-level
    /// properties defaulted from the test's current effective values.
    pub fn create_run(
        &self,
        test: &str,
        name: &str,
        description: Option<&str>,
        copy_of: Option<&str>,
        expected_version: Option<i64>,
    ) -> AppResult<RunRecord> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("run name must not be empty".into()));
        }
        let test_rec = self.get_test(test)?;
        let source = match copy_of {
            Some(src) => {
                let rec = self.get_run(test, src)?;
                if let Some(v) = expected_version {
                    if v != rec.version {
                        return Err(AppError::Conflict(format!(
                            "run '{}.{}' is at version {}, not {}",
                            test, src, rec.version, v
                        )));
                    }
                }
                Some(rec)
            }
            None => None,
        };
        let description = description
            .map(str::to_string)
            .or_else(|| source.as_ref().and_then(|s| s.description.clone()));

        let mut conn = self.pool.get()?;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;
        tx.execute(
            "INSERT INTO test_runs (test_id, name, description) VALUES (?1, ?2, ?3)",
            params![test_rec.id, name, description],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                AppError::Conflict(format!("run '{}.{}' already exists", test, name))
            } else {
                e.into()
            }
        })?;
        let run_id = tx.last_insert_rowid();

        match source {
            Some(src) => props::copy_run_properties(&tx, test_rec.id, src.id, run_id)?,
            None => props::seed_run(&tx, test_rec.id, run_id)?,
        }

        tx.commit().map_err(anyhow::Error::new)?;
        drop(conn);
        self.get_run(test, name)
    }

    pub fn get_run(&self, test: &str, run: &str) -> AppResult<RunRecord> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM test_runs r JOIN tests t ON t.id = r.test_id
                 WHERE t.name = ?1 AND r.name = ?2"
            ),
            params![test, run],
            run_from_row,
        )
        .map_err(|_| AppError::NotFound(format!("run '{}.{}'", test, run)))
    }

    pub fn get_run_by_id(&self, run_id: i64) -> AppResult<RunRecord> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM test_runs r JOIN tests t ON t.id = r.test_id
                 WHERE r.id = ?1"
            ),
            params![run_id],
            run_from_row,
        )
        .map_err(|_| AppError::NotFound(format!("run #{}", run_id)))
    }

    /// Paged listing of a test's runs, optionally filtered by derived state.
    pub fn list_runs(
        &self,
        test: &str,
        skip: i64,
        count: i64,
        state: Option<RunState>,
    ) -> AppResult<Vec<RunRecord>> {
        self.get_test(test)?;
        let filter = match state {
            None => "",
            Some(RunState::NotScheduled) => " AND r.scheduled = -1",
            Some(RunState::Scheduled) => {
                " AND r.scheduled != -1 AND r.started = -1 AND r.stopped = -1 AND r.completed = -1"
            }
            Some(RunState::Started) => {
                " AND r.started != -1 AND r.stopped = -1 AND r.completed = -1"
            }
            Some(RunState::Completed) => " AND r.completed != -1",
            Some(RunState::Stopped) => " AND r.stopped != -1",
        };
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM test_runs r JOIN tests t ON t.id = r.test_id
             WHERE t.name = ?1{filter} ORDER BY r.name LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![test, count, skip], run_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// All runs the monitor needs to look at: scheduled and not yet terminal.
    pub fn list_active_runs(&self) -> AppResult<Vec<RunRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM test_runs r JOIN tests t ON t.id = r.test_id
             WHERE r.scheduled != -1 AND r.stopped = -1 AND r.completed = -1
             ORDER BY r.scheduled"
        ))?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn update_run(
        &self,
        test: &str,
        old_name: &str,
        new_name: &str,
        description: Option<&str>,
        expected_version: i64,
    ) -> AppResult<RunRecord> {
        if new_name.trim().is_empty() {
            return Err(AppError::Validation("run name must not be empty".into()));
        }
        let rec = self.get_run(test, old_name)?;
        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE test_runs SET name = ?1, description = COALESCE(?2, description),
                     version = version + 1
                 WHERE id = ?3 AND version = ?4",
                params![new_name, description, rec.id, expected_version],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    AppError::Conflict(format!("run '{}.{}' already exists", test, new_name))
                } else {
                    AppError::from(e)
                }
            })?;
        if changed == 0 {
            return Err(AppError::Conflict(format!(
                "run '{}.{}' was updated concurrently",
                test, old_name
            )));
        }
        drop(conn);
        self.get_run(test, new_name)
    }

    /// Delete a run. Only permitted while the run is not live.
    pub fn delete_run(&self, test: &str, run: &str) -> AppResult<()> {
        let rec = self.get_run(test, run)?;
        if rec.state() == RunState::Started {
            return Err(AppError::Conflict(format!(
                "run '{}.{}' is active and cannot be deleted",
                test, run
            )));
        }
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM properties WHERE test_id = ?1 AND run_id = ?2",
            params![rec.test_id, rec.id],
        )?;
        conn.execute("DELETE FROM test_runs WHERE id = ?1", params![rec.id])?;
        Ok(())
    }

    /// Set (or move) the scheduled time. Optimistic on the run version and
    /// refused once the run has started.
    pub fn schedule_run(
        &self,
        test: &str,
        run: &str,
        scheduled: i64,
        expected_version: i64,
    ) -> AppResult<RunRecord> {
        if scheduled < 0 {
            return Err(AppError::Validation(
                "scheduled time must be a non-negative epoch-millisecond value".into(),
            ));
        }
        let rec = self.get_run(test, run)?;
        if !rec.state().is_editable() {
            return Err(AppError::Conflict(format!(
                "run '{}.{}' is {} and can no longer be scheduled",
                test,
                run,
                rec.state()
            )));
        }
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE test_runs SET scheduled = ?1, version = version + 1
             WHERE id = ?2 AND version = ?3
               AND started = -1 AND stopped = -1 AND completed = -1",
            params![scheduled, rec.id, expected_version],
        )?;
        if changed == 0 {
            return Err(AppError::Conflict(format!(
                "run '{}.{}' schedule update lost: expected version {}",
                test, run, expected_version
            )));
        }
        drop(conn);
        self.get_run(test, run)
    }

    // ----- monitor-owned state transitions -------------------------------
    //
    // These never take a version: they are guarded by the exact state
    // transition instead, so a stale caller can never rewrite a timestamp
    // retroactively.

    /// SCHEDULED -> STARTED. Returns false if the run was not in the
    /// expected state (someone else already transitioned it).
    pub fn mark_started(&self, run_id: i64, now: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE test_runs SET started = ?1
             WHERE id = ?2 AND scheduled != -1
               AND started = -1 AND stopped = -1 AND completed = -1",
            params![now, run_id],
        )?;
        Ok(changed == 1)
    }

    /// STARTED -> COMPLETED; progress pinned to exactly 1.0.
    pub fn mark_completed(&self, run_id: i64, now: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE test_runs SET completed = ?1, progress = 1.0
             WHERE id = ?2 AND started != -1 AND stopped = -1 AND completed = -1",
            params![now, run_id],
        )?;
        Ok(changed == 1)
    }

    /// STARTED -> STOPPED.
    pub fn mark_stopped(&self, run_id: i64, now: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE test_runs SET stopped = ?1
             WHERE id = ?2 AND started != -1 AND stopped = -1 AND completed = -1",
            params![now, run_id],
        )?;
        Ok(changed == 1)
    }

    /// Record one event outcome. Progress only ever moves forward, and
    /// outcomes arriving after the run left STARTED are discarded.
    pub fn record_event_result(
        &self,
        run_id: i64,
        success: bool,
        progress: f64,
    ) -> AppResult<()> {
        let (s, f) = if success { (1, 0) } else { (0, 1) };
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_runs SET
                 results_success = results_success + ?1,
                 results_fail = results_fail + ?2,
                 results_total = results_total + 1,
                 progress = MAX(progress, ?3)
             WHERE id = ?4 AND started != -1 AND stopped = -1 AND completed = -1",
            params![s, f, progress.clamp(0.0, 1.0), run_id],
        )?;
        Ok(())
    }
}
