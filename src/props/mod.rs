//! Versioned property store -- per-test and per-run configuration with
//! optimistic concurrency and a lifecycle-gated editable window.
//!
//! Run-level properties are seeded from the owning test's effective values at
//! run creation time, and become permanently immutable the moment the run
//! starts. Masked properties never surface their raw value outside the
//! controller; callers see [`MASK`] instead.

use crate::error::{AppError, AppResult};
use crate::model::RunState;
use crate::storage::Pool;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

/// Sentinel surfaced in place of a masked value.
pub const MASK: &str = "******";

/// A built-in property definition seeded into every new test.
pub struct PropertyDef {
    pub key: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub default: &'static str,
    pub masked: bool,
}

/// Property catalog for the simulated workload.
pub const CATALOG: &[PropertyDef] = &[
    PropertyDef {
        key: "process.count",
        title: "Process Count",
        description: "Number of simulated events the run will execute.",
        default: "200",
        masked: false,
    },
    PropertyDef {
        key: "process.delay.ms",
        title: "Process Delay",
        description: "Millisecond stagger between simulated events.",
        default: "0",
        masked: false,
    },
    PropertyDef {
        key: "process.fail.ratio",
        title: "Failure Ratio",
        description: "Fraction of simulated events that report failure.",
        default: "0.0",
        masked: false,
    },
    PropertyDef {
        key: "datastore.host",
        title: "Datastore Host",
        description: "host:port of the datastore that receives run results.",
        default: "127.0.0.1:9301",
        masked: false,
    },
    PropertyDef {
        key: "datastore.password",
        title: "Datastore Password",
        description: "The password used when connecting to the run datastore.",
        default: "changeme",
        masked: true,
    },
];

/// Caller-facing view of one property. Masked values are already replaced.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyView {
    pub key: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub default: String,
    pub value: Option<String>,
    pub version: i64,
    pub masked: bool,
}

struct PropertyRow {
    key: String,
    title: Option<String>,
    description: Option<String>,
    default: String,
    value: Option<String>,
    version: i64,
    masked: bool,
}

impl PropertyRow {
    fn view(self) -> PropertyView {
        let (default, value) = if self.masked {
            (MASK.to_string(), self.value.map(|_| MASK.to_string()))
        } else {
            (self.default, self.value)
        };
        PropertyView {
            key: self.key,
            title: self.title,
            description: self.description,
            default,
            value,
            version: self.version,
            masked: self.masked,
        }
    }
}

fn prop_from_row(row: &Row<'_>) -> rusqlite::Result<PropertyRow> {
    Ok(PropertyRow {
        key: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        default: row.get(3)?,
        value: row.get(4)?,
        version: row.get(5)?,
        masked: row.get::<_, i64>(6)? != 0,
    })
}

const PROP_COLUMNS: &str = "key, title, description, default_value, value, version, masked";

// ----- seeding and copying, used inside the DAO's create transactions -----

/// Seed a fresh test with the built-in catalog.
pub fn seed_test(conn: &Connection, test_id: i64) -> AppResult<()> {
    for def in CATALOG {
        conn.execute(
            "INSERT INTO properties (test_id, run_id, key, title, description, default_value, masked)
             VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6)",
            params![test_id, def.key, def.title, def.description, def.default, def.masked as i64],
        )?;
    }
    Ok(())
}

/// Seed a fresh run: the test's current effective values become the run
/// defaults, versions start at zero.
pub fn seed_run(conn: &Connection, test_id: i64, run_id: i64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO properties (test_id, run_id, key, title, description, default_value, masked)
         SELECT test_id, ?1, key, title, description, COALESCE(value, default_value), masked
         FROM properties WHERE test_id = ?2 AND run_id = 0",
        params![run_id, test_id],
    )?;
    Ok(())
}

/// Duplicate all of a test's properties onto a copy, versions reset.
pub fn copy_test_properties(conn: &Connection, src_test: i64, dst_test: i64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO properties (test_id, run_id, key, title, description, default_value, value, masked)
         SELECT ?1, 0, key, title, description, default_value, value, masked
         FROM properties WHERE test_id = ?2 AND run_id = 0",
        params![dst_test, src_test],
    )?;
    Ok(())
}

/// Duplicate a sibling run's properties onto a new run, versions reset.
pub fn copy_run_properties(
    conn: &Connection,
    test_id: i64,
    src_run: i64,
    dst_run: i64,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO properties (test_id, run_id, key, title, description, default_value, value, masked)
         SELECT test_id, ?1, key, title, description, default_value, value, masked
         FROM properties WHERE test_id = ?2 AND run_id = ?3",
        params![dst_run, test_id, src_run],
    )?;
    Ok(())
}

// ----- the store ----------------------------------------------------------

#[derive(Clone)]
pub struct PropertyStore {
    pool: Pool,
}

impl PropertyStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Resolve (test_id, run_id) for an owner; run_id 0 means test-level.
    fn owner_ids(&self, test: &str, run: Option<&str>) -> AppResult<(i64, i64)> {
        let conn = self.pool.get()?;
        let test_id: i64 = conn
            .query_row("SELECT id FROM tests WHERE name = ?1", params![test], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("test '{}'", test)))?;
        let run_id = match run {
            None => 0,
            Some(r) => conn
                .query_row(
                    "SELECT id FROM test_runs WHERE test_id = ?1 AND name = ?2",
                    params![test_id, r],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| AppError::NotFound(format!("run '{}.{}'", test, r)))?,
        };
        Ok((test_id, run_id))
    }

    /// Derived state of the run owning a run-level property.
    fn run_state(&self, run_id: i64) -> AppResult<RunState> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT scheduled, started, stopped, completed FROM test_runs WHERE id = ?1",
            params![run_id],
            |row| {
                Ok(RunState::derive(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            },
        )
        .map_err(Into::into)
    }

    pub fn get(&self, test: &str, run: Option<&str>, key: &str) -> AppResult<PropertyView> {
        let (test_id, run_id) = self.owner_ids(test, run)?;
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {PROP_COLUMNS} FROM properties
                     WHERE test_id = ?1 AND run_id = ?2 AND key = ?3"
                ),
                params![test_id, run_id, key],
                prop_from_row,
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("property '{}'", key)))?;
        Ok(row.view())
    }

    pub fn list(&self, test: &str, run: Option<&str>) -> AppResult<Vec<PropertyView>> {
        let (test_id, run_id) = self.owner_ids(test, run)?;
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROP_COLUMNS} FROM properties
             WHERE test_id = ?1 AND run_id = ?2 ORDER BY key"
        ))?;
        let rows = stmt.query_map(params![test_id, run_id], prop_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.view());
        }
        Ok(out)
    }

    /// Set a property value. The caller must present the version it last
    /// observed; a mismatch is a conflict and mutates nothing. Run-level
    /// properties are immutable from the moment the run starts, permanently:
    /// the lifecycle gate sits inside the UPDATE's WHERE clause, so a run
    /// starting concurrently can never slip a mutation through.
    pub fn set(
        &self,
        test: &str,
        run: Option<&str>,
        key: &str,
        value: &str,
        expected_version: i64,
    ) -> AppResult<PropertyView> {
        let (test_id, run_id) = self.owner_ids(test, run)?;
        // Existence check first so a missing key is NotFound, not Conflict
        self.get(test, run, key)?;
        let conn = self.pool.get()?;
        let changed = if run_id == 0 {
            conn.execute(
                "UPDATE properties SET value = ?1, version = version + 1
                 WHERE test_id = ?2 AND run_id = 0 AND key = ?3 AND version = ?4",
                params![value, test_id, key, expected_version],
            )?
        } else {
            conn.execute(
                "UPDATE properties SET value = ?1, version = version + 1
                 WHERE test_id = ?2 AND run_id = ?3 AND key = ?4 AND version = ?5
                   AND EXISTS (SELECT 1 FROM test_runs
                               WHERE id = ?3 AND started = -1
                                 AND stopped = -1 AND completed = -1)",
                params![value, test_id, run_id, key, expected_version],
            )?
        };
        drop(conn);
        if changed == 0 {
            if run_id != 0 {
                let state = self.run_state(run_id)?;
                if !state.is_editable() {
                    return Err(AppError::Forbidden(format!(
                        "run '{}.{}' is {}: properties are locked",
                        test,
                        run.unwrap_or_default(),
                        state
                    )));
                }
            }
            return Err(AppError::Conflict(format!(
                "property '{}' was updated concurrently: expected version {}",
                key, expected_version
            )));
        }
        self.get(test, run, key)
    }

    /// Effective run configuration for the workload: value falling back to
    /// default, unmasked. Internal to the controller's trust boundary.
    pub fn resolved(&self, test_id: i64, run_id: i64) -> AppResult<HashMap<String, String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT key, COALESCE(value, default_value) FROM properties
             WHERE test_id = ?1 AND run_id = ?2",
        )?;
        let rows = stmt.query_map(params![test_id, run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for r in rows {
            let (k, v) = r?;
            out.insert(k, v);
        }
        Ok(out)
    }
}
