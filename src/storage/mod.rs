//! SQLite run store -- pool, schema, queries, summaries.

pub mod schema;
pub mod summary;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::runner::TestResult;

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {:?}", parent))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A stored run, blobs included.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub test_name: String,
    pub device_name: String,
    pub started_at: String,
    pub config_json: String,
    pub data_json: String,
    pub summary_json: String,
    pub created_at: String,
}

/// Listing row: everything but the config/data blobs.
#[derive(Debug, Serialize)]
pub struct RunListEntry {
    pub id: i64,
    pub test_name: String,
    pub device_name: String,
    pub started_at: String,
    pub summary_json: String,
    pub created_at: String,
}

/// Persistence for finished runs.
#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Serialize and store a finished run together with its computed
    /// summary.  Returns the new record id.
    pub fn save(&self, result: &TestResult) -> Result<i64> {
        let run_summary = summary::summarize(result);

        let config_json =
            serde_json::to_string(&result.config).context("failed to serialize config")?;
        let data_json =
            serde_json::to_string(&result.data_points).context("failed to serialize data points")?;
        let summary_json =
            serde_json::to_string(&run_summary).context("failed to serialize summary")?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (test_name, device_name, started_at, config_json, data_json, summary_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.config.test_name,
                result.config.device_name,
                result.start_time.to_rfc3339(),
                config_json,
                data_json,
                summary_json,
            ],
        )
        .context("failed to insert run")?;

        let id = conn.last_insert_rowid();
        info!(run_id = id, data_points = result.data_points.len(), "run stored");
        Ok(id)
    }

    /// Fetch one run with its blobs.
    pub fn get(&self, id: i64) -> Result<Option<RunRecord>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, test_name, device_name, started_at, config_json, data_json, summary_json, created_at
             FROM runs WHERE id = ?1",
            params![id],
            |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    test_name: row.get(1)?,
                    device_name: row.get(2)?,
                    started_at: row.get(3)?,
                    config_json: row.get(4)?,
                    data_json: row.get(5)?,
                    summary_json: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()
        .context("failed to fetch run")
    }

    /// All runs, newest first, without the heavy blobs.
    pub fn list(&self) -> Result<Vec<RunListEntry>> {
        self.query_entries(
            "SELECT id, test_name, device_name, started_at, summary_json, created_at
             FROM runs ORDER BY started_at DESC",
            params![],
        )
    }

    /// Runs for one device, newest first.
    pub fn list_by_device(&self, device_name: &str) -> Result<Vec<RunListEntry>> {
        self.query_entries(
            "SELECT id, test_name, device_name, started_at, summary_json, created_at
             FROM runs WHERE device_name = ?1 ORDER BY started_at DESC",
            params![device_name],
        )
    }

    /// Substring search across test and device names.
    pub fn search(&self, term: &str) -> Result<Vec<RunListEntry>> {
        let pattern = format!("%{}%", term);
        self.query_entries(
            "SELECT id, test_name, device_name, started_at, summary_json, created_at
             FROM runs WHERE test_name LIKE ?1 OR device_name LIKE ?1 ORDER BY started_at DESC",
            params![pattern],
        )
    }

    /// Delete one run; returns whether it existed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let affected = conn
            .execute("DELETE FROM runs WHERE id = ?1", params![id])
            .context("failed to delete run")?;
        Ok(affected > 0)
    }

    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RunListEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(RunListEntry {
                id: row.get(0)?,
                test_name: row.get(1)?,
                device_name: row.get(2)?,
                started_at: row.get(3)?,
                summary_json: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{DataPoint, Phase, TestConfig};
    use chrono::Utc;
    use std::collections::HashMap;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        (dir, RunStore::new(pool))
    }

    fn sample_result(test_name: &str, device_name: &str) -> TestResult {
        TestResult {
            config: TestConfig {
                duration_secs: 1.0,
                interval_secs: 1.0,
                pre_secs: 0.0,
                post_secs: 0.0,
                description: String::new(),
                test_name: test_name.to_string(),
                device_name: device_name.to_string(),
                load_enabled: false,
                load: Default::default(),
            },
            data_points: vec![DataPoint {
                timestamp: Utc::now(),
                power_mw: 5000.0,
                throughput_mbps: 0.0,
                throughput_by_interface: HashMap::new(),
                target_throughput_by_interface: HashMap::new(),
                phase: Phase::Load,
                events: Vec::new(),
            }],
            start_time: Utc::now(),
            end_time: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let (_dir, store) = store();
        let id = store.save(&sample_result("night-soak", "router-a")).unwrap();

        let record = store.get(id).unwrap().expect("record exists");
        assert_eq!(record.test_name, "night-soak");
        assert_eq!(record.device_name, "router-a");
        assert!(record.summary_json.contains("average_power_mw"));

        let points: Vec<DataPoint> = serde_json::from_str(&record.data_json).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.get(999).unwrap().is_none());
    }

    #[test]
    fn test_list_and_search() {
        let (_dir, store) = store();
        store.save(&sample_result("soak", "router-a")).unwrap();
        store.save(&sample_result("burst", "switch-b")).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.list_by_device("router-a").unwrap().len(), 1);

        let hits = store.search("switch").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].test_name, "burst");
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        let id = store.save(&sample_result("soak", "router-a")).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }
}
