//! SQLite store for evaluation results and performance metrics.
//!
//! Schema:
//! - evaluation_results: one row per scored prompt, score maps and metadata as JSON
//! - performance_metrics: named metric samples tagged with code/model version
//! - alert_deliveries: last successful delivery time per alert key

use crate::error::{EvalError, Result};
use crate::models::{EvaluationResult, parse_timestamp};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Where a store keeps its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    Path(PathBuf),
}

impl StoreLocation {
    /// `:memory:` selects an in-memory store, anything else is a file path
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == ":memory:" {
            StoreLocation::InMemory
        } else {
            StoreLocation::Path(PathBuf::from(raw))
        }
    }

    pub(crate) fn open(&self) -> Result<Connection> {
        match self {
            StoreLocation::InMemory => Ok(Connection::open_in_memory()?),
            StoreLocation::Path(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(path)?;
                // Enable WAL mode for concurrent readers
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                Ok(conn)
            }
        }
    }
}

impl From<&Path> for StoreLocation {
    fn from(path: &Path) -> Self {
        StoreLocation::Path(path.to_path_buf())
    }
}

pub(crate) fn lock_connection<'a>(conn: &'a Mutex<Connection>, store: &str) -> Result<MutexGuard<'a, Connection>> {
    conn.lock()
        .map_err(|_| EvalError::StoreUnavailable(format!("{} lock poisoned", store)))
}

/// One stored metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric_name: String,
    pub value: f64,
    pub timestamp: String,
    pub code_version: String,
    pub model_version: String,
}

const RESULT_COLUMNS: &str = "scenario_name, persona_name, prompt, assistant_response, scores, \
     intermediate_scores, feedback, timestamp, code_version, model_version, metadata";

/// Raw column values of one result row, decoded outside the rusqlite closure
struct ResultRow {
    id: i64,
    scenario_name: String,
    persona_name: String,
    prompt: String,
    assistant_response: String,
    scores: String,
    intermediate_scores: String,
    feedback: String,
    timestamp: String,
    code_version: String,
    model_version: String,
    metadata: String,
}

impl ResultRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scenario_name: row.get(1)?,
            persona_name: row.get(2)?,
            prompt: row.get(3)?,
            assistant_response: row.get(4)?,
            scores: row.get(5)?,
            intermediate_scores: row.get(6)?,
            feedback: row.get(7)?,
            timestamp: row.get(8)?,
            code_version: row.get(9)?,
            model_version: row.get(10)?,
            metadata: row.get(11)?,
        })
    }

    fn decode(self) -> Result<EvaluationResult> {
        let corrupt = |column: &str, e: serde_json::Error| {
            EvalError::CorruptRecord(format!("evaluation_results row {} column {}: {}", self.id, column, e))
        };

        Ok(EvaluationResult {
            scores: serde_json::from_str(&self.scores).map_err(|e| corrupt("scores", e))?,
            intermediate_scores: serde_json::from_str(&self.intermediate_scores)
                .map_err(|e| corrupt("intermediate_scores", e))?,
            metadata: serde_json::from_str(&self.metadata).map_err(|e| corrupt("metadata", e))?,
            scenario_name: self.scenario_name,
            persona_name: self.persona_name,
            prompt: self.prompt,
            assistant_response: self.assistant_response,
            feedback: self.feedback,
            timestamp: self.timestamp,
            code_version: self.code_version,
            model_version: self.model_version,
        })
    }
}

/// Durable store of evaluation results
pub struct ResultsDatabase {
    conn: Mutex<Connection>,
}

impl ResultsDatabase {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = location.open()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS evaluation_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scenario_name TEXT NOT NULL,
                persona_name TEXT NOT NULL,
                prompt TEXT NOT NULL,
                assistant_response TEXT NOT NULL,
                scores TEXT NOT NULL,
                intermediate_scores TEXT NOT NULL,
                feedback TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                code_version TEXT NOT NULL,
                model_version TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_timestamp ON evaluation_results(timestamp);
            CREATE INDEX IF NOT EXISTS idx_results_scenario ON evaluation_results(scenario_name);

            CREATE TABLE IF NOT EXISTS performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                timestamp TEXT NOT NULL,
                code_version TEXT NOT NULL,
                model_version TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_name ON performance_metrics(metric_name, timestamp);
            "#,
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreLocation::InMemory)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn, "results store")
    }

    fn insert_result(conn: &Connection, result: &EvaluationResult) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO evaluation_results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                RESULT_COLUMNS
            ),
            params![
                &result.scenario_name,
                &result.persona_name,
                &result.prompt,
                &result.assistant_response,
                serde_json::to_string(&result.scores)?,
                serde_json::to_string(&result.intermediate_scores)?,
                &result.feedback,
                &result.timestamp,
                &result.code_version,
                &result.model_version,
                serde_json::to_string(&result.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Store several results in one transaction; either all land or none
    pub fn store_evaluation_results(&self, results: &[EvaluationResult]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for result in results {
            Self::insert_result(&tx, result)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn store_performance_metric(
        &self,
        metric_name: &str,
        value: f64,
        code_version: &str,
        model_version: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO performance_metrics (metric_name, value, timestamp, code_version, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![metric_name, value, crate::models::now_timestamp(), code_version, model_version],
        )?;
        Ok(())
    }

    /// Rows whose JSON columns do not decode are skipped with a warning
    fn query_results(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EvaluationResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, ResultRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.decode() {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable evaluation result");
                    None
                }
            })
            .collect())
    }

    /// Latest `limit` results, oldest first
    pub fn get_recent_results(&self, limit: usize) -> Result<Vec<EvaluationResult>> {
        let mut results = self.query_results(
            &format!(
                "SELECT id, {} FROM evaluation_results ORDER BY timestamp DESC, id DESC LIMIT ?1",
                RESULT_COLUMNS
            ),
            params![limit as i64],
        )?;
        results.reverse();
        Ok(results)
    }

    /// Latest `limit` results stored strictly before `timestamp`, oldest first
    pub fn get_results_before(&self, timestamp: &str, limit: usize) -> Result<Vec<EvaluationResult>> {
        let mut results = self.query_results(
            &format!(
                "SELECT id, {} FROM evaluation_results WHERE timestamp < ?1 \
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                RESULT_COLUMNS
            ),
            params![timestamp, limit as i64],
        )?;
        results.reverse();
        Ok(results)
    }

    pub fn get_results_by_scenario(&self, scenario_name: &str) -> Result<Vec<EvaluationResult>> {
        self.query_results(
            &format!(
                "SELECT id, {} FROM evaluation_results WHERE scenario_name = ?1 ORDER BY timestamp, id",
                RESULT_COLUMNS
            ),
            params![scenario_name],
        )
    }

    pub fn get_metric_history(&self, metric_name: &str) -> Result<Vec<MetricRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT metric_name, value, timestamp, code_version, model_version
             FROM performance_metrics WHERE metric_name = ?1 ORDER BY timestamp, id",
        )?;
        let records = stmt
            .query_map(params![metric_name], |row| {
                Ok(MetricRecord {
                    metric_name: row.get(0)?,
                    value: row.get(1)?,
                    timestamp: row.get(2)?,
                    code_version: row.get(3)?,
                    model_version: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_results(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM evaluation_results", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Last successful delivery per alert key. Lives beside the results so
/// separate runs against the same store share one debounce history.
pub struct DeliveryLog {
    conn: Mutex<Connection>,
}

impl DeliveryLog {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = location.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alert_deliveries (
                alert_key TEXT PRIMARY KEY,
                delivered_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreLocation::InMemory)
    }

    pub fn last_delivery(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = lock_connection(&self.conn, "delivery log")?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT delivered_at FROM alert_deliveries WHERE alert_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| EvalError::CorruptRecord(format!("alert_deliveries key {}: bad timestamp {}", key, raw))),
            None => Ok(None),
        }
    }

    pub fn record_delivery(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = lock_connection(&self.conn, "delivery log")?;
        conn.execute(
            "INSERT INTO alert_deliveries (alert_key, delivered_at) VALUES (?1, ?2)
             ON CONFLICT(alert_key) DO UPDATE SET delivered_at = excluded.delivered_at",
            params![key, at.to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?;
        Ok(())
    }
}
