//! SQLite store for insights and their issue links.
//!
//! Insights are upserted by id and returned in first-insertion order.
//! Issue links live in their own table so a stored insight is never rewritten
//! to record one.

use crate::database::{StoreLocation, lock_connection};
use crate::error::{EvalError, Result};
use crate::models::{Insight, InsightCategory, InsightType, Severity, now_timestamp, parse_timestamp};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

const RECENT_WINDOW_DAYS: i64 = 7;

const INSIGHT_COLUMNS: &str = "insight_id, insight_type, description, confidence, severity, category, \
     code_version, timestamp, metadata, linked_issues, linked_insights";

/// Aggregate view over every stored insight
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsSummary {
    pub total_insights: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub average_confidence: f64,
    /// Insights created within the last seven days
    pub recent_insights: usize,
}

struct InsightRow {
    insight_id: String,
    insight_type: String,
    description: String,
    confidence: f64,
    severity: String,
    category: String,
    code_version: String,
    timestamp: String,
    metadata: String,
    linked_issues: String,
    linked_insights: String,
}

impl InsightRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            insight_id: row.get(0)?,
            insight_type: row.get(1)?,
            description: row.get(2)?,
            confidence: row.get(3)?,
            severity: row.get(4)?,
            category: row.get(5)?,
            code_version: row.get(6)?,
            timestamp: row.get(7)?,
            metadata: row.get(8)?,
            linked_issues: row.get(9)?,
            linked_insights: row.get(10)?,
        })
    }

    fn decode(self, links: &HashMap<String, Vec<String>>) -> Result<Insight> {
        let id = self.insight_id.clone();
        let corrupt = |column: &str, detail: String| {
            EvalError::CorruptRecord(format!("insight {} column {}: {}", id, column, detail))
        };

        let insight_type: InsightType = self.insight_type.parse().map_err(|e| corrupt("insight_type", e))?;
        let severity: Severity = self.severity.parse().map_err(|e| corrupt("severity", e))?;
        let category: InsightCategory = self.category.parse().map_err(|e| corrupt("category", e))?;
        let metadata = serde_json::from_str(&self.metadata).map_err(|e| corrupt("metadata", e.to_string()))?;
        let mut linked_issues: Vec<String> =
            serde_json::from_str(&self.linked_issues).map_err(|e| corrupt("linked_issues", e.to_string()))?;
        let linked_insights =
            serde_json::from_str(&self.linked_insights).map_err(|e| corrupt("linked_insights", e.to_string()))?;

        for issue in links.get(&self.insight_id).into_iter().flatten() {
            if !linked_issues.contains(issue) {
                linked_issues.push(issue.clone());
            }
        }

        Ok(Insight {
            insight_id: self.insight_id,
            insight_type,
            description: self.description,
            confidence: self.confidence,
            severity,
            category,
            code_version: self.code_version,
            timestamp: self.timestamp,
            metadata,
            linked_issues,
            linked_insights,
        })
    }
}

/// Durable store of insights
pub struct InsightsDatabase {
    conn: Mutex<Connection>,
}

impl InsightsDatabase {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = location.open()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS insights (
                insight_id TEXT PRIMARY KEY,
                insight_type TEXT NOT NULL,
                description TEXT NOT NULL,
                confidence REAL NOT NULL,
                severity TEXT NOT NULL,
                category TEXT NOT NULL,
                code_version TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL,
                linked_issues TEXT NOT NULL,
                linked_insights TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_insights_type ON insights(insight_type);
            CREATE INDEX IF NOT EXISTS idx_insights_version ON insights(code_version);

            CREATE TABLE IF NOT EXISTS insight_issues (
                insight_id TEXT NOT NULL,
                issue_id TEXT NOT NULL,
                linked_at TEXT NOT NULL,
                PRIMARY KEY (insight_id, issue_id)
            );
            "#,
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreLocation::InMemory)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn, "insights store")
    }

    /// Insert or replace by `insight_id`. Re-storing keeps the original position.
    pub fn store_insight(&self, insight: &Insight) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO insights ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(insight_id) DO UPDATE SET
                    insight_type = excluded.insight_type,
                    description = excluded.description,
                    confidence = excluded.confidence,
                    severity = excluded.severity,
                    category = excluded.category,
                    code_version = excluded.code_version,
                    timestamp = excluded.timestamp,
                    metadata = excluded.metadata,
                    linked_issues = excluded.linked_issues,
                    linked_insights = excluded.linked_insights",
                INSIGHT_COLUMNS
            ),
            params![
                &insight.insight_id,
                insight.insight_type.as_str(),
                &insight.description,
                insight.confidence,
                insight.severity.as_str(),
                insight.category.as_str(),
                &insight.code_version,
                &insight.timestamp,
                serde_json::to_string(&insight.metadata)?,
                serde_json::to_string(&insight.linked_issues)?,
                serde_json::to_string(&insight.linked_insights)?,
            ],
        )?;
        Ok(())
    }

    fn load_links(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
        let mut stmt = conn.prepare("SELECT insight_id, issue_id FROM insight_issues ORDER BY rowid")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        for (insight_id, issue_id) in pairs {
            links.entry(insight_id).or_default().push(issue_id);
        }
        Ok(links)
    }

    fn query_insights(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Insight>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM insights {} ORDER BY rowid",
            INSIGHT_COLUMNS, filter
        ))?;
        let rows = stmt
            .query_map(params, InsightRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let links = Self::load_links(&conn)?;
        rows.into_iter().map(|row| row.decode(&links)).collect()
    }

    pub fn get_insight(&self, insight_id: &str) -> Result<Option<Insight>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM insights WHERE insight_id = ?1", INSIGHT_COLUMNS),
                params![insight_id],
                InsightRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => {
                let links = Self::load_links(&conn)?;
                Ok(Some(row.decode(&links)?))
            }
            None => Ok(None),
        }
    }

    pub fn get_all_insights(&self) -> Result<Vec<Insight>> {
        self.query_insights("", [])
    }

    pub fn get_insights_by_type(&self, insight_type: InsightType) -> Result<Vec<Insight>> {
        self.query_insights("WHERE insight_type = ?1", params![insight_type.as_str()])
    }

    pub fn get_insights_by_version(&self, code_version: &str) -> Result<Vec<Insight>> {
        self.query_insights("WHERE code_version = ?1", params![code_version])
    }

    pub fn get_insights_by_category(&self, category: InsightCategory) -> Result<Vec<Insight>> {
        self.query_insights("WHERE category = ?1", params![category.as_str()])
    }

    pub fn get_high_confidence_insights(&self, min_confidence: f64) -> Result<Vec<Insight>> {
        self.query_insights("WHERE confidence >= ?1", params![min_confidence])
    }

    /// Record that `issue_id` tracks `insight_id`. Linking twice is a no-op.
    pub fn link_issue(&self, insight_id: &str, issue_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO insight_issues (insight_id, issue_id, linked_at) VALUES (?1, ?2, ?3)",
            params![insight_id, issue_id, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn get_linked_issues(&self, insight_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT issue_id FROM insight_issues WHERE insight_id = ?1 ORDER BY rowid")?;
        let issues = stmt
            .query_map(params![insight_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(issues)
    }

    pub fn get_insights_summary(&self) -> Result<InsightsSummary> {
        self.get_insights_summary_at(Utc::now())
    }

    /// Summary with "recent" measured back from `now`
    pub fn get_insights_summary_at(&self, now: DateTime<Utc>) -> Result<InsightsSummary> {
        let conn = self.conn()?;

        let mut summary = InsightsSummary::default();
        let (total, average): (i64, Option<f64>) =
            conn.query_row("SELECT COUNT(*), AVG(confidence) FROM insights", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        summary.total_insights = total as usize;
        summary.average_confidence = average.unwrap_or(0.0);

        for (column, target) in [
            ("insight_type", &mut summary.by_type),
            ("severity", &mut summary.by_severity),
            ("category", &mut summary.by_category),
        ] {
            let mut stmt = conn.prepare(&format!(
                "SELECT {column}, COUNT(*) FROM insights GROUP BY {column} ORDER BY {column}"
            ))?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            target.extend(counts.into_iter().map(|(key, count)| (key, count as usize)));
        }

        let cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
        let mut stmt = conn.prepare("SELECT timestamp FROM insights")?;
        let timestamps = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        summary.recent_insights = timestamps
            .iter()
            .filter_map(|ts| parse_timestamp(ts))
            .filter(|at| *at >= cutoff && *at <= now)
            .count();

        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) fn sample_insight(id: &str, insight_type: InsightType, confidence: f64) -> Insight {
        let mut metadata = HashMap::new();
        metadata.insert("area".to_string(), json!("clarity"));
        Insight {
            insight_id: id.to_string(),
            insight_type,
            description: format!("{} insight", id),
            confidence,
            severity: Severity::Medium,
            category: InsightCategory::System,
            code_version: "1.0.0".to_string(),
            timestamp: "2026-03-10T12:00:00.000Z".to_string(),
            metadata,
            linked_issues: Vec::new(),
            linked_insights: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_by_type() {
        let db = InsightsDatabase::in_memory().unwrap();
        let insight = sample_insight("ins-1", InsightType::Regression, 0.85);
        db.store_insight(&insight).unwrap();

        let found = db.get_insights_by_type(InsightType::Regression).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].insight_id, insight.insight_id);
        assert_eq!(found[0].confidence, insight.confidence);
        assert_eq!(found[0].description, insight.description);
        assert_eq!(found[0], insight);
        assert!(db.get_insights_by_type(InsightType::Improvement).unwrap().is_empty());
    }

    #[test]
    fn test_restore_is_idempotent_and_keeps_position() {
        let db = InsightsDatabase::in_memory().unwrap();
        db.store_insight(&sample_insight("a", InsightType::Performance, 0.6)).unwrap();
        db.store_insight(&sample_insight("b", InsightType::Performance, 0.7)).unwrap();

        let mut updated = sample_insight("a", InsightType::Performance, 0.9);
        updated.description = "revised".to_string();
        db.store_insight(&updated).unwrap();
        db.store_insight(&updated).unwrap();

        let all = db.get_all_insights().unwrap();
        let ids: Vec<&str> = all.iter().map(|i| i.insight_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(all[0].description, "revised");
        assert_eq!(db.get_insights_summary().unwrap().total_insights, 2);
    }

    #[test]
    fn test_filters() {
        let db = InsightsDatabase::in_memory().unwrap();
        let mut old = sample_insight("old", InsightType::Accessibility, 0.4);
        old.code_version = "0.9.0".to_string();
        old.category = InsightCategory::Persona;
        db.store_insight(&old).unwrap();
        db.store_insight(&sample_insight("new", InsightType::Regression, 0.95)).unwrap();

        assert_eq!(db.get_insights_by_version("0.9.0").unwrap()[0].insight_id, "old");
        assert_eq!(db.get_insights_by_category(InsightCategory::Persona).unwrap().len(), 1);
        let confident = db.get_high_confidence_insights(0.8).unwrap();
        assert_eq!(confident.len(), 1);
        assert_eq!(confident[0].insight_id, "new");
        assert!(db.get_insight("missing").unwrap().is_none());
        assert_eq!(db.get_insight("old").unwrap().unwrap(), old);
    }

    #[test]
    fn test_summary_counts() {
        let db = InsightsDatabase::in_memory().unwrap();
        let mut stale = sample_insight("stale", InsightType::Performance, 0.5);
        stale.timestamp = "2026-01-01T00:00:00.000Z".to_string();
        stale.severity = Severity::Low;
        db.store_insight(&stale).unwrap();
        db.store_insight(&sample_insight("fresh-1", InsightType::Regression, 0.9)).unwrap();
        db.store_insight(&sample_insight("fresh-2", InsightType::Regression, 0.7)).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 12, 0, 0, 0).unwrap();
        let summary = db.get_insights_summary_at(now).unwrap();
        assert_eq!(summary.total_insights, 3);
        assert_eq!(summary.by_type["regression"], 2);
        assert_eq!(summary.by_type["performance"], 1);
        assert_eq!(summary.by_severity["medium"], 2);
        assert_eq!(summary.by_severity["low"], 1);
        assert_eq!(summary.by_category["system"], 3);
        assert!((summary.average_confidence - 0.7).abs() < 1e-9);
        assert_eq!(summary.recent_insights, 2);
    }

    #[test]
    fn test_empty_summary() {
        let db = InsightsDatabase::in_memory().unwrap();
        assert_eq!(db.get_insights_summary().unwrap(), InsightsSummary::default());
    }

    #[test]
    fn test_issue_links_do_not_rewrite_insight() {
        let db = InsightsDatabase::in_memory().unwrap();
        let insight = sample_insight("ins-1", InsightType::Regression, 0.9);
        db.store_insight(&insight).unwrap();

        db.link_issue("ins-1", "ISSUE-7").unwrap();
        db.link_issue("ins-1", "ISSUE-7").unwrap();

        assert_eq!(db.get_linked_issues("ins-1").unwrap(), vec!["ISSUE-7".to_string()]);
        let stored = db.get_insight("ins-1").unwrap().unwrap();
        assert_eq!(stored.linked_issues, vec!["ISSUE-7".to_string()]);
        assert_eq!(stored.description, insight.description);
    }

    #[test]
    fn test_corrupt_enum_is_reported() {
        let db = InsightsDatabase::in_memory().unwrap();
        db.store_insight(&sample_insight("x", InsightType::Performance, 0.5)).unwrap();
        db.conn()
            .unwrap()
            .execute("UPDATE insights SET severity = 'apocalyptic'", [])
            .unwrap();

        assert!(matches!(db.get_all_insights(), Err(EvalError::CorruptRecord(_))));
    }

    #[test]
    fn test_file_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let location = StoreLocation::Path(temp_dir.path().join("insights.db"));
        {
            let db = InsightsDatabase::open(&location).unwrap();
            db.store_insight(&sample_insight("kept", InsightType::Improvement, 0.8)).unwrap();
        }

        let reopened = InsightsDatabase::open(&location).unwrap();
        assert_eq!(reopened.get_all_insights().unwrap()[0].insight_id, "kept");
    }

    #[test]
    fn test_concurrent_upserts() {
        let db = Arc::new(InsightsDatabase::in_memory().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        db.store_insight(&sample_insight(&format!("ins-{}", i), InsightType::Performance, 0.5))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(db.get_insights_summary().unwrap().total_insights, 10);
    }
}
