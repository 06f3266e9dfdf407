use crate::config::{IssueTrackerConfig, TestingConfig};
use crate::database::StoreLocation;
use crate::error::Result as EvalResult;
use crate::insights_database::InsightsDatabase;
use crate::models::{
    Effort, Impact, Insight, InsightType, Priority, Recommendation, RecommendationCategory, Severity,
    TrendAnalysis, TrendType, TrendsView,
};
use crate::trend_analyzer::TrendAnalyzer;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Insights above this confidence are linked to an issue
const ISSUE_CONFIDENCE: f64 = 0.8;
/// Insights below this confidence do not drive recommendations
const RECOMMENDATION_CONFIDENCE: f64 = 0.5;

/// External issue tracker
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, description: &str, metadata: &HashMap<String, Value>) -> Result<String>;
}

/// Tracker used when none is configured; synthesizes ids and never fails
pub struct LocalIssueTracker;

#[async_trait]
impl IssueTracker for LocalIssueTracker {
    async fn create_issue(&self, description: &str, metadata: &HashMap<String, Value>) -> Result<String> {
        let id = match metadata.get("insight_id").and_then(|v| v.as_str()) {
            Some(insight_id) => format!("local-{}", insight_id),
            None => format!("local-{}", uuid::Uuid::new_v4()),
        };
        info!(issue_id = %id, description, "Recorded local issue");
        Ok(id)
    }
}

/// Creates issues by POSTing JSON to a tracker endpoint that answers with an `id`
pub struct WebhookIssueTracker {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookIssueTracker {
    pub fn new(config: &IssueTrackerConfig) -> Result<Self> {
        let token = match &config.env_var_token {
            Some(env_var) => Some(
                std::env::var(env_var).with_context(|| format!("Environment variable {} not found", env_var))?,
            ),
            None => None,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            token,
        })
    }
}

#[async_trait]
impl IssueTracker for WebhookIssueTracker {
    async fn create_issue(&self, description: &str, metadata: &HashMap<String, Value>) -> Result<String> {
        let title: String = description.lines().next().unwrap_or(description).chars().take(120).collect();
        let mut request = self.client.post(&self.url).json(&json!({
            "title": title,
            "description": description,
            "metadata": metadata,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Issue tracker request failed")?
            .error_for_status()
            .context("Issue tracker rejected the issue")?;
        let body: Value = response.json().await.context("Failed to parse issue tracker response")?;

        match body.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => bail!("Issue tracker response has no id"),
        }
    }
}

pub fn build_issue_tracker(config: Option<&IssueTrackerConfig>) -> Result<Box<dyn IssueTracker>> {
    match config {
        Some(config) => Ok(Box::new(WebhookIssueTracker::new(config)?)),
        None => Ok(Box::new(LocalIssueTracker)),
    }
}

/// Turns insights into recommendations and issue links
pub struct MetaTracker {
    insights_db: InsightsDatabase,
    analyzer: TrendAnalyzer,
    issue_tracker: Box<dyn IssueTracker>,
    trend_view: RwLock<TrendsView>,
}

impl MetaTracker {
    pub fn new(insights_db: InsightsDatabase, analyzer: TrendAnalyzer, issue_tracker: Box<dyn IssueTracker>) -> Self {
        Self {
            insights_db,
            analyzer,
            issue_tracker,
            trend_view: RwLock::new(TrendsView::default()),
        }
    }

    pub fn from_config(config: &TestingConfig) -> Result<Self> {
        let insights_db = InsightsDatabase::open(&StoreLocation::parse(&config.insights_storage))
            .with_context(|| format!("Failed to open insights store: {}", config.insights_storage))?;
        let issue_tracker = build_issue_tracker(config.issue_tracker.as_ref())?;
        Ok(Self::new(insights_db, TrendAnalyzer::from_config(config), issue_tracker))
    }

    pub fn insights_db(&self) -> &InsightsDatabase {
        &self.insights_db
    }

    /// Persist the insight, fold it into the trend view and return the
    /// recommendations it contributes to. A new insight supersedes the latest
    /// stored one with the same subject: it is linked to it and carries its
    /// issues over. Confident insights without an issue get one.
    pub async fn track_insight(&self, insight: &Insight) -> EvalResult<Vec<Recommendation>> {
        let mut insight = insight.clone();
        let predecessor = match self.insights_db.get_insight(&insight.insight_id)? {
            Some(stored) => {
                for linked in stored.linked_insights {
                    if !insight.linked_insights.contains(&linked) {
                        insight.linked_insights.push(linked);
                    }
                }
                None
            }
            None => self.latest_with_subject(&insight)?,
        };
        if let Some(previous) = &predecessor {
            if !insight.linked_insights.contains(&previous.insight_id) {
                insight.linked_insights.push(previous.insight_id.clone());
            }
        }

        self.insights_db.store_insight(&insight)?;
        self.update_trend_view(&insight);

        if let Some(previous) = &predecessor {
            for issue_id in &previous.linked_issues {
                self.insights_db.link_issue(&insight.insight_id, issue_id)?;
            }
            debug!(
                insight_id = %insight.insight_id,
                supersedes = %previous.insight_id,
                issues = previous.linked_issues.len(),
                "Insight supersedes an earlier one"
            );
        }

        let already_linked = !self.insights_db.get_linked_issues(&insight.insight_id)?.is_empty();
        if insight.confidence > ISSUE_CONFIDENCE && !already_linked {
            match self.create_issue(&insight).await {
                Ok(issue_id) => {
                    if let Err(e) = self.insights_db.link_issue(&insight.insight_id, &issue_id) {
                        warn!(insight_id = %insight.insight_id, error = %e, "Failed to record issue link");
                    }
                }
                Err(e) => {
                    warn!(insight_id = %insight.insight_id, error = %e, "Failed to create issue for insight");
                }
            }
        }

        let all = self.insights_db.get_all_insights()?;
        Ok(recommendations_for(&all)
            .into_iter()
            .filter(|r| r.linked_insights.contains(&insight.insight_id))
            .collect())
    }

    fn latest_with_subject(&self, insight: &Insight) -> EvalResult<Option<Insight>> {
        let subject = insight.subject();
        Ok(self
            .insights_db
            .get_insights_by_type(insight.insight_type)?
            .into_iter()
            .filter(|stored| stored.insight_id != insight.insight_id && stored.subject() == subject)
            .last())
    }

    /// Recommendations over every stored insight; same insights, same output
    pub fn generate_recommendations(&self) -> EvalResult<Vec<Recommendation>> {
        let all = self.insights_db.get_all_insights()?;
        Ok(recommendations_for(&all))
    }

    /// Replace the trend view with one derived from a fresh analysis
    pub fn record_trends(&self, trends: &BTreeMap<String, TrendAnalysis>) {
        let view = self.analyzer.trends_view(trends);
        *self.trend_view.write().unwrap_or_else(|e| e.into_inner()) = view;
    }

    fn update_trend_view(&self, insight: &Insight) {
        if insight.confidence < RECOMMENDATION_CONFIDENCE {
            return;
        }

        let mut view = self.trend_view.write().unwrap_or_else(|e| e.into_inner());
        let area = insight.area();
        let overall = insight.metadata.get("metric").and_then(|m| m.as_str()) == Some("overall");

        match insight.insight_type {
            InsightType::Regression if overall => {
                view.performance_trend = TrendType::Declining;
                view.confidence = insight.confidence;
            }
            InsightType::Improvement if overall => {
                view.performance_trend = TrendType::Improving;
                view.confidence = insight.confidence;
            }
            InsightType::Regression => {
                view.improvement_areas.retain(|a| a != &area);
                if !view.regression_areas.contains(&area) {
                    view.regression_areas.push(area);
                }
            }
            InsightType::Improvement => {
                view.regression_areas.retain(|a| a != &area);
                if !view.improvement_areas.contains(&area) {
                    view.improvement_areas.push(area);
                }
            }
            _ => {}
        }
    }

    pub fn get_trends(&self) -> TrendsView {
        self.trend_view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Open an issue for the insight on the configured tracker
    pub async fn create_issue(&self, insight: &Insight) -> Result<String> {
        let mut metadata = insight.metadata.clone();
        metadata.insert("insight_id".to_string(), json!(insight.insight_id));
        metadata.insert("insight_type".to_string(), json!(insight.insight_type));
        metadata.insert("severity".to_string(), json!(insight.severity));
        metadata.insert("confidence".to_string(), json!(insight.confidence));
        metadata.insert("code_version".to_string(), json!(insight.code_version));

        self.issue_tracker.create_issue(&insight.description, &metadata).await
    }

    pub fn get_insights_by_type(&self, insight_type: InsightType) -> EvalResult<Vec<Insight>> {
        self.insights_db.get_insights_by_type(insight_type)
    }

    pub fn get_insights_by_version(&self, code_version: &str) -> EvalResult<Vec<Insight>> {
        self.insights_db.get_insights_by_version(code_version)
    }
}

struct Draft {
    title: String,
    category: RecommendationCategory,
    effort: Effort,
    base_priority: Priority,
    summary: String,
    severity: Severity,
    linked: Vec<String>,
}

fn draft_for(insight: &Insight) -> Option<Draft> {
    let area = insight.area().replace('_', " ");
    let (title, category, effort, base_priority, summary) = match insight.insight_type {
        InsightType::Regression => (
            format!("Fix regression in {}", area),
            RecommendationCategory::Bug,
            Effort::Medium,
            Priority::Medium,
            format!("Scores for {} have declined", area),
        ),
        InsightType::Accessibility => (
            "Improve accessibility support".to_string(),
            RecommendationCategory::Improvement,
            Effort::Medium,
            Priority::High,
            "Personas with accessibility needs are underserved".to_string(),
        ),
        InsightType::Performance if insight.severity >= Severity::Medium => (
            format!("Improve {} performance", area),
            RecommendationCategory::Improvement,
            Effort::Medium,
            Priority::Medium,
            format!("{} performs below expectations", area),
        ),
        InsightType::Reliability => (
            format!("Harden {} reliability", area),
            RecommendationCategory::Bug,
            Effort::Medium,
            Priority::Medium,
            format!("Evaluations of {} fail intermittently", area),
        ),
        InsightType::Improvement => (
            format!("Consolidate gains in {}", area),
            RecommendationCategory::Improvement,
            Effort::Low,
            Priority::Low,
            format!("{} is improving", area),
        ),
        InsightType::Performance => return None,
    };

    Some(Draft {
        title,
        category,
        effort,
        base_priority,
        summary,
        severity: insight.severity,
        linked: vec![insight.insight_id.clone()],
    })
}

/// Group qualifying insights by recommendation title, most urgent first.
/// Insights superseded by a later linked insight no longer count.
fn recommendations_for(insights: &[Insight]) -> Vec<Recommendation> {
    let superseded: HashSet<&str> = insights
        .iter()
        .flat_map(|i| i.linked_insights.iter().map(String::as_str))
        .collect();
    let mut drafts: BTreeMap<String, Draft> = BTreeMap::new();

    for insight in insights
        .iter()
        .filter(|i| i.confidence >= RECOMMENDATION_CONFIDENCE && !superseded.contains(i.insight_id.as_str()))
    {
        let Some(draft) = draft_for(insight) else { continue };
        match drafts.get_mut(&draft.title) {
            Some(existing) => {
                existing.severity = existing.severity.max(draft.severity);
                existing.linked.extend(draft.linked);
            }
            None => {
                drafts.insert(draft.title.clone(), draft);
            }
        }
    }

    let mut recommendations: Vec<Recommendation> = drafts
        .into_values()
        .map(|draft| {
            let priority = if draft.severity >= Severity::High {
                Priority::High
            } else {
                draft.base_priority
            };
            let impact = match draft.severity {
                Severity::Critical => Impact::Critical,
                Severity::High | Severity::Medium => Impact::Significant,
                Severity::Low => Impact::Minor,
            };

            Recommendation {
                description: format!(
                    "{} ({} supporting insight{}, highest severity {})",
                    draft.summary,
                    draft.linked.len(),
                    if draft.linked.len() == 1 { "" } else { "s" },
                    draft.severity
                ),
                title: draft.title,
                priority,
                impact,
                effort: draft.effort,
                category: draft.category,
                linked_insights: draft.linked,
            }
        })
        .collect();

    recommendations.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.title.cmp(&b.title)));
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrendConfig;
    use crate::insights_database::tests::sample_insight;

    struct FailingTracker;

    #[async_trait]
    impl IssueTracker for FailingTracker {
        async fn create_issue(&self, _description: &str, _metadata: &HashMap<String, Value>) -> Result<String> {
            bail!("tracker offline")
        }
    }

    fn tracker_with(issue_tracker: Box<dyn IssueTracker>) -> MetaTracker {
        MetaTracker::new(
            InsightsDatabase::in_memory().unwrap(),
            TrendAnalyzer::new(TrendConfig::default(), 0.1, 3.5, "1.0.0"),
            issue_tracker,
        )
    }

    fn local_tracker() -> MetaTracker {
        tracker_with(Box::new(LocalIssueTracker))
    }

    #[tokio::test]
    async fn test_track_insight_stores_and_recommends() {
        let tracker = local_tracker();
        let insight = sample_insight("ins-1", InsightType::Regression, 0.7);

        let recommendations = tracker.track_insight(&insight).await.unwrap();
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].title, "Fix regression in clarity");
        assert_eq!(recommendations[0].category, RecommendationCategory::Bug);
        assert_eq!(recommendations[0].linked_insights, vec!["ins-1".to_string()]);

        assert_eq!(tracker.get_insights_by_type(InsightType::Regression).unwrap().len(), 1);
        assert!(tracker.insights_db().get_linked_issues("ins-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confident_insight_is_linked_to_issue() {
        let tracker = local_tracker();
        let insight = sample_insight("ins-9", InsightType::Regression, 0.9);

        tracker.track_insight(&insight).await.unwrap();

        assert_eq!(
            tracker.insights_db().get_linked_issues("ins-9").unwrap(),
            vec!["local-ins-9".to_string()]
        );
    }

    struct CountingTracker(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl IssueTracker for CountingTracker {
        async fn create_issue(&self, _description: &str, _metadata: &HashMap<String, Value>) -> Result<String> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("issue-{}", n))
        }
    }

    #[tokio::test]
    async fn test_retracking_linked_insight_opens_no_second_issue() {
        let created = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let tracker = tracker_with(Box::new(CountingTracker(created.clone())));
        let insight = sample_insight("ins-5", InsightType::Regression, 0.9);

        tracker.track_insight(&insight).await.unwrap();
        tracker.track_insight(&insight).await.unwrap();

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            tracker.insights_db().get_linked_issues("ins-5").unwrap(),
            vec!["issue-0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_same_subject_supersedes_and_keeps_issue() {
        let created = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let tracker = tracker_with(Box::new(CountingTracker(created.clone())));

        tracker
            .track_insight(&sample_insight("run-1", InsightType::Regression, 0.9))
            .await
            .unwrap();
        let recommendations = tracker
            .track_insight(&sample_insight("run-2", InsightType::Regression, 0.9))
            .await
            .unwrap();

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        let latest = tracker.insights_db().get_insight("run-2").unwrap().unwrap();
        assert_eq!(latest.linked_insights, vec!["run-1".to_string()]);
        assert_eq!(latest.linked_issues, vec!["issue-0".to_string()]);

        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].linked_insights, vec!["run-2".to_string()]);

        let mut other_area = sample_insight("run-3", InsightType::Regression, 0.9);
        other_area.metadata.insert("area".to_string(), json!("accuracy"));
        tracker.track_insight(&other_area).await.unwrap();
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(
            tracker
                .insights_db()
                .get_insight("run-3")
                .unwrap()
                .unwrap()
                .linked_insights
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_issue_tracker_failure_does_not_fail_tracking() {
        let tracker = tracker_with(Box::new(FailingTracker));
        let insight = sample_insight("ins-2", InsightType::Regression, 0.95);

        let recommendations = tracker.track_insight(&insight).await.unwrap();
        assert_eq!(recommendations.len(), 1);
        assert!(tracker.insights_db().get_linked_issues("ins-2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_issue_without_configured_tracker() {
        let tracker = MetaTracker::new(
            InsightsDatabase::in_memory().unwrap(),
            TrendAnalyzer::new(TrendConfig::default(), 0.1, 3.5, "1.0.0"),
            build_issue_tracker(None).unwrap(),
        );
        let insight = sample_insight("ins-3", InsightType::Performance, 0.5);
        assert_eq!(tracker.create_issue(&insight).await.unwrap(), "local-ins-3");
    }

    #[tokio::test]
    async fn test_webhook_issue_tracker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/issues")
            .match_header("authorization", "Bearer tracker-token")
            .match_body(mockito::Matcher::PartialJson(json!({ "metadata": { "insight_id": "ins-4" } })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 42}"#)
            .create_async()
            .await;

        let env_var = "CALENDAR_EVAL_TEST_TRACKER_TOKEN";
        unsafe {
            std::env::set_var(env_var, "tracker-token");
        }
        let config = IssueTrackerConfig {
            url: format!("{}/issues", server.url()),
            env_var_token: Some(env_var.to_string()),
        };
        let tracker = tracker_with(build_issue_tracker(Some(&config)).unwrap());

        let issue_id = tracker
            .create_issue(&sample_insight("ins-4", InsightType::Regression, 0.9))
            .await
            .unwrap();
        assert_eq!(issue_id, "42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_issue_tracker_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/issues").with_status(500).create_async().await;

        let config = IssueTrackerConfig {
            url: format!("{}/issues", server.url()),
            env_var_token: None,
        };
        let tracker = WebhookIssueTracker::new(&config).unwrap();
        assert!(tracker.create_issue("broken", &HashMap::new()).await.is_err());
    }

    #[test]
    fn test_recommendations_are_deterministic_and_ordered() {
        let mut critical = sample_insight("r1", InsightType::Regression, 0.9);
        critical.severity = Severity::Critical;
        let mut second = sample_insight("r2", InsightType::Regression, 0.6);
        second.severity = Severity::Low;
        let mut accessibility = sample_insight("a1", InsightType::Accessibility, 0.8);
        accessibility.metadata.clear();
        let mut minor_perf = sample_insight("p1", InsightType::Performance, 0.9);
        minor_perf.severity = Severity::Low;
        let mut gains = sample_insight("g1", InsightType::Improvement, 0.9);
        gains.metadata.insert("area".to_string(), json!("error_handling"));
        let ignored = sample_insight("x1", InsightType::Regression, 0.3);

        let insights = vec![critical, second, accessibility, minor_perf, gains, ignored];
        let first = recommendations_for(&insights);
        assert_eq!(first, recommendations_for(&insights));

        let titles: Vec<&str> = first.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Fix regression in clarity", "Improve accessibility support", "Consolidate gains in error handling"]
        );

        let regression = &first[0];
        assert_eq!(regression.priority, Priority::High);
        assert_eq!(regression.impact, Impact::Critical);
        assert_eq!(regression.linked_insights, vec!["r1".to_string(), "r2".to_string()]);
        assert!(regression.description.contains("2 supporting insights"));
        assert_eq!(first[2].priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_generate_recommendations_from_store() {
        let tracker = local_tracker();
        assert!(tracker.generate_recommendations().unwrap().is_empty());

        tracker
            .track_insight(&sample_insight("a1", InsightType::Accessibility, 0.7))
            .await
            .unwrap();
        let recommendations = tracker.generate_recommendations().unwrap();
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations, tracker.generate_recommendations().unwrap());
    }

    #[tokio::test]
    async fn test_trend_view_follows_insights() {
        let tracker = local_tracker();
        assert_eq!(tracker.get_trends(), TrendsView::default());

        tracker
            .track_insight(&sample_insight("reg", InsightType::Regression, 0.7))
            .await
            .unwrap();
        assert_eq!(tracker.get_trends().regression_areas, vec!["clarity".to_string()]);

        tracker
            .track_insight(&sample_insight("imp", InsightType::Improvement, 0.7))
            .await
            .unwrap();
        let view = tracker.get_trends();
        assert!(view.regression_areas.is_empty());
        assert_eq!(view.improvement_areas, vec!["clarity".to_string()]);

        let mut overall = sample_insight("all", InsightType::Regression, 0.75);
        overall.metadata.insert("metric".to_string(), json!("overall"));
        tracker.track_insight(&overall).await.unwrap();
        let view = tracker.get_trends();
        assert_eq!(view.performance_trend, TrendType::Declining);
        assert_eq!(view.confidence, 0.75);
    }
}
