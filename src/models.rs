use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Current time as the RFC 3339 string stored on every record
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp; naive timestamps are taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Severity shared by trends, insights and alerts, ordered low to critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Scenario difficulty, used when routing between scoring models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// Simulated user profile a scenario is run as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub accessibility_needs: Vec<String>,
}

/// One prompt sent to the assistant within a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPrompt {
    pub prompt: String,
    #[serde(default)]
    pub intent: Option<String>,
}

/// Behavior the assistant is expected to show, with keywords that evidence it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedBehavior {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ExpectedBehavior {
    /// Whether the response mentions any of the behavior's keywords
    pub fn is_covered_by(&self, response: &str) -> bool {
        let lowered = response.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }
}

/// A named test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub persona: Persona,
    pub category: String,
    pub difficulty: Difficulty,
    pub test_prompts: Vec<TestPrompt>,
    pub expected_behaviors: Vec<ExpectedBehavior>,
}

/// One scored interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub scenario_name: String,
    pub persona_name: String,
    pub prompt: String,
    pub assistant_response: String,
    /// Per-criterion scores, 0.0 to 5.0
    pub scores: BTreeMap<String, f64>,
    /// Preliminary pass scores when the evaluation was escalated to the primary model
    pub intermediate_scores: BTreeMap<String, f64>,
    pub feedback: String,
    pub timestamp: String,
    pub code_version: String,
    pub model_version: String,
    pub metadata: HashMap<String, Value>,
}

impl EvaluationResult {
    /// Representative score: the maximum across criteria (0.0 when unscored)
    pub fn best_score(&self) -> f64 {
        self.scores.values().copied().reduce(f64::max).unwrap_or(0.0)
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn evaluation_method(&self) -> Option<&str> {
        self.metadata.get("evaluation_method").and_then(|v| v.as_str())
    }

    pub fn is_fallback(&self) -> bool {
        self.evaluation_method() == Some("fallback")
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Four-bucket score distribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &[f64]) -> Self {
        let mut distribution = Self::default();
        for &score in scores {
            if score >= 4.5 {
                distribution.excellent += 1;
            } else if score >= 3.5 {
                distribution.good += 1;
            } else if score >= 2.5 {
                distribution.fair += 1;
            } else {
                distribution.poor += 1;
            }
        }
        distribution
    }
}

/// All evaluations for one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    /// Scored evaluations, in prompt order
    pub results: Vec<EvaluationResult>,
    /// Placeholder results for prompts whose scoring failed; excluded from aggregates
    pub fallbacks: Vec<EvaluationResult>,
    pub prompts_attempted: usize,
    pub success_rate: f64,
    pub average_score: f64,
    pub insights: Vec<String>,
    pub warnings: Vec<String>,
}

/// Aggregates over a whole batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_scenarios: usize,
    pub total_evaluations: usize,
    pub attempted_evaluations: usize,
    pub average_score: f64,
    pub success_rate: f64,
    pub score_distribution: ScoreDistribution,
}

/// Result of running several scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub started_at: String,
    pub scenarios: Vec<ScenarioResult>,
    /// Concatenation of every scenario's results, in scenario order
    pub results: Vec<EvaluationResult>,
    pub summary: BatchSummary,
    pub insights: Vec<String>,
    pub performance_alerts: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendType {
    Improving,
    Declining,
    Stable,
}

impl fmt::Display for TrendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendType::Improving => "improving",
            TrendType::Declining => "declining",
            TrendType::Stable => "stable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: String,
    pub value: f64,
}

/// Fitted trend for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub trend_type: TrendType,
    pub confidence: f64,
    /// Score change per evaluation
    pub slope: f64,
    pub r_squared: f64,
    pub severity: Severity,
    pub data_points: Vec<TrendPoint>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Criterion that fell between a baseline and a recent window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub criterion: String,
    pub baseline_score: f64,
    pub current_score: f64,
    pub decline_percentage: f64,
    pub severity: Severity,
}

/// Summary statistics over a set of evaluations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_tests: usize,
    pub average_score: f64,
    pub median_score: f64,
    pub score_std: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub score_distribution: ScoreDistribution,
    pub persona_performance: BTreeMap<String, f64>,
    pub scenario_performance: BTreeMap<String, f64>,
    pub criteria_performance: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Performance,
    Regression,
    Accessibility,
    Improvement,
    Reliability,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Performance => "performance",
            InsightType::Regression => "regression",
            InsightType::Accessibility => "accessibility",
            InsightType::Improvement => "improvement",
            InsightType::Reliability => "reliability",
        }
    }
}

impl fmt::Display for InsightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "performance" => Ok(InsightType::Performance),
            "regression" => Ok(InsightType::Regression),
            "accessibility" => Ok(InsightType::Accessibility),
            "improvement" => Ok(InsightType::Improvement),
            "reliability" => Ok(InsightType::Reliability),
            other => Err(format!("unknown insight type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Persona,
    Scenario,
    System,
}

impl InsightCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Persona => "persona",
            InsightCategory::Scenario => "scenario",
            InsightCategory::System => "system",
        }
    }
}

impl fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persona" => Ok(InsightCategory::Persona),
            "scenario" => Ok(InsightCategory::Scenario),
            "system" => Ok(InsightCategory::System),
            other => Err(format!("unknown insight category '{}'", other)),
        }
    }
}

/// Confidence-scored observation persisted for longitudinal tracking.
/// Never mutated after creation: supersede by storing a new, linked insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: String,
    pub insight_type: InsightType,
    pub description: String,
    pub confidence: f64,
    pub severity: Severity,
    pub category: InsightCategory,
    pub code_version: String,
    pub timestamp: String,
    pub metadata: HashMap<String, Value>,
    pub linked_issues: Vec<String>,
    pub linked_insights: Vec<String>,
}

impl Insight {
    /// Area the insight is about: its `metric`/`area` metadata, else its type
    pub fn area(&self) -> String {
        for key in ["area", "metric", "improvement_area", "scenario", "persona"] {
            if let Some(area) = self.metadata.get(key).and_then(|v| v.as_str()) {
                return area.to_string();
            }
        }
        self.insight_type.as_str().to_string()
    }

    /// What the insight describes, stable across runs: its type, its metric
    /// (else its area) and the persona when one is named
    pub fn subject(&self) -> String {
        let metric = self
            .metadata
            .get("metric")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.area());
        match self.metadata.get("persona").and_then(|v| v.as_str()) {
            Some(persona) => format!("{}:{}@{}", self.insight_type, metric, persona),
            None => format!("{}:{}", self.insight_type, metric),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Critical,
    Significant,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationCategory {
    Feature,
    Bug,
    Improvement,
}

/// Roadmap item derived from the current insight set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub impact: Impact,
    pub effort: Effort,
    pub category: RecommendationCategory,
    pub linked_insights: Vec<String>,
}

/// Aggregate direction of the tracked metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendsView {
    pub performance_trend: TrendType,
    pub improvement_areas: Vec<String>,
    pub regression_areas: Vec<String>,
    pub confidence: f64,
}

impl Default for TrendsView {
    fn default() -> Self {
        Self {
            performance_trend: TrendType::Stable,
            improvement_areas: Vec::new(),
            regression_areas: Vec::new(),
            confidence: 0.0,
        }
    }
}

/// Severity-tagged condition that should reach an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub first_seen: String,
    /// Deduplication key
    pub key: String,
}

/// Everything a `run` produces, bundled for presentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub batch_result: BatchResult,
    pub performance_summary: PerformanceSummary,
    pub trends: BTreeMap<String, TrendAnalysis>,
    pub regressions: Vec<Regression>,
    pub trend_view: TrendsView,
    pub recommendations: Vec<Recommendation>,
    pub alerts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_scores(scores: &[(&str, f64)]) -> EvaluationResult {
        EvaluationResult {
            scenario_name: "Morning Routine Setup".to_string(),
            persona_name: "Alex".to_string(),
            prompt: "Block 7am for a run".to_string(),
            assistant_response: "Done".to_string(),
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            intermediate_scores: BTreeMap::new(),
            feedback: "ok".to_string(),
            timestamp: "2025-01-27T12:00:00Z".to_string(),
            code_version: "0.1.0".to_string(),
            model_version: "gpt-4o".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_best_score_is_max_criterion() {
        let result = result_with_scores(&[("clarity", 3.0), ("accuracy", 4.2), ("efficiency", 1.0)]);
        assert_eq!(result.best_score(), 4.2);
    }

    #[test]
    fn test_best_score_empty_scores() {
        let result = result_with_scores(&[]);
        assert_eq!(result.best_score(), 0.0);
    }

    #[test]
    fn test_score_distribution_buckets() {
        let distribution = ScoreDistribution::from_scores(&[4.5, 4.0, 3.5, 3.0, 2.5, 2.49, 0.0]);
        assert_eq!(
            distribution,
            ScoreDistribution { excellent: 1, good: 2, fair: 2, poor: 2 }
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2025-01-27T12:00:00Z").is_some());
        assert!(parse_timestamp("2025-01-27T12:00:00+02:00").is_some());
        assert!(parse_timestamp("2025-01-27T12:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("high".parse::<Severity>(), Ok(Severity::High));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_alert_serializes_type_field() {
        let alert = Alert {
            severity: Severity::Critical,
            alert_type: "performance_regression".to_string(),
            message: "clarity fell".to_string(),
            first_seen: "2025-01-27T12:00:00Z".to_string(),
            key: "regression.clarity".to_string(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "performance_regression");
        assert_eq!(json["severity"], "critical");
    }

    #[test]
    fn test_insight_area_prefers_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("metric".to_string(), Value::from("clarity"));
        let insight = Insight {
            insight_id: "i-1".to_string(),
            insight_type: InsightType::Regression,
            description: "clarity fell".to_string(),
            confidence: 0.9,
            severity: Severity::High,
            category: InsightCategory::System,
            code_version: "0.1.0".to_string(),
            timestamp: now_timestamp(),
            metadata,
            linked_issues: vec![],
            linked_insights: vec![],
        };
        assert_eq!(insight.area(), "clarity");

        let bare = Insight { metadata: HashMap::new(), ..insight.clone() };
        assert_eq!(bare.area(), "regression");
        assert_eq!(bare.subject(), "regression:regression");

        let mut trend = insight.clone();
        trend.metadata.insert("metric".to_string(), Value::from("criterion.clarity"));
        trend.metadata.insert("area".to_string(), Value::from("clarity"));
        assert_eq!(trend.subject(), "regression:criterion.clarity");

        let mut persona = insight;
        persona.insight_type = InsightType::Accessibility;
        persona.metadata.insert("persona".to_string(), Value::from("Morgan"));
        assert_eq!(persona.subject(), "accessibility:clarity@Morgan");
    }
}
