use crate::config::{TestingConfig, TrendConfig};
use crate::models::{
    EvaluationResult, Insight, InsightCategory, InsightType, PerformanceSummary, Regression,
    ScoreDistribution, Severity, TrendAnalysis, TrendPoint, TrendType, TrendsView, now_timestamp,
};
use crate::stats::{linear_fit, mean, median, std_dev};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Fewer points than this never yield full confidence or critical severity
const MIN_POINTS_FOR_CRITICAL: usize = 5;
const LOW_SAMPLE_CONFIDENCE_CAP: f64 = 0.5;

/// Tolerance when comparing decline ratios against severity cutoffs
const RATIO_EPSILON: f64 = 1e-9;

struct TimedValue {
    at: DateTime<Utc>,
    timestamp: String,
    value: f64,
}

/// Statistical analysis over stored evaluation history
pub struct TrendAnalyzer {
    config: TrendConfig,
    decline_threshold: f64,
    /// Stable metrics averaging below this get a recommendation
    success_score: f64,
    code_version: String,
}

impl TrendAnalyzer {
    pub fn new(
        config: TrendConfig,
        decline_threshold: f64,
        success_score: f64,
        code_version: impl Into<String>,
    ) -> Self {
        Self {
            config,
            decline_threshold,
            success_score,
            code_version: code_version.into(),
        }
    }

    pub fn from_config(config: &TestingConfig) -> Self {
        Self::new(
            config.trends.clone(),
            config.decline_threshold,
            config.success_score,
            config.code_version.clone(),
        )
    }

    /// Fit a trend per metric: `overall`, `criterion.<name>`, `persona.<name>`, `scenario.<name>`.
    /// Results with unparseable timestamps are left out of every fit.
    pub fn analyze_performance_trends(&self, results: &[EvaluationResult]) -> BTreeMap<String, TrendAnalysis> {
        let mut series: BTreeMap<String, Vec<TimedValue>> = BTreeMap::new();

        for result in results.iter().filter(|r| !r.is_fallback()) {
            let Some(at) = result.parsed_timestamp() else {
                warn!(timestamp = %result.timestamp, scenario = %result.scenario_name, "Skipping result with malformed timestamp");
                continue;
            };

            let mut push = |metric: String, value: f64| {
                series.entry(metric).or_default().push(TimedValue {
                    at,
                    timestamp: result.timestamp.clone(),
                    value,
                });
            };

            let best = result.best_score();
            push("overall".to_string(), best);
            push(format!("persona.{}", result.persona_name), best);
            push(format!("scenario.{}", result.scenario_name), best);
            for (criterion, score) in &result.scores {
                push(format!("criterion.{}", criterion), *score);
            }
        }

        series
            .into_iter()
            .filter_map(|(metric, points)| {
                let analysis = self.analyze_metric(&metric, points)?;
                Some((metric, analysis))
            })
            .collect()
    }

    fn analyze_metric(&self, metric: &str, mut points: Vec<TimedValue>) -> Option<TrendAnalysis> {
        if points.len() < self.config.min_points.max(2) {
            debug!(metric, points = points.len(), "Not enough points for a trend");
            return None;
        }

        points.sort_by_key(|p| p.at);
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let fit = linear_fit(&values)?;
        let n = values.len();

        let trend_type = if fit.slope.abs() < self.config.noise_threshold {
            TrendType::Stable
        } else if fit.slope > 0.0 {
            TrendType::Improving
        } else {
            TrendType::Declining
        };

        let sample_factor = (n as f64 / self.config.full_confidence_points.max(1) as f64).min(1.0);
        let mut confidence = match trend_type {
            TrendType::Stable => sample_factor * (1.0 - fit.r_squared),
            _ => sample_factor * fit.r_squared,
        };
        if n < MIN_POINTS_FOR_CRITICAL {
            confidence = confidence.min(LOW_SAMPLE_CONFIDENCE_CAP);
        }

        let first = fit.value_at(0.0);
        let last = fit.value_at((n - 1) as f64);
        let decline_ratio = if first > 0.0 { (first - last) / first } else { 0.0 };

        let severity = match trend_type {
            TrendType::Declining => {
                let slope = fit.slope.abs();
                if decline_ratio + RATIO_EPSILON >= 0.25 && n >= MIN_POINTS_FOR_CRITICAL && confidence >= 0.7 {
                    Severity::Critical
                } else if decline_ratio + RATIO_EPSILON >= 0.15 || slope >= 0.3 {
                    Severity::High
                } else if decline_ratio + RATIO_EPSILON >= 0.05 || slope >= 0.15 {
                    Severity::Medium
                } else {
                    Severity::Low
                }
            }
            _ => Severity::Low,
        };

        let label = describe_metric(metric);
        let mut insights = vec![format!(
            "{} is {} ({:+.3} per evaluation, R² {:.2}, {} points)",
            capitalize(&label),
            trend_type,
            fit.slope,
            fit.r_squared,
            n
        )];
        let mut recommendations = Vec::new();
        match trend_type {
            TrendType::Declining => {
                insights.push(format!(
                    "Fitted {} fell from {:.2} to {:.2} ({:.1}% decline)",
                    label,
                    first,
                    last,
                    decline_ratio * 100.0
                ));
                recommendations.push(format!("Investigate recent changes affecting {}", label));
                if severity >= Severity::High {
                    recommendations.push("Consider rolling back the latest assistant or prompt change".to_string());
                }
            }
            TrendType::Improving => {
                recommendations.push(format!("Keep the changes that improved {}", label));
            }
            TrendType::Stable => {
                if mean(&values) < self.success_score {
                    recommendations.push(format!("{} is flat at a low level; target it directly", capitalize(&label)));
                }
            }
        }

        Some(TrendAnalysis {
            trend_type,
            confidence,
            slope: fit.slope,
            r_squared: fit.r_squared,
            severity,
            data_points: points
                .into_iter()
                .map(|p| TrendPoint { timestamp: p.timestamp, value: p.value })
                .collect(),
            insights,
            recommendations,
        })
    }

    /// Aggregate statistics over per-result best scores and per-criterion scores
    pub fn get_performance_summary(&self, results: &[EvaluationResult]) -> PerformanceSummary {
        let scored: Vec<&EvaluationResult> = results.iter().filter(|r| !r.is_fallback()).collect();
        if scored.is_empty() {
            return PerformanceSummary::default();
        }

        let best_scores: Vec<f64> = scored.iter().map(|r| r.best_score()).collect();

        let mut by_persona: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut by_scenario: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut by_criterion: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (result, best) in scored.iter().zip(&best_scores) {
            by_persona.entry(result.persona_name.clone()).or_default().push(*best);
            by_scenario.entry(result.scenario_name.clone()).or_default().push(*best);
            for (criterion, score) in &result.scores {
                by_criterion.entry(criterion.clone()).or_default().push(*score);
            }
        }
        let means = |groups: BTreeMap<String, Vec<f64>>| -> BTreeMap<String, f64> {
            groups.into_iter().map(|(k, v)| (k, mean(&v))).collect()
        };

        PerformanceSummary {
            total_tests: scored.len(),
            average_score: mean(&best_scores),
            median_score: median(&best_scores),
            score_std: std_dev(&best_scores),
            min_score: best_scores.iter().copied().fold(f64::INFINITY, f64::min),
            max_score: best_scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            score_distribution: ScoreDistribution::from_scores(&best_scores),
            persona_performance: means(by_persona),
            scenario_performance: means(by_scenario),
            criteria_performance: means(by_criterion),
        }
    }

    /// Criteria whose recent mean fell more than the decline threshold below baseline.
    /// Criteria with a zero baseline are skipped. Sorted by decline, largest first.
    pub fn detect_regressions(&self, recent: &[EvaluationResult], baseline: &[EvaluationResult]) -> Vec<Regression> {
        let recent_means = criterion_means(recent);
        let baseline_means = criterion_means(baseline);

        let mut regressions: Vec<Regression> = baseline_means
            .iter()
            .filter_map(|(criterion, &baseline_score)| {
                let &current_score = recent_means.get(criterion)?;
                if baseline_score <= 0.0 {
                    debug!(criterion = %criterion, "Skipping regression check for zero baseline");
                    return None;
                }

                let decline = (baseline_score - current_score) / baseline_score;
                if decline <= self.decline_threshold + RATIO_EPSILON {
                    return None;
                }

                let severity = if decline + RATIO_EPSILON >= 0.30 {
                    Severity::Critical
                } else if decline + RATIO_EPSILON >= 0.20 {
                    Severity::High
                } else if decline + RATIO_EPSILON >= 0.10 {
                    Severity::Medium
                } else {
                    Severity::Low
                };

                Some(Regression {
                    criterion: criterion.clone(),
                    baseline_score,
                    current_score,
                    decline_percentage: decline * 100.0,
                    severity,
                })
            })
            .collect();

        regressions.sort_by(|a, b| {
            b.decline_percentage
                .partial_cmp(&a.decline_percentage)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.criterion.cmp(&b.criterion))
        });
        regressions
    }

    /// One insight per sufficiently confident trend
    pub fn generate_trend_insights(&self, trends: &BTreeMap<String, TrendAnalysis>) -> Vec<Insight> {
        trends
            .iter()
            .filter(|(_, trend)| trend.confidence >= self.config.min_insight_confidence)
            .map(|(metric, trend)| self.trend_insight(metric, trend))
            .collect()
    }

    fn trend_insight(&self, metric: &str, trend: &TrendAnalysis) -> Insight {
        let insight_type = match trend.trend_type {
            TrendType::Declining => InsightType::Regression,
            TrendType::Improving => InsightType::Improvement,
            TrendType::Stable => InsightType::Performance,
        };
        let category = match metric.split_once('.') {
            Some(("persona", _)) => InsightCategory::Persona,
            Some(("scenario", _)) => InsightCategory::Scenario,
            _ => InsightCategory::System,
        };

        let first = trend.data_points.first().map(|p| p.value).unwrap_or_default();
        let last = trend.data_points.last().map(|p| p.value).unwrap_or_default();
        let description = format!(
            "{} is {}: {:.2} to {:.2} over {} evaluations (slope {:+.3}, R² {:.2})",
            capitalize(&describe_metric(metric)),
            trend.trend_type,
            first,
            last,
            trend.data_points.len(),
            trend.slope,
            trend.r_squared
        );

        let mut metadata = HashMap::new();
        metadata.insert("metric".to_string(), json!(metric));
        metadata.insert("area".to_string(), json!(metric_area(metric)));
        metadata.insert("slope".to_string(), json!(trend.slope));
        metadata.insert("r_squared".to_string(), json!(trend.r_squared));
        metadata.insert("data_points".to_string(), json!(trend.data_points.len()));

        Insight {
            insight_id: uuid::Uuid::new_v4().to_string(),
            insight_type,
            description,
            confidence: trend.confidence,
            severity: trend.severity,
            category,
            code_version: self.code_version.clone(),
            timestamp: now_timestamp(),
            metadata,
            linked_issues: Vec::new(),
            linked_insights: Vec::new(),
        }
    }

    /// One regression insight per detected regression. Confidence grows with the
    /// smaller of the two sample sizes the comparison rests on.
    pub fn generate_regression_insights(
        &self,
        regressions: &[Regression],
        recent_count: usize,
        baseline_count: usize,
    ) -> Vec<Insight> {
        let samples = recent_count.min(baseline_count);
        let full = self.config.full_confidence_points.max(1);
        let confidence = (0.5 + 0.45 * (samples.min(full) as f64 / full as f64)).min(0.95);

        regressions
            .iter()
            .map(|regression| {
                let mut metadata = HashMap::new();
                metadata.insert("area".to_string(), json!(regression.criterion));
                metadata.insert("baseline_score".to_string(), json!(regression.baseline_score));
                metadata.insert("current_score".to_string(), json!(regression.current_score));
                metadata.insert("decline_percentage".to_string(), json!(regression.decline_percentage));

                Insight {
                    insight_id: uuid::Uuid::new_v4().to_string(),
                    insight_type: InsightType::Regression,
                    description: format!(
                        "{} fell {:.1}% below baseline ({:.2} to {:.2})",
                        capitalize(&regression.criterion.replace('_', " ")),
                        regression.decline_percentage,
                        regression.baseline_score,
                        regression.current_score
                    ),
                    confidence,
                    severity: regression.severity,
                    category: InsightCategory::System,
                    code_version: self.code_version.clone(),
                    timestamp: now_timestamp(),
                    metadata,
                    linked_issues: Vec::new(),
                    linked_insights: Vec::new(),
                }
            })
            .collect()
    }

    /// Condense trend analyses into the direction view the meta tracker reports
    pub fn trends_view(&self, trends: &BTreeMap<String, TrendAnalysis>) -> TrendsView {
        let confident = |trend_type: TrendType| -> Vec<String> {
            trends
                .iter()
                .filter(|(metric, t)| {
                    metric.as_str() != "overall"
                        && t.trend_type == trend_type
                        && t.confidence >= self.config.min_insight_confidence
                })
                .map(|(metric, _)| metric_area(metric).to_string())
                .collect()
        };

        let (performance_trend, confidence) = match trends.get("overall") {
            Some(overall) => (overall.trend_type, overall.confidence),
            None => (TrendType::Stable, 0.0),
        };

        TrendsView {
            performance_trend,
            improvement_areas: confident(TrendType::Improving),
            regression_areas: confident(TrendType::Declining),
            confidence,
        }
    }
}

fn criterion_means(results: &[EvaluationResult]) -> BTreeMap<String, f64> {
    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for result in results.iter().filter(|r| !r.is_fallback()) {
        for (criterion, score) in &result.scores {
            grouped.entry(criterion.clone()).or_default().push(*score);
        }
    }
    grouped.into_iter().map(|(k, v)| (k, mean(&v))).collect()
}

/// `criterion.clarity` -> `clarity`; `overall` stays as is
fn metric_area(metric: &str) -> &str {
    metric.split_once('.').map(|(_, area)| area).unwrap_or(metric)
}

fn describe_metric(metric: &str) -> String {
    match metric.split_once('.') {
        Some(("criterion", name)) => format!("{} scores", name.replace('_', " ")),
        Some(("persona", name)) => format!("performance for persona {}", name),
        Some(("scenario", name)) => format!("performance on scenario '{}'", name),
        _ => "overall score".to_string(),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::sample_result;

    fn analyzer() -> TrendAnalyzer {
        TrendAnalyzer::new(TrendConfig::default(), 0.10, 3.5, "1.0.0")
    }

    fn series(values: &[f64]) -> Vec<EvaluationResult> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| sample_result("Travel Planning", &format!("2026-01-{:02}T00:00:00.000Z", i + 1), *v))
            .collect()
    }

    fn with_criterion(mut result: EvaluationResult, criterion: &str, score: f64) -> EvaluationResult {
        result.scores.clear();
        result.scores.insert(criterion.to_string(), score);
        result
    }

    #[test]
    fn test_increasing_sequence_is_improving() {
        let values: Vec<f64> = (0..10).map(|i| 3.0 + i as f64 * 0.15).collect();
        let trends = analyzer().analyze_performance_trends(&series(&values));

        let overall = &trends["overall"];
        assert_eq!(overall.trend_type, TrendType::Improving);
        assert!(overall.slope > 0.0);
        assert!(overall.r_squared > 0.99);
        assert!(overall.confidence > 0.9);
        assert_eq!(overall.severity, Severity::Low);
        assert_eq!(overall.data_points.len(), 10);
        assert!(trends.contains_key("criterion.clarity"));
        assert!(trends.contains_key("persona.Alex"));
        assert!(trends.contains_key("scenario.Travel Planning"));
    }

    #[test]
    fn test_constant_sequence_is_stable() {
        let trends = analyzer().analyze_performance_trends(&series(&[3.5; 8]));

        let overall = &trends["overall"];
        assert_eq!(overall.trend_type, TrendType::Stable);
        assert!(overall.slope.abs() < 1e-9);
        assert_eq!(overall.r_squared, 0.0);
    }

    #[test]
    fn test_flat_low_level_uses_configured_success_score() {
        let history = series(&[3.2; 6]);

        let strict = analyzer().analyze_performance_trends(&history);
        assert_eq!(strict["overall"].recommendations.len(), 1);
        assert!(strict["overall"].recommendations[0].contains("flat at a low level"));

        let lenient = TrendAnalyzer::new(TrendConfig::default(), 0.10, 3.0, "1.0.0");
        assert!(lenient.analyze_performance_trends(&history)["overall"].recommendations.is_empty());
    }

    #[test]
    fn test_steep_decline_is_critical() {
        let values: Vec<f64> = (0..10).map(|i| 4.5 - i as f64 * 0.2).collect();
        let trends = analyzer().analyze_performance_trends(&series(&values));

        let overall = &trends["overall"];
        assert_eq!(overall.trend_type, TrendType::Declining);
        assert_eq!(overall.severity, Severity::Critical);
        assert!(overall.recommendations.iter().any(|r| r.contains("rolling back")));
    }

    #[test]
    fn test_few_points_never_critical() {
        let trends = analyzer().analyze_performance_trends(&series(&[4.5, 3.0, 1.5]));

        let overall = &trends["overall"];
        assert_eq!(overall.trend_type, TrendType::Declining);
        assert!(overall.confidence <= 0.5);
        assert_eq!(overall.severity, Severity::High);
    }

    #[test]
    fn test_too_few_points_yield_no_trend() {
        let trends = analyzer().analyze_performance_trends(&series(&[4.0, 3.0]));
        assert!(trends.is_empty());
    }

    #[test]
    fn test_malformed_timestamps_are_skipped() {
        let mut results = series(&[3.0, 3.5, 4.0, 4.5]);
        results[1].timestamp = "yesterday".to_string();

        let trends = analyzer().analyze_performance_trends(&results);
        let overall = &trends["overall"];
        assert_eq!(overall.data_points.len(), 3);
        assert!(overall.data_points.iter().all(|p| p.timestamp != "yesterday"));
    }

    #[test]
    fn test_points_are_ordered_by_timestamp() {
        let mut results = series(&[3.0, 3.5, 4.0, 4.5, 5.0]);
        results.reverse();

        let trends = analyzer().analyze_performance_trends(&results);
        assert_eq!(trends["overall"].trend_type, TrendType::Improving);
        assert_eq!(trends["overall"].data_points[0].value, 3.0);
    }

    #[test]
    fn test_empty_history() {
        let analyzer = analyzer();
        assert!(analyzer.analyze_performance_trends(&[]).is_empty());
        assert_eq!(analyzer.get_performance_summary(&[]), PerformanceSummary::default());
        assert!(analyzer.detect_regressions(&[], &[]).is_empty());
        assert_eq!(analyzer.trends_view(&BTreeMap::new()), TrendsView::default());
    }

    #[test]
    fn test_performance_summary() {
        let mut results = series(&[2.0, 4.0, 5.0]);
        results[2].persona_name = "Sam".to_string();
        results[2].scenario_name = "Study Schedule Optimization".to_string();
        results[2].scores.insert("clarity".to_string(), 3.0);

        let summary = analyzer().get_performance_summary(&results);
        assert_eq!(summary.total_tests, 3);
        assert!((summary.average_score - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.median_score, 4.0);
        assert_eq!(summary.min_score, 2.0);
        assert_eq!(summary.max_score, 5.0);
        assert_eq!(summary.score_distribution, ScoreDistribution { excellent: 1, good: 1, fair: 0, poor: 1 });
        assert_eq!(summary.persona_performance["Alex"], 3.0);
        assert_eq!(summary.persona_performance["Sam"], 5.0);
        assert_eq!(summary.scenario_performance["Travel Planning"], 3.0);
        assert!((summary.criteria_performance["clarity"] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_distributions_have_no_regressions() {
        let results = series(&[3.0, 4.0, 4.5]);
        assert!(analyzer().detect_regressions(&results, &results).is_empty());
    }

    #[test]
    fn test_clarity_regression_of_twenty_percent() {
        let baseline = vec![with_criterion(sample_result("S", "2026-01-01T00:00:00.000Z", 0.0), "clarity", 4.0)];
        let recent = vec![with_criterion(sample_result("S", "2026-01-02T00:00:00.000Z", 0.0), "clarity", 3.2)];

        let regressions = analyzer().detect_regressions(&recent, &baseline);
        assert_eq!(regressions.len(), 1);
        let regression = &regressions[0];
        assert_eq!(regression.criterion, "clarity");
        assert!((regression.decline_percentage - 20.0).abs() < 1e-6);
        assert_eq!(regression.baseline_score, 4.0);
        assert_eq!(regression.current_score, 3.2);
        assert_eq!(regression.severity, Severity::High);
    }

    #[test]
    fn test_zero_baseline_is_skipped() {
        let baseline = vec![with_criterion(sample_result("S", "2026-01-01T00:00:00.000Z", 0.0), "accuracy", 0.0)];
        let recent = vec![with_criterion(sample_result("S", "2026-01-02T00:00:00.000Z", 0.0), "accuracy", 0.0)];
        assert!(analyzer().detect_regressions(&recent, &baseline).is_empty());
    }

    #[test]
    fn test_small_decline_below_threshold() {
        let baseline = vec![with_criterion(sample_result("S", "2026-01-01T00:00:00.000Z", 0.0), "clarity", 4.0)];
        let recent = vec![with_criterion(sample_result("S", "2026-01-02T00:00:00.000Z", 0.0), "clarity", 3.8)];
        assert!(analyzer().detect_regressions(&recent, &baseline).is_empty());
    }

    #[test]
    fn test_trend_insights_respect_min_confidence() {
        let analyzer = analyzer();
        let declining: Vec<f64> = (0..10).map(|i| 4.5 - i as f64 * 0.2).collect();
        let trends = analyzer.analyze_performance_trends(&series(&declining));
        let insights = analyzer.generate_trend_insights(&trends);

        assert!(!insights.is_empty());
        let overall = insights
            .iter()
            .find(|i| i.metadata["metric"] == json!("overall"))
            .unwrap();
        assert_eq!(overall.insight_type, InsightType::Regression);
        assert_eq!(overall.category, InsightCategory::System);
        assert!(overall.description.contains("declining"));
        assert_eq!(overall.code_version, "1.0.0");

        let persona = insights
            .iter()
            .find(|i| i.metadata["metric"] == json!("persona.Alex"))
            .unwrap();
        assert_eq!(persona.category, InsightCategory::Persona);
        assert_eq!(persona.area(), "Alex");

        let shaky = analyzer.analyze_performance_trends(&series(&[4.5, 3.0, 1.5]));
        assert!(analyzer.generate_trend_insights(&shaky).is_empty());
    }

    #[test]
    fn test_regression_insights_scale_with_sample_size() {
        let regression = Regression {
            criterion: "goal_achievement".to_string(),
            baseline_score: 4.0,
            current_score: 3.0,
            decline_percentage: 25.0,
            severity: Severity::High,
        };

        let small = analyzer().generate_regression_insights(std::slice::from_ref(&regression), 1, 20);
        let large = analyzer().generate_regression_insights(std::slice::from_ref(&regression), 10, 20);

        assert_eq!(small.len(), 1);
        assert_eq!(small[0].insight_type, InsightType::Regression);
        assert_eq!(small[0].area(), "goal_achievement");
        assert_eq!(small[0].severity, Severity::High);
        assert!(small[0].description.starts_with("Goal achievement fell 25.0%"));
        assert!(small[0].confidence < large[0].confidence);
        assert!((large[0].confidence - 0.95).abs() < 1e-9);
        assert_ne!(small[0].insight_id, large[0].insight_id);
    }

    #[test]
    fn test_trends_view() {
        let analyzer = analyzer();
        let improving: Vec<f64> = (0..10).map(|i| 3.0 + i as f64 * 0.15).collect();
        let trends = analyzer.analyze_performance_trends(&series(&improving));

        let view = analyzer.trends_view(&trends);
        assert_eq!(view.performance_trend, TrendType::Improving);
        assert!(view.improvement_areas.contains(&"clarity".to_string()));
        assert!(view.regression_areas.is_empty());
        assert!(view.confidence > 0.9);
    }
}
