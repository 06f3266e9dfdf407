use crate::alerts::AlertThresholds;
use crate::assistant::{Assistant, build_assistant};
use crate::config::TestingConfig;
use crate::database::{ResultsDatabase, StoreLocation};
use crate::evaluator::ScoringAgent;
use crate::meta_tracker::MetaTracker;
use crate::models::{
    BatchResult, BatchSummary, EvaluationReport, EvaluationResult, Insight, InsightCategory,
    InsightType, Scenario, ScenarioResult, ScoreDistribution, Severity, TestPrompt, now_timestamp,
};
use crate::stats::mean;
use crate::trend_analyzer::TrendAnalyzer;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One prompt's outcome before it is split into scored results and fallbacks
struct PromptOutcome {
    index: usize,
    result: EvaluationResult,
    warning: Option<String>,
}

/// Drives scenarios through the assistant and the scoring agent, persists what
/// was scored and assembles reports
pub struct EvaluationLoop {
    assistant: Arc<dyn Assistant>,
    scoring_agent: ScoringAgent,
    results_db: ResultsDatabase,
    analyzer: TrendAnalyzer,
    meta_tracker: MetaTracker,
    thresholds: AlertThresholds,
    success_score: f64,
    assistant_timeout: Duration,
    max_concurrent_prompts: usize,
    history_limit: usize,
    code_version: String,
    model_version: String,
}

impl EvaluationLoop {
    pub fn new(
        config: &TestingConfig,
        assistant: Arc<dyn Assistant>,
        scoring_agent: ScoringAgent,
        results_db: ResultsDatabase,
        meta_tracker: MetaTracker,
    ) -> Self {
        Self {
            assistant,
            scoring_agent,
            results_db,
            analyzer: TrendAnalyzer::from_config(config),
            meta_tracker,
            thresholds: AlertThresholds::from_config(config),
            success_score: config.success_score,
            assistant_timeout: config.assistant.timeout(),
            max_concurrent_prompts: config.max_concurrent_prompts.max(1),
            history_limit: config.history_limit,
            code_version: config.code_version.clone(),
            model_version: config.scoring.scoring_model.clone(),
        }
    }

    /// Wire up every collaborator from configuration
    pub fn from_config(config: &TestingConfig) -> Result<Self> {
        let scoring_agent = ScoringAgent::from_config(config).context("Failed to create scoring agent")?;
        let results_db = ResultsDatabase::open(&StoreLocation::parse(&config.results_storage))
            .with_context(|| format!("Failed to open results store: {}", config.results_storage))?;
        let meta_tracker = MetaTracker::from_config(config)?;

        Ok(Self::new(
            config,
            build_assistant(&config.assistant),
            scoring_agent,
            results_db,
            meta_tracker,
        ))
    }

    /// Evaluate every prompt of the scenario. Prompts run concurrently but the
    /// results keep prompt order. Failures never abort the scenario.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult {
        let total_prompts = scenario.test_prompts.len();
        info!(scenario = %scenario.name, persona = %scenario.persona.name, prompts = total_prompts, "Running scenario");

        let mut outcomes: Vec<PromptOutcome> = stream::iter(scenario.test_prompts.iter().enumerate())
            .map(|(index, prompt)| self.evaluate_prompt(scenario, index, prompt))
            .buffer_unordered(self.max_concurrent_prompts)
            .collect()
            .await;
        outcomes.sort_by_key(|outcome| outcome.index);

        let mut results = Vec::new();
        let mut fallbacks = Vec::new();
        let mut warnings = Vec::new();
        for outcome in outcomes {
            warnings.extend(outcome.warning);
            if outcome.result.is_fallback() {
                warnings.push(format!("Scoring failed for prompt #{} of '{}'", outcome.index + 1, scenario.name));
                fallbacks.push(outcome.result);
            } else {
                results.push(outcome.result);
            }
        }

        if !results.is_empty() {
            if let Err(e) = self.results_db.store_evaluation_results(&results) {
                warn!(scenario = %scenario.name, error = %e, "Failed to persist evaluation results");
                warnings.push(format!("Failed to store {} results for '{}': {}", results.len(), scenario.name, e));
            }
        }

        let best: Vec<f64> = results.iter().map(|r| r.best_score()).collect();
        let success_rate = self.success_rate(&best);
        let average_score = mean(&best);
        let insights = scenario_insights(scenario, &results, fallbacks.len(), self.success_score);

        info!(
            scenario = %scenario.name,
            scored = results.len(),
            attempted = total_prompts,
            average_score,
            success_rate,
            "Scenario complete"
        );

        ScenarioResult {
            scenario: scenario.clone(),
            results,
            fallbacks,
            prompts_attempted: total_prompts,
            success_rate,
            average_score,
            insights,
            warnings,
        }
    }

    async fn evaluate_prompt(&self, scenario: &Scenario, index: usize, prompt: &TestPrompt) -> PromptOutcome {
        debug!(scenario = %scenario.name, prompt = index + 1, "Generating assistant response");

        let (response, assistant_error) =
            match tokio::time::timeout(self.assistant_timeout, self.assistant.respond(scenario, prompt)).await {
                Ok(Ok(response)) => (response, None),
                Ok(Err(e)) => (String::new(), Some(format!("{:#}", e))),
                Err(_) => (
                    String::new(),
                    Some(format!("assistant timed out after {}s", self.assistant_timeout.as_secs())),
                ),
            };

        let warning = assistant_error.as_ref().map(|error| {
            warn!(scenario = %scenario.name, prompt = index + 1, error = %error, "Assistant failed, scoring an empty response");
            format!("Assistant failed for prompt #{} of '{}': {}", index + 1, scenario.name, error)
        });

        debug!(scenario = %scenario.name, prompt = index + 1, "Scoring response");
        let mut result = self
            .scoring_agent
            .evaluate_response(scenario, &prompt.prompt, &response, &scenario.expected_behaviors)
            .await;

        if let Some(error) = assistant_error {
            result = result.with_metadata("assistant_error", json!(error));
        }
        if let Some(intent) = &prompt.intent {
            result = result.with_metadata("intent", json!(intent));
        }

        PromptOutcome { index, result, warning }
    }

    /// Run scenarios in order and summarise them as one batch
    pub async fn run_batch(&self, scenarios: &[Scenario]) -> BatchResult {
        let batch_id = format!("batch_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let started_at = now_timestamp();
        info!(batch_id = %batch_id, scenarios = scenarios.len(), "Starting batch");

        let mut scenario_results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            scenario_results.push(self.run_scenario(scenario).await);
        }

        let results: Vec<EvaluationResult> = scenario_results
            .iter()
            .flat_map(|s| s.results.iter().cloned())
            .collect();
        let best: Vec<f64> = results.iter().map(|r| r.best_score()).collect();

        let summary = BatchSummary {
            total_scenarios: scenario_results.len(),
            total_evaluations: results.len(),
            attempted_evaluations: scenario_results.iter().map(|s| s.prompts_attempted).sum(),
            average_score: mean(&best),
            success_rate: self.success_rate(&best),
            score_distribution: ScoreDistribution::from_scores(&best),
        };

        let mut warnings: Vec<String> = scenario_results
            .iter()
            .flat_map(|s| s.warnings.iter().cloned())
            .collect();

        if summary.total_evaluations > 0 {
            let metrics = [
                ("batch.average_score", summary.average_score),
                ("batch.success_rate", summary.success_rate),
            ];
            for (name, value) in metrics {
                if let Err(e) =
                    self.results_db
                        .store_performance_metric(name, value, &self.code_version, &self.model_version)
                {
                    warn!(metric = name, error = %e, "Failed to store performance metric");
                    warnings.push(format!("Failed to store metric {}: {}", name, e));
                }
            }
        }

        let insights = batch_insights(&scenario_results, &summary);
        let performance_alerts = self.check_alerts(&summary);
        for alert in &performance_alerts {
            warn!(batch_id = %batch_id, alert = %alert, "Performance alert");
        }

        info!(
            batch_id = %batch_id,
            scored = summary.total_evaluations,
            attempted = summary.attempted_evaluations,
            average_score = summary.average_score,
            success_rate = summary.success_rate,
            "Batch complete"
        );

        BatchResult {
            batch_id,
            started_at,
            scenarios: scenario_results,
            results,
            summary,
            insights,
            performance_alerts,
            warnings,
        }
    }

    /// Alert messages for a batch summary
    pub fn check_alerts(&self, summary: &BatchSummary) -> Vec<String> {
        self.thresholds
            .evaluate(summary)
            .into_iter()
            .map(|alert| alert.message)
            .collect()
    }

    /// Bundle the batch with trend analysis over stored history, regressions
    /// against results stored before the batch, and recommendations
    pub async fn generate_report(&self, batch: &BatchResult) -> EvaluationReport {
        let history = match self.results_db.get_recent_results(self.history_limit) {
            Ok(history) if !history.is_empty() => history,
            Ok(_) => batch.results.clone(),
            Err(e) => {
                warn!(error = %e, "Failed to load result history, analysing this batch only");
                batch.results.clone()
            }
        };
        let baseline = self
            .results_db
            .get_results_before(&batch.started_at, self.history_limit)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to load baseline results");
                Vec::new()
            });

        let performance_summary = self.analyzer.get_performance_summary(&history);
        let trends = self.analyzer.analyze_performance_trends(&history);
        self.meta_tracker.record_trends(&trends);
        let regressions = self.analyzer.detect_regressions(&batch.results, &baseline);

        let mut insights = self.analyzer.generate_trend_insights(&trends);
        insights.extend(
            self.analyzer
                .generate_regression_insights(&regressions, batch.results.len(), baseline.len()),
        );
        insights.extend(self.accessibility_insights(batch));
        insights.extend(self.reliability_insight(batch));

        for insight in &insights {
            if let Err(e) = self.meta_tracker.track_insight(insight).await {
                warn!(insight_id = %insight.insight_id, error = %e, "Failed to track insight");
            }
        }

        let recommendations = self.meta_tracker.generate_recommendations().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to generate recommendations");
            Vec::new()
        });

        info!(
            batch_id = %batch.batch_id,
            trends = trends.len(),
            regressions = regressions.len(),
            insights = insights.len(),
            recommendations = recommendations.len(),
            "Report generated"
        );

        EvaluationReport {
            batch_result: batch.clone(),
            performance_summary,
            trends,
            regressions,
            trend_view: self.meta_tracker.get_trends(),
            recommendations,
            alerts: batch.performance_alerts.clone(),
        }
    }

    fn success_rate(&self, best_scores: &[f64]) -> f64 {
        if best_scores.is_empty() {
            return 0.0;
        }
        let successes = best_scores.iter().filter(|s| **s >= self.success_score).count();
        successes as f64 / best_scores.len() as f64
    }

    /// Personas with accessibility needs whose accessibility scores miss the success mark
    fn accessibility_insights(&self, batch: &BatchResult) -> Vec<Insight> {
        let mut by_persona: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for scenario_result in &batch.scenarios {
            if scenario_result.scenario.persona.accessibility_needs.is_empty() {
                continue;
            }
            let scores = by_persona.entry(&scenario_result.scenario.persona.name).or_default();
            scores.extend(
                scenario_result
                    .results
                    .iter()
                    .filter_map(|r| r.scores.get("accessibility").copied()),
            );
        }

        by_persona
            .into_iter()
            .filter(|(_, scores)| !scores.is_empty())
            .filter_map(|(persona, scores)| {
                let average = mean(&scores);
                if average >= self.success_score {
                    return None;
                }

                let mut metadata = HashMap::new();
                metadata.insert("area".to_string(), json!("accessibility"));
                metadata.insert("persona".to_string(), json!(persona));
                metadata.insert("average_score".to_string(), json!(average));
                metadata.insert("evaluations".to_string(), json!(scores.len()));

                Some(self.new_insight(
                    InsightType::Accessibility,
                    format!(
                        "Accessibility for {} averages {:.2} over {} evaluations",
                        persona,
                        average,
                        scores.len()
                    ),
                    (0.5 + 0.1 * scores.len() as f64).min(0.9),
                    if average < self.thresholds.alert_threshold { Severity::High } else { Severity::Medium },
                    InsightCategory::Persona,
                    metadata,
                ))
            })
            .collect()
    }

    /// A batch where some prompts could not be scored
    fn reliability_insight(&self, batch: &BatchResult) -> Option<Insight> {
        let attempted = batch.summary.attempted_evaluations;
        let failed = attempted.saturating_sub(batch.summary.total_evaluations);
        if failed == 0 {
            return None;
        }

        let fraction = failed as f64 / attempted as f64;
        let mut metadata = HashMap::new();
        metadata.insert("area".to_string(), json!("scoring"));
        metadata.insert("failed".to_string(), json!(failed));
        metadata.insert("attempted".to_string(), json!(attempted));

        Some(self.new_insight(
            InsightType::Reliability,
            format!("{} of {} prompts could not be scored", failed, attempted),
            (0.5 + fraction).min(0.9),
            if fraction >= 0.5 { Severity::High } else { Severity::Medium },
            InsightCategory::System,
            metadata,
        ))
    }

    fn new_insight(
        &self,
        insight_type: InsightType,
        description: String,
        confidence: f64,
        severity: Severity,
        category: InsightCategory,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Insight {
        Insight {
            insight_id: uuid::Uuid::new_v4().to_string(),
            insight_type,
            description,
            confidence,
            severity,
            category,
            code_version: self.code_version.clone(),
            timestamp: now_timestamp(),
            metadata,
            linked_issues: Vec::new(),
            linked_insights: Vec::new(),
        }
    }
}

fn criterion_averages(results: &[EvaluationResult]) -> BTreeMap<String, f64> {
    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for result in results {
        for (criterion, score) in &result.scores {
            grouped.entry(criterion.clone()).or_default().push(*score);
        }
    }
    grouped.into_iter().map(|(k, v)| (k, mean(&v))).collect()
}

fn scenario_insights(
    scenario: &Scenario,
    results: &[EvaluationResult],
    fallbacks: usize,
    success_score: f64,
) -> Vec<String> {
    let mut insights = Vec::new();
    if fallbacks > 0 {
        insights.push(format!(
            "{} of {} prompts could not be scored",
            fallbacks,
            fallbacks + results.len()
        ));
    }
    if results.is_empty() {
        return insights;
    }

    let averages = criterion_averages(results);
    let weak: Vec<String> = averages
        .iter()
        .filter(|(_, average)| **average < success_score)
        .map(|(criterion, average)| format!("{} ({:.2})", criterion, average))
        .collect();
    if weak.is_empty() {
        insights.push(format!("All criteria met the success mark for {}", scenario.persona.name));
    } else {
        insights.push(format!("Weak criteria: {}", weak.join(", ")));
    }

    if !scenario.persona.accessibility_needs.is_empty() {
        if let Some(accessibility) = averages.get("accessibility") {
            if *accessibility < success_score {
                insights.push(format!(
                    "Accessibility needs of {} ({}) not met: accessibility {:.2}",
                    scenario.persona.name,
                    scenario.persona.accessibility_needs.join(", "),
                    accessibility
                ));
            }
        }
    }

    let covered = scenario
        .expected_behaviors
        .iter()
        .filter(|behavior| results.iter().any(|r| behavior.is_covered_by(&r.assistant_response)))
        .count();
    if !scenario.expected_behaviors.is_empty() {
        insights.push(format!(
            "{} of {} expected behaviors observed",
            covered,
            scenario.expected_behaviors.len()
        ));
    }

    insights
}

fn batch_insights(scenarios: &[ScenarioResult], summary: &BatchSummary) -> Vec<String> {
    let mut insights = vec![format!(
        "{} of {} prompts scored",
        summary.total_evaluations, summary.attempted_evaluations
    )];

    let scored: Vec<&ScenarioResult> = scenarios.iter().filter(|s| !s.results.is_empty()).collect();
    let by_average = |a: &&ScenarioResult, b: &&ScenarioResult| {
        a.average_score
            .partial_cmp(&b.average_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    };
    if scored.len() > 1 {
        if let Some(best) = scored.iter().copied().max_by(by_average) {
            insights.push(format!("Strongest scenario: {} ({:.2})", best.scenario.name, best.average_score));
        }
        if let Some(worst) = scored.iter().copied().min_by(by_average) {
            insights.push(format!("Weakest scenario: {} ({:.2})", worst.scenario.name, worst.average_score));
        }
    }

    let mut by_persona: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for scenario in &scored {
        by_persona
            .entry(&scenario.scenario.persona.name)
            .or_default()
            .extend(scenario.results.iter().map(|r| r.best_score()));
    }
    if by_persona.len() > 1 {
        let persona_means: Vec<(&str, f64)> = by_persona.iter().map(|(p, s)| (*p, mean(s))).collect();
        if let Some((persona, average)) = persona_means
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            insights.push(format!("Lowest scoring persona: {} ({:.2})", persona, average));
        }
    }

    insights
}
