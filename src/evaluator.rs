use crate::assistant::{first_choice_content, openai_client};
use crate::config::{CalibrationConfig, RoutingPolicy, ScoringConfig, StrategyKind, TestingConfig};
use crate::error::{EvalError, Result as EvalResult};
use crate::models::{Difficulty, EvaluationResult, ExpectedBehavior, Scenario, now_timestamp};
use crate::rate_limit::RateLimiter;
use anyhow::{Context, Result, bail};
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_SCORE: f64 = 5.0;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One weighted scoring criterion
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub weight: f64,
    pub description: String,
}

/// Fixed set of weighted criteria applied to every evaluation
#[derive(Debug, Clone)]
pub struct Rubric {
    criteria: BTreeMap<String, Criterion>,
}

impl Rubric {
    /// Build a rubric; weights must be non-negative and sum to 1.0
    pub fn new(criteria: BTreeMap<String, Criterion>) -> EvalResult<Self> {
        if criteria.is_empty() {
            return Err(EvalError::InvalidRubric("rubric has no criteria".to_string()));
        }
        if let Some((name, _)) = criteria.iter().find(|(_, c)| c.weight < 0.0) {
            return Err(EvalError::InvalidRubric(format!("criterion '{}' has a negative weight", name)));
        }

        let rubric = Self { criteria };
        let total = rubric.total_weight();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EvalError::InvalidRubric(format!("weights sum to {:.3}, expected 1.0", total)));
        }

        Ok(rubric)
    }

    /// The calendar assistant rubric
    pub fn standard() -> Self {
        let entries = [
            ("clarity", 0.15, "How clear and understandable is the response?"),
            ("helpfulness", 0.20, "Does the response address the user's needs?"),
            ("efficiency", 0.10, "Is the response concise and actionable?"),
            ("accuracy", 0.15, "Are the suggestions and information correct?"),
            ("persona_alignment", 0.10, "Does the response match the persona's style?"),
            ("goal_achievement", 0.10, "Does the response advance the user's goals?"),
            ("accessibility", 0.10, "How well does it accommodate accessibility needs?"),
            ("error_handling", 0.10, "How gracefully does it handle invalid inputs?"),
        ];

        let criteria = entries
            .iter()
            .map(|(name, weight, description)| {
                (
                    name.to_string(),
                    Criterion { weight: *weight, description: description.to_string() },
                )
            })
            .collect();

        Self { criteria }
    }

    pub fn criteria(&self) -> &BTreeMap<String, Criterion> {
        &self.criteria
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.criteria.keys().map(String::as_str)
    }

    pub fn weight(&self, criterion: &str) -> EvalResult<f64> {
        self.criteria
            .get(criterion)
            .map(|c| c.weight)
            .ok_or_else(|| EvalError::UnknownCriterion(criterion.to_string()))
    }

    pub fn total_weight(&self) -> f64 {
        self.criteria.values().map(|c| c.weight).sum()
    }

    /// Weighted overall score; every score must name a rubric criterion
    pub fn weighted_score(&self, scores: &BTreeMap<String, f64>) -> EvalResult<f64> {
        scores
            .iter()
            .map(|(name, score)| self.weight(name).map(|w| w * score))
            .sum()
    }
}

/// What a strategy is asked to score
pub struct ScoringRequest<'a> {
    pub scenario: &'a Scenario,
    pub prompt: &'a str,
    pub response: &'a str,
    pub expected_behaviors: &'a [ExpectedBehavior],
    pub rubric: &'a Rubric,
    pub model: &'a str,
}

/// Raw strategy output: a score for every rubric criterion plus feedback
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyScores {
    pub scores: BTreeMap<String, f64>,
    pub feedback: String,
}

/// Pluggable way of producing rubric scores
#[async_trait]
pub trait ScoringStrategy: Send + Sync {
    /// Value written to `metadata.evaluation_method`
    fn method(&self) -> &'static str;

    /// Criterion names the strategy refers to on its own, checked against the rubric
    fn declared_criteria(&self) -> Vec<String> {
        Vec::new()
    }

    async fn score(&self, request: &ScoringRequest<'_>) -> Result<StrategyScores>;
}

/// Scores responses with a chat completion model acting as judge
pub struct LlmScoringStrategy {
    api_endpoint: String,
    env_var_api_key: String,
    temperature: f64,
    limiter: RateLimiter,
}

impl LlmScoringStrategy {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            api_endpoint: config.api_endpoint.clone(),
            env_var_api_key: config.env_var_api_key.clone(),
            temperature: config.temperature,
            limiter: RateLimiter::new(config.rate_limit_rps),
        }
    }

    fn build_eval_prompt(&self, request: &ScoringRequest<'_>) -> String {
        let criteria: Vec<String> = request
            .rubric
            .criteria()
            .iter()
            .map(|(name, c)| format!("- {} (weight {:.2}): {}", name, c.weight, c.description))
            .collect();
        let behaviors: Vec<String> = request
            .expected_behaviors
            .iter()
            .map(|b| format!("- {}", b.description))
            .collect();
        let persona = &request.scenario.persona;

        format!(
            "Scenario: {} ({})\nPersona: {} ({})\nAccessibility needs: {}\n\nExpected behaviors:\n{}\n\nCriteria:\n{}\n\nUser Prompt: {}\nResponse to Evaluate: {}\n\nScore every criterion from 0.0 to 5.0 and give detailed feedback. Return JSON with a 'scores' object keyed by criterion and a 'feedback' string.",
            request.scenario.name,
            request.scenario.category,
            persona.name,
            persona.traits.join(", "),
            if persona.accessibility_needs.is_empty() {
                "none".to_string()
            } else {
                persona.accessibility_needs.join(", ")
            },
            if behaviors.is_empty() { "- none specified".to_string() } else { behaviors.join("\n") },
            criteria.join("\n"),
            request.prompt,
            request.response,
        )
    }

    fn build_eval_request(&self, model: &str, full_eval_prompt: &str) -> Result<CreateChatCompletionRequest> {
        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content("You are a strict evaluator of calendar assistant responses. Reply with JSON only.")
            .build()
            .context("Failed to build eval system message")?
            .into();

        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(full_eval_prompt.to_string())
            .build()
            .context("Failed to build eval user message")?
            .into();

        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([system_message, user_message])
            .temperature(self.temperature as f32)
            .build()
            .context("Failed to build eval completion request")
    }

    /// Parse the judge's reply; every rubric criterion must be scored
    fn parse_evaluation_response(&self, response: &str, rubric: &Rubric) -> Result<StrategyScores> {
        let parsed = parse_json_response(response)?;
        let scores = extract_scores(&parsed, rubric)?;
        let feedback = extract_feedback(&parsed)?;
        Ok(StrategyScores { scores, feedback })
    }
}

/// Parse JSON from the response, handling JSON embedded in prose
fn parse_json_response(response: &str) -> Result<Value> {
    match serde_json::from_str(response) {
        Ok(parsed) => Ok(parsed),
        Err(_) => try_extract_embedded_json(response),
    }
}

fn try_extract_embedded_json(response: &str) -> Result<Value> {
    match response.find('{') {
        Some(start) => match response.rfind('}') {
            Some(end) if end > start => serde_json::from_str(&response[start..=end])
                .context("Failed to parse extracted JSON"),
            _ => bail!("Found opening brace but no closing brace in response"),
        },
        None => bail!("No JSON found in response"),
    }
}

fn extract_scores(parsed: &Value, rubric: &Rubric) -> Result<BTreeMap<String, f64>> {
    let scores_obj = parsed
        .get("scores")
        .and_then(|s| s.as_object())
        .context("Evaluation has no 'scores' object")?;

    let mut scores = BTreeMap::new();
    for name in rubric.names() {
        let score = scores_obj
            .get(name)
            .and_then(|s| s.as_f64())
            .with_context(|| format!("Evaluation is missing a numeric score for '{}'", name))?;
        scores.insert(name.to_string(), score.clamp(0.0, MAX_SCORE));
    }

    Ok(scores)
}

fn extract_feedback(parsed: &Value) -> Result<String> {
    match parsed.get("feedback").and_then(|f| f.as_str()).map(str::trim) {
        Some(feedback) if !feedback.is_empty() => Ok(feedback.to_string()),
        _ => bail!("Evaluation has no feedback"),
    }
}

#[async_trait]
impl ScoringStrategy for LlmScoringStrategy {
    fn method(&self) -> &'static str {
        "llm"
    }

    async fn score(&self, request: &ScoringRequest<'_>) -> Result<StrategyScores> {
        self.limiter.acquire().await;

        let client = openai_client(&self.api_endpoint, &self.env_var_api_key)?;
        let full_eval_prompt = self.build_eval_prompt(request);
        let eval_request = self.build_eval_request(request.model, &full_eval_prompt)?;
        let eval_response = client
            .chat()
            .create(eval_request)
            .await
            .context("Failed to generate evaluation response")?;
        let eval_content = first_choice_content(eval_response);

        self.parse_evaluation_response(&eval_content, request.rubric)
    }
}

/// Deterministic scores, for tests and offline runs
pub struct StubScoringStrategy {
    default_score: f64,
    overrides: BTreeMap<String, f64>,
    empty_response_score: f64,
}

impl StubScoringStrategy {
    pub fn uniform(score: f64) -> Self {
        Self {
            default_score: score.clamp(0.0, MAX_SCORE),
            overrides: BTreeMap::new(),
            empty_response_score: 1.0,
        }
    }

    pub fn with_score(mut self, criterion: &str, score: f64) -> Self {
        self.overrides.insert(criterion.to_string(), score.clamp(0.0, MAX_SCORE));
        self
    }

    pub fn with_empty_response_score(mut self, score: f64) -> Self {
        self.empty_response_score = score.clamp(0.0, MAX_SCORE);
        self
    }
}

#[async_trait]
impl ScoringStrategy for StubScoringStrategy {
    fn method(&self) -> &'static str {
        "stub"
    }

    fn declared_criteria(&self) -> Vec<String> {
        self.overrides.keys().cloned().collect()
    }

    async fn score(&self, request: &ScoringRequest<'_>) -> Result<StrategyScores> {
        if request.response.trim().is_empty() {
            let scores = request
                .rubric
                .names()
                .map(|name| (name.to_string(), self.empty_response_score))
                .collect();
            return Ok(StrategyScores {
                scores,
                feedback: "No answer was given; every criterion receives the empty-response score.".to_string(),
            });
        }

        let scores = request
            .rubric
            .names()
            .map(|name| {
                let score = self.overrides.get(name).copied().unwrap_or(self.default_score);
                (name.to_string(), score)
            })
            .collect();

        Ok(StrategyScores {
            scores,
            feedback: format!("Stub evaluation of {} response.", request.scenario.name),
        })
    }
}

pub fn build_strategy(config: &ScoringConfig) -> Box<dyn ScoringStrategy> {
    match config.strategy {
        StrategyKind::Llm => Box::new(LlmScoringStrategy::new(config)),
        StrategyKind::Stub => {
            let stub = config
                .stub_criterion_scores
                .iter()
                .fold(StubScoringStrategy::uniform(config.stub_score), |stub, (criterion, score)| {
                    stub.with_score(criterion, *score)
                });
            Box::new(stub.with_empty_response_score(config.stub_empty_response_score))
        }
    }
}

/// Outcome of the bias checks on one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct BiasReport {
    pub confidence: f64,
    pub needs_review: bool,
    pub reasons: Vec<String>,
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Third model that reviews assistant outputs against the rubric
pub struct ScoringAgent {
    strategy: Box<dyn ScoringStrategy>,
    rubric: Rubric,
    primary_model: String,
    fallback_model: String,
    low_stakes_threshold: f64,
    routing: RoutingPolicy,
    timeout: Duration,
    calibration: CalibrationConfig,
    success_score: f64,
    code_version: String,
}

impl ScoringAgent {
    /// Create an agent over the standard rubric
    pub fn new(config: &TestingConfig, strategy: Box<dyn ScoringStrategy>) -> EvalResult<Self> {
        Self::with_rubric(config, strategy, Rubric::standard())
    }

    pub fn with_rubric(config: &TestingConfig, strategy: Box<dyn ScoringStrategy>, rubric: Rubric) -> EvalResult<Self> {
        for criterion in strategy.declared_criteria() {
            rubric.weight(&criterion)?;
        }

        Ok(Self {
            strategy,
            rubric,
            primary_model: config.scoring.scoring_model.clone(),
            fallback_model: config.scoring.fallback_model.clone(),
            low_stakes_threshold: config.scoring.low_stakes_threshold,
            routing: config.scoring.routing,
            timeout: config.scoring.timeout(),
            calibration: config.scoring.calibration.clone(),
            success_score: config.success_score,
            code_version: config.code_version.clone(),
        })
    }

    pub fn from_config(config: &TestingConfig) -> EvalResult<Self> {
        Self::new(config, build_strategy(&config.scoring))
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Score one assistant response. Never fails: collaborator errors yield a
    /// placeholder result with `evaluation_method = "fallback"`.
    pub async fn evaluate_response(
        &self,
        scenario: &Scenario,
        prompt: &str,
        response: &str,
        expected_behaviors: &[ExpectedBehavior],
    ) -> EvaluationResult {
        let first_model = match self.routing {
            RoutingPolicy::PrimaryOnly => self.primary_model.clone(),
            RoutingPolicy::Cascade => self.fallback_model.clone(),
        };

        let first = match self
            .score_with(scenario, prompt, response, expected_behaviors, &first_model)
            .await
        {
            Ok(first) => first,
            Err(e) => {
                warn!(scenario = %scenario.name, model = %first_model, error = %e, "Scoring failed, using fallback result");
                return self.fallback_result(scenario, prompt, response, &first_model, &e);
            }
        };

        let mut model = first_model;
        let mut outcome = first;
        let mut intermediate_scores = BTreeMap::new();
        let mut escalation_error = None;

        if self.routing == RoutingPolicy::Cascade
            && self.route_to_model(scenario.difficulty, &outcome.scores) == self.primary_model
            && self.primary_model != model
        {
            debug!(scenario = %scenario.name, "Escalating evaluation to primary model");
            let primary = self.primary_model.clone();
            match self
                .score_with(scenario, prompt, response, expected_behaviors, &primary)
                .await
            {
                Ok(escalated) => {
                    intermediate_scores = std::mem::replace(&mut outcome, escalated).scores;
                    model = primary;
                }
                Err(e) => {
                    warn!(scenario = %scenario.name, error = %e, "Escalated scoring failed, keeping preliminary scores");
                    escalation_error = Some(e.to_string());
                }
            }
        }

        let mut scores = outcome.scores;
        let penalized = self.apply_calibration(response, &mut scores, expected_behaviors);
        let bias = self.detect_bias(response, &scores, expected_behaviors);
        if bias.needs_review {
            warn!(
                scenario = %scenario.name,
                confidence = bias.confidence,
                reasons = ?bias.reasons,
                "Evaluation flagged for manual review"
            );
        }

        let mut metadata = HashMap::new();
        metadata.insert("evaluation_method".to_string(), json!(self.strategy.method()));
        metadata.insert("routed_model".to_string(), json!(model));
        metadata.insert("escalated".to_string(), json!(!intermediate_scores.is_empty()));
        metadata.insert("evaluation_confidence".to_string(), json!(bias.confidence));
        metadata.insert("needs_review".to_string(), json!(bias.needs_review));
        if !bias.reasons.is_empty() {
            metadata.insert("bias_reasons".to_string(), json!(bias.reasons));
        }
        if penalized {
            metadata.insert("verbose_penalty_applied".to_string(), json!(true));
        }
        if let Some(error) = escalation_error {
            metadata.insert("escalation_error".to_string(), json!(error));
        }
        if let Ok(weighted) = self.rubric.weighted_score(&scores) {
            metadata.insert("weighted_score".to_string(), json!(weighted));
        }

        EvaluationResult {
            scenario_name: scenario.name.clone(),
            persona_name: scenario.persona.name.clone(),
            prompt: prompt.to_string(),
            assistant_response: response.to_string(),
            scores,
            intermediate_scores,
            feedback: outcome.feedback,
            timestamp: now_timestamp(),
            code_version: self.code_version.clone(),
            model_version: model,
            metadata,
        }
    }

    /// Pick the cheaper model for easy scenarios or clearly good responses
    pub fn route_to_model(&self, difficulty: Difficulty, scores: &BTreeMap<String, f64>) -> &str {
        let best = scores.values().copied().reduce(f64::max).unwrap_or(0.0);
        if difficulty == Difficulty::Easy || best > self.low_stakes_threshold {
            &self.fallback_model
        } else {
            &self.primary_model
        }
    }

    /// Run the strategy with a timeout and check it honored the contract
    async fn score_with(
        &self,
        scenario: &Scenario,
        prompt: &str,
        response: &str,
        expected_behaviors: &[ExpectedBehavior],
        model: &str,
    ) -> Result<StrategyScores> {
        let request = ScoringRequest {
            scenario,
            prompt,
            response,
            expected_behaviors,
            rubric: &self.rubric,
            model,
        };

        let mut outcome = tokio::time::timeout(self.timeout, self.strategy.score(&request))
            .await
            .with_context(|| format!("Scoring timed out after {:?}", self.timeout))??;

        for name in self.rubric.names() {
            match outcome.scores.get_mut(name) {
                Some(score) => *score = score.clamp(0.0, MAX_SCORE),
                None => bail!("Strategy returned no score for '{}'", name),
            }
        }
        outcome.scores.retain(|name, _| self.rubric.criteria().contains_key(name));

        if outcome.feedback.trim().is_empty() {
            bail!("Strategy returned empty feedback");
        }

        Ok(outcome)
    }

    /// Penalize efficiency for long answers that are not complete.
    /// Returns whether a penalty was applied.
    fn apply_calibration(
        &self,
        response: &str,
        scores: &mut BTreeMap<String, f64>,
        expected_behaviors: &[ExpectedBehavior],
    ) -> bool {
        if self.calibration.verbose_penalty <= 0.0
            || word_count(response) <= self.calibration.verbose_word_limit
        {
            return false;
        }

        let behaviors_covered = !expected_behaviors.is_empty()
            && expected_behaviors.iter().all(|b| b.is_covered_by(response));
        let goal_met = scores
            .get("goal_achievement")
            .is_some_and(|s| *s >= self.success_score);
        if behaviors_covered || goal_met {
            return false;
        }

        match scores.get_mut("efficiency") {
            Some(efficiency) => {
                *efficiency = (*efficiency - self.calibration.verbose_penalty).max(0.0);
                true
            }
            None => false,
        }
    }

    /// Estimate how far the evaluation itself can be trusted
    pub fn detect_bias(
        &self,
        response: &str,
        scores: &BTreeMap<String, f64>,
        expected_behaviors: &[ExpectedBehavior],
    ) -> BiasReport {
        if !self.calibration.bias_detection {
            return BiasReport { confidence: 0.9, needs_review: false, reasons: Vec::new() };
        }

        let mut confidence: f64 = 0.9;
        let mut reasons = Vec::new();

        let best = scores.values().copied().reduce(f64::max).unwrap_or(0.0);
        let worst = scores.values().copied().reduce(f64::min).unwrap_or(0.0);

        if response.trim().is_empty() && best >= self.success_score {
            confidence -= 0.4;
            reasons.push("high scores for an empty response".to_string());
        }

        if scores.len() > 1 && best - worst < f64::EPSILON {
            confidence -= 0.15;
            reasons.push("uniform scores across criteria".to_string());
        }

        if best - worst > 3.0 {
            confidence -= 0.2;
            reasons.push("inconsistent scores across criteria".to_string());
        }

        let misses_behaviors = !expected_behaviors.is_empty()
            && !expected_behaviors.iter().any(|b| b.is_covered_by(response));
        if word_count(response) > self.calibration.verbose_word_limit && worst >= 4.5 && misses_behaviors {
            confidence -= 0.25;
            reasons.push("high scores for a long response that misses expected behaviors".to_string());
        }

        let confidence = confidence.clamp(0.0, 1.0);
        BiasReport {
            confidence,
            needs_review: confidence < self.calibration.confidence_threshold,
            reasons,
        }
    }

    fn fallback_result(
        &self,
        scenario: &Scenario,
        prompt: &str,
        response: &str,
        model: &str,
        error: &anyhow::Error,
    ) -> EvaluationResult {
        let scores = self.rubric.names().map(|name| (name.to_string(), 0.0)).collect();

        let mut metadata = HashMap::new();
        metadata.insert("evaluation_method".to_string(), json!("fallback"));
        metadata.insert("routed_model".to_string(), json!(model));
        metadata.insert("error".to_string(), json!(format!("{:#}", error)));
        metadata.insert("evaluation_confidence".to_string(), json!(0.0));
        metadata.insert("needs_review".to_string(), json!(true));

        EvaluationResult {
            scenario_name: scenario.name.clone(),
            persona_name: scenario.persona.name.clone(),
            prompt: prompt.to_string(),
            assistant_response: response.to_string(),
            scores,
            intermediate_scores: BTreeMap::new(),
            feedback: format!("Evaluation could not be completed: {:#}", error),
            timestamp: now_timestamp(),
            code_version: self.code_version.clone(),
            model_version: model.to_string(),
            metadata,
        }
    }
}
