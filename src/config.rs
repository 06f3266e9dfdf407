use crate::models::{Difficulty, ExpectedBehavior, Persona};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration for the evaluation subsystem
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestingConfig {
    /// Version tag stored on every result and insight
    #[serde(default = "default_code_version")]
    pub code_version: String,
    /// Path of the results store, or `:memory:`
    #[serde(default = "default_results_storage")]
    pub results_storage: String,
    /// Path of the insights store, or `:memory:`
    #[serde(default = "default_insights_storage")]
    pub insights_storage: String,
    /// Batch average below this raises an alert
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Batch success rate below this raises an alert
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Best-criterion score counted as a success
    #[serde(default = "default_success_score")]
    pub success_score: f64,
    /// Fractional decline from baseline reported as a regression
    #[serde(default = "default_decline_threshold")]
    pub decline_threshold: f64,
    /// Alerts sharing a key within this window are not re-sent
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: u64,
    /// Stored results considered for trend analysis
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Prompts of one scenario evaluated concurrently
    #[serde(default = "default_max_concurrent_prompts")]
    pub max_concurrent_prompts: usize,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub trends: TrendConfig,
    #[serde(default)]
    pub issue_tracker: Option<IssueTrackerConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioDefinition>,
}

fn default_code_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_results_storage() -> String {
    "results.db".to_string()
}

fn default_insights_storage() -> String {
    "insights.db".to_string()
}

fn default_alert_threshold() -> f64 {
    3.0
}

fn default_min_success_rate() -> f64 {
    0.7
}

fn default_success_score() -> f64 {
    3.5
}

fn default_decline_threshold() -> f64 {
    0.10
}

fn default_debounce_window_secs() -> u64 {
    3600
}

fn default_history_limit() -> usize {
    500
}

fn default_max_concurrent_prompts() -> usize {
    4
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            code_version: default_code_version(),
            results_storage: default_results_storage(),
            insights_storage: default_insights_storage(),
            alert_threshold: default_alert_threshold(),
            min_success_rate: default_min_success_rate(),
            success_score: default_success_score(),
            decline_threshold: default_decline_threshold(),
            debounce_window_secs: default_debounce_window_secs(),
            history_limit: default_history_limit(),
            max_concurrent_prompts: default_max_concurrent_prompts(),
            scoring: ScoringConfig::default(),
            assistant: AssistantConfig::default(),
            trends: TrendConfig::default(),
            issue_tracker: None,
            notifications: NotificationConfig::default(),
            personas: Vec::new(),
            scenarios: Vec::new(),
        }
    }
}

impl TestingConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config: {}", path.display()))?;

        Ok(config)
    }

    /// Reject thresholds outside their meaningful range
    pub fn validate(&self) -> Result<()> {
        let score_bounded = [
            ("alert_threshold", self.alert_threshold),
            ("success_score", self.success_score),
            ("scoring.low_stakes_threshold", self.scoring.low_stakes_threshold),
            ("scoring.stub_score", self.scoring.stub_score),
        ];
        for (name, value) in score_bounded {
            if !(0.0..=5.0).contains(&value) {
                bail!("{} must be within 0.0..=5.0, got {}", name, value);
            }
        }

        let unit_bounded = [
            ("min_success_rate", self.min_success_rate),
            ("decline_threshold", self.decline_threshold),
            ("scoring.calibration.confidence_threshold", self.scoring.calibration.confidence_threshold),
            ("trends.min_insight_confidence", self.trends.min_insight_confidence),
        ];
        for (name, value) in unit_bounded {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within 0.0..=1.0, got {}", name, value);
            }
        }

        if self.max_concurrent_prompts == 0 {
            bail!("max_concurrent_prompts must be at least 1");
        }

        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_window_secs)
    }
}

/// Which scoring strategy backs the scoring agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Llm,
    Stub,
}

/// How the scoring agent picks between the fallback and primary model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Score with the fallback model, escalate to the primary model when the stakes are high
    #[default]
    Cascade,
    PrimaryOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub strategy: StrategyKind,
    /// Higher-fidelity evaluator model
    pub scoring_model: String,
    /// Lower-cost evaluator model
    pub fallback_model: String,
    /// Best score above which an evaluation counts as low stakes
    pub low_stakes_threshold: f64,
    pub routing: RoutingPolicy,
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    pub temperature: f64,
    pub rate_limit_rps: f64,
    pub timeout_secs: u64,
    /// Score the stub strategy assigns to every criterion
    pub stub_score: f64,
    /// Score the stub strategy assigns when the response is empty
    pub stub_empty_response_score: f64,
    /// Per-criterion scores overriding `stub_score`; names must be rubric criteria
    pub stub_criterion_scores: BTreeMap<String, f64>,
    pub calibration: CalibrationConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            scoring_model: "gpt-4o".to_string(),
            fallback_model: "gpt-4o-mini".to_string(),
            low_stakes_threshold: 4.5,
            routing: RoutingPolicy::default(),
            api_endpoint: "https://api.openai.com/v1".to_string(),
            env_var_api_key: "OPENAI_API_KEY".to_string(),
            temperature: 0.1,
            rate_limit_rps: 2.0,
            timeout_secs: 60,
            stub_score: 4.0,
            stub_empty_response_score: 1.0,
            stub_criterion_scores: BTreeMap::new(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl ScoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Efficiency penalty for long, incomplete answers (0.0 disables it)
    pub verbose_penalty: f64,
    /// Word count above which a response counts as long
    pub verbose_word_limit: usize,
    pub bias_detection: bool,
    /// Evaluations below this confidence are flagged for manual review
    pub confidence_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            verbose_penalty: 0.0,
            verbose_word_limit: 250,
            bias_detection: true,
            confidence_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssistantKind {
    #[default]
    OpenAi,
    Canned,
}

/// The assistant under test
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub kind: AssistantKind,
    pub api_endpoint: String,
    pub env_var_api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub rate_limit_rps: f64,
    pub system_prompt: String,
    pub timeout_secs: u64,
    /// Response returned by the canned assistant
    pub canned_response: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            kind: AssistantKind::default(),
            api_endpoint: "https://api.openai.com/v1".to_string(),
            env_var_api_key: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            rate_limit_rps: 10.0,
            system_prompt: "You are a calendar assistant. Help the user create, move and review \
                            events and reminders. Confirm what you scheduled."
                .to_string(),
            timeout_secs: 60,
            canned_response: "I've added that to your calendar.".to_string(),
        }
    }
}

impl AssistantConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Absolute slope (score per evaluation) below which a trend is stable
    pub noise_threshold: f64,
    /// Points required before a metric gets a trend
    pub min_points: usize,
    /// Points at which sample size stops limiting confidence
    pub full_confidence_points: usize,
    /// Trends below this confidence produce no insight
    pub min_insight_confidence: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            noise_threshold: 0.02,
            min_points: 3,
            full_confidence_points: 10,
            min_insight_confidence: 0.6,
        }
    }
}

/// External issue tracker reached over HTTP
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssueTrackerConfig {
    pub url: String,
    #[serde(default)]
    pub env_var_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Per-channel delivery timeout
    pub timeout_secs: u64,
    pub email: EmailConfig,
    pub slack: SlackConfig,
    pub webhook: WebhookConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            email: EmailConfig::default(),
            slack: SlackConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Email delivered through an HTTP mail relay
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub relay_url: Option<String>,
    pub env_var_api_key: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: None,
            env_var_api_key: None,
            from: "calendar-eval@localhost".to_string(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Scenario as written in the config file. Required fields are optional here
/// so one incomplete entry can be skipped without rejecting the whole file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScenarioDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub expected_behaviors: Vec<ExpectedBehavior>,
}

fn default_category() -> String {
    "general".to_string()
}
