use crate::config::TestingConfig;
use crate::database::ResultsDatabase;
use crate::error::Result as EvalResult;
use crate::models::{Alert, BatchSummary, EvaluationReport, Severity, TrendType, now_timestamp};
use crate::notifications::NotificationManager;
use crate::stats::mean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub fn new_alert(severity: Severity, alert_type: &str, message: String, key: String) -> Alert {
    Alert {
        severity,
        alert_type: alert_type.to_string(),
        message,
        first_seen: now_timestamp(),
        key,
    }
}

/// Batch-level alert rules
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub alert_threshold: f64,
    pub min_success_rate: f64,
}

impl AlertThresholds {
    pub fn from_config(config: &TestingConfig) -> Self {
        Self {
            alert_threshold: config.alert_threshold,
            min_success_rate: config.min_success_rate,
        }
    }

    /// Alerts for one batch summary. A batch with nothing scored gets a single
    /// alert instead of average and success-rate alerts computed over nothing.
    pub fn evaluate(&self, summary: &BatchSummary) -> Vec<Alert> {
        if summary.total_evaluations == 0 {
            return vec![new_alert(
                Severity::Critical,
                "performance",
                format!(
                    "No evaluations were scored (0 of {} prompts)",
                    summary.attempted_evaluations
                ),
                "batch.no_scored_evaluations".to_string(),
            )];
        }

        let mut alerts = Vec::new();
        if summary.average_score < self.alert_threshold {
            let severity = if summary.average_score < self.alert_threshold - 1.0 {
                Severity::Critical
            } else {
                Severity::High
            };
            alerts.push(new_alert(
                severity,
                "performance",
                format!(
                    "Average score {:.2} is below the alert threshold {:.2}",
                    summary.average_score, self.alert_threshold
                ),
                "batch.average_below_threshold".to_string(),
            ));
        }

        if summary.success_rate < self.min_success_rate {
            alerts.push(new_alert(
                Severity::High,
                "performance",
                format!(
                    "Success rate {:.1}% is below the minimum {:.1}%",
                    summary.success_rate * 100.0,
                    self.min_success_rate * 100.0
                ),
                "batch.success_rate_below_threshold".to_string(),
            ));
        }

        alerts
    }
}

/// Delivery outcome for one alert; `channels` is empty when debounced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub key: String,
    pub severity: Severity,
    pub channels: BTreeMap<String, bool>,
    pub suppressed: bool,
}

/// Turns report conditions into notifications
pub struct AlertSystem {
    thresholds: AlertThresholds,
    notifications: NotificationManager,
}

impl AlertSystem {
    pub fn new(thresholds: AlertThresholds, notifications: NotificationManager) -> Self {
        Self { thresholds, notifications }
    }

    /// Threshold alerts, then one per regression, then one per serious declining trend
    pub fn alerts_for_report(&self, report: &EvaluationReport) -> Vec<Alert> {
        let mut alerts = self.thresholds.evaluate(&report.batch_result.summary);

        for regression in &report.regressions {
            alerts.push(new_alert(
                regression.severity,
                "regression",
                format!(
                    "{} fell {:.1}% from {:.2} to {:.2}",
                    regression.criterion,
                    regression.decline_percentage,
                    regression.baseline_score,
                    regression.current_score
                ),
                format!("regression.{}", regression.criterion),
            ));
        }

        for (metric, trend) in &report.trends {
            if trend.trend_type == TrendType::Declining && trend.severity >= Severity::High {
                let message = trend
                    .insights
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("{} is declining", metric));
                alerts.push(new_alert(trend.severity, "trend", message, format!("trend.{}", metric)));
            }
        }

        alerts
    }

    pub async fn dispatch(&self, alerts: &[Alert]) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let channels = self.notifications.send_notification(alert).await;
            outcomes.push(DispatchOutcome {
                key: alert.key.clone(),
                severity: alert.severity,
                suppressed: channels.is_empty() && self.notifications.has_channels(),
                channels,
            });
        }
        outcomes
    }
}

/// Headline numbers over recent stored results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub overall_score: f64,
    pub total_tests: usize,
    pub success_rate: f64,
    pub last_run: Option<String>,
}

pub struct Dashboard<'a> {
    results_db: &'a ResultsDatabase,
    success_score: f64,
}

impl<'a> Dashboard<'a> {
    pub fn new(results_db: &'a ResultsDatabase, success_score: f64) -> Self {
        Self { results_db, success_score }
    }

    /// Metrics over the latest `window` results; `total_tests` counts the whole store
    pub fn get_key_metrics(&self, window: usize) -> EvalResult<KeyMetrics> {
        let recent = self.results_db.get_recent_results(window)?;
        let total_tests = self.results_db.count_results()?;
        if recent.is_empty() {
            return Ok(KeyMetrics { total_tests, ..KeyMetrics::default() });
        }

        let best: Vec<f64> = recent.iter().map(|r| r.best_score()).collect();
        let successes = best.iter().filter(|s| **s >= self.success_score).count();

        Ok(KeyMetrics {
            overall_score: mean(&best),
            total_tests,
            success_rate: successes as f64 / best.len() as f64,
            last_run: recent.last().map(|r| r.timestamp.clone()),
        })
    }
}
