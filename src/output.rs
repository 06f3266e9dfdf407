use crate::alerts::{DispatchOutcome, KeyMetrics};
use crate::database::MetricRecord;
use crate::insights_database::InsightsSummary;
use crate::models::{EvaluationReport, Insight, Recommendation, TrendAnalysis, TrendsView};
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const BATCH_HISTORY_SHOWN: usize = 10;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// What `run` prints in JSON mode
#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    report: &'a EvaluationReport,
    notifications: &'a [DispatchOutcome],
}

#[derive(Debug, Serialize)]
struct TrendsOutput<'a> {
    key_metrics: &'a KeyMetrics,
    batch_history: &'a [MetricRecord],
    trend_view: &'a TrendsView,
    trends: &'a BTreeMap<String, TrendAnalysis>,
}

#[derive(Debug, Serialize)]
struct InsightsOutput<'a> {
    summary: &'a InsightsSummary,
    insights: &'a [Insight],
}

/// Lowercase serde name of an enum value
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => name,
        _ => String::new(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

pub fn print_report(report: &EvaluationReport, notifications: &[DispatchOutcome], format: OutputFormat) {
    match format {
        OutputFormat::Plain => println!("{}", render_report(report, notifications)),
        OutputFormat::Json => print_json(&RunOutput { report, notifications }),
    }
}

pub fn print_trends(
    key_metrics: &KeyMetrics,
    batch_history: &[MetricRecord],
    trend_view: &TrendsView,
    trends: &BTreeMap<String, TrendAnalysis>,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Plain => println!("{}", render_trends(key_metrics, batch_history, trend_view, trends)),
        OutputFormat::Json => print_json(&TrendsOutput { key_metrics, batch_history, trend_view, trends }),
    }
}

pub fn print_insights(summary: &InsightsSummary, insights: &[Insight], format: OutputFormat) {
    match format {
        OutputFormat::Plain => println!("{}", render_insights(summary, insights)),
        OutputFormat::Json => print_json(&InsightsOutput { summary, insights }),
    }
}

pub fn print_recommendations(recommendations: &[Recommendation], format: OutputFormat) {
    match format {
        OutputFormat::Plain => println!("{}", render_recommendations(recommendations).join("\n")),
        OutputFormat::Json => print_json(recommendations),
    }
}

pub fn print_connection_results(results: &BTreeMap<String, bool>, format: OutputFormat) {
    match format {
        OutputFormat::Plain => {
            if results.is_empty() {
                println!("No notification channels are enabled.");
            }
            for (channel, ok) in results {
                println!("{:<10} {}", channel, if *ok { "✅ reachable" } else { "❌ unreachable" });
            }
        }
        OutputFormat::Json => print_json(results),
    }
}

fn render_report(report: &EvaluationReport, notifications: &[DispatchOutcome]) -> String {
    let batch = &report.batch_result;
    let summary = &batch.summary;
    let mut lines = vec![
        format!("=== Batch {} ===", batch.batch_id),
        String::new(),
        "📊 SUMMARY".to_string(),
        "----------".to_string(),
        format!(
            "{} of {} prompts scored across {} scenarios",
            summary.total_evaluations, summary.attempted_evaluations, summary.total_scenarios
        ),
        format!("Average score: {:.2}", summary.average_score),
        format!("Success rate:  {:.1}%", summary.success_rate * 100.0),
        format!(
            "Distribution:  excellent {} | good {} | fair {} | poor {}",
            summary.score_distribution.excellent,
            summary.score_distribution.good,
            summary.score_distribution.fair,
            summary.score_distribution.poor
        ),
        String::new(),
        format!("{:<32} {:<8} {:<8} {:<8}", "Scenario", "Scored", "Average", "Success"),
        "-".repeat(58),
    ];

    for scenario in &batch.scenarios {
        lines.push(format!(
            "{:<32} {:<8} {:<8.2} {:<8.1}",
            scenario.scenario.name,
            format!("{}/{}", scenario.results.len(), scenario.prompts_attempted),
            scenario.average_score,
            scenario.success_rate * 100.0
        ));
        for insight in &scenario.insights {
            lines.push(format!("  • {}", insight));
        }
    }

    if !batch.insights.is_empty() {
        lines.push(String::new());
        lines.push("🔎 BATCH INSIGHTS".to_string());
        lines.extend(batch.insights.iter().map(|i| format!("  • {}", i)));
    }

    lines.push(String::new());
    lines.push("🚨 ALERTS".to_string());
    if report.alerts.is_empty() {
        lines.push("  none".to_string());
    }
    lines.extend(report.alerts.iter().map(|a| format!("  • {}", a)));

    lines.push(String::new());
    lines.push("📉 REGRESSIONS".to_string());
    if report.regressions.is_empty() {
        lines.push("  none".to_string());
    }
    for regression in &report.regressions {
        lines.push(format!(
            "  • [{}] {}: {:.2} -> {:.2} ({:.1}% decline)",
            regression.severity.as_str().to_uppercase(),
            regression.criterion,
            regression.baseline_score,
            regression.current_score,
            regression.decline_percentage
        ));
    }

    lines.push(String::new());
    lines.push(format!(
        "📈 OVERALL TREND: {} (confidence {:.2})",
        report.trend_view.performance_trend, report.trend_view.confidence
    ));

    lines.push(String::new());
    lines.push("💡 RECOMMENDATIONS".to_string());
    lines.extend(render_recommendations(&report.recommendations));

    lines.push(String::new());
    lines.push("📣 NOTIFICATIONS".to_string());
    if notifications.is_empty() {
        lines.push("  nothing sent".to_string());
    }
    for outcome in notifications {
        if outcome.suppressed {
            lines.push(format!("  • {}: suppressed (sent recently)", outcome.key));
        } else if outcome.channels.is_empty() {
            lines.push(format!("  • {}: no channels enabled", outcome.key));
        } else {
            let channels: Vec<String> = outcome
                .channels
                .iter()
                .map(|(name, ok)| format!("{} {}", name, if *ok { "ok" } else { "failed" }))
                .collect();
            lines.push(format!("  • {}: {}", outcome.key, channels.join(", ")));
        }
    }

    if !batch.warnings.is_empty() {
        lines.push(String::new());
        lines.push("⚠️  WARNINGS".to_string());
        lines.extend(batch.warnings.iter().map(|w| format!("  • {}", w)));
    }

    lines.join("\n")
}

fn render_trends(
    key_metrics: &KeyMetrics,
    batch_history: &[MetricRecord],
    trend_view: &TrendsView,
    trends: &BTreeMap<String, TrendAnalysis>,
) -> String {
    let mut lines = vec![
        "📊 KEY METRICS".to_string(),
        "--------------".to_string(),
        format!("Overall score: {:.2}", key_metrics.overall_score),
        format!("Total tests:   {}", key_metrics.total_tests),
        format!("Success rate:  {:.1}%", key_metrics.success_rate * 100.0),
        format!("Last run:      {}", key_metrics.last_run.as_deref().unwrap_or("never")),
    ];
    if !batch_history.is_empty() {
        let recent: Vec<String> = batch_history
            .iter()
            .rev()
            .take(BATCH_HISTORY_SHOWN)
            .rev()
            .map(|record| format!("{:.2}", record.value))
            .collect();
        lines.push(format!("Batch averages (oldest first): {}", recent.join(" ")));
    }
    lines.extend([
        String::new(),
        format!(
            "📈 OVERALL TREND: {} (confidence {:.2})",
            trend_view.performance_trend, trend_view.confidence
        ),
    ]);
    if !trend_view.improvement_areas.is_empty() {
        lines.push(format!("Improving: {}", trend_view.improvement_areas.join(", ")));
    }
    if !trend_view.regression_areas.is_empty() {
        lines.push(format!("Declining: {}", trend_view.regression_areas.join(", ")));
    }

    lines.push(String::new());
    if trends.is_empty() {
        lines.push("Not enough history for trend analysis.".to_string());
        return lines.join("\n");
    }

    lines.push(format!(
        "{:<36} {:<10} {:<8} {:<6} {:<6} {:<8}",
        "Metric", "Trend", "Slope", "R²", "Conf", "Severity"
    ));
    lines.push("-".repeat(78));
    for (metric, trend) in trends {
        lines.push(format!(
            "{:<36} {:<10} {:<+8.3} {:<6.2} {:<6.2} {:<8}",
            metric,
            trend.trend_type.to_string(),
            trend.slope,
            trend.r_squared,
            trend.confidence,
            trend.severity.as_str()
        ));
    }
    lines.join("\n")
}

fn render_insights(summary: &InsightsSummary, insights: &[Insight]) -> String {
    let counts = |map: &BTreeMap<String, usize>| -> String {
        map.iter()
            .map(|(k, v)| format!("{} {}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut lines = vec![
        "🔎 INSIGHTS".to_string(),
        "-----------".to_string(),
        format!(
            "{} stored, {} in the last week, average confidence {:.2}",
            summary.total_insights, summary.recent_insights, summary.average_confidence
        ),
    ];
    if summary.total_insights > 0 {
        lines.push(format!("By type:     {}", counts(&summary.by_type)));
        lines.push(format!("By severity: {}", counts(&summary.by_severity)));
        lines.push(format!("By category: {}", counts(&summary.by_category)));
    }

    lines.push(String::new());
    for insight in insights {
        lines.push(format!(
            "[{}] {} ({:.2}) {}",
            insight.severity.as_str().to_uppercase(),
            insight.insight_type,
            insight.confidence,
            insight.description
        ));
        if !insight.linked_issues.is_empty() {
            lines.push(format!("    issues: {}", insight.linked_issues.join(", ")));
        }
    }
    lines.join("\n")
}

fn render_recommendations(recommendations: &[Recommendation]) -> Vec<String> {
    if recommendations.is_empty() {
        return vec!["  none".to_string()];
    }

    recommendations
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "  {}. {} [priority {}, impact {}, effort {}, {}]\n     {}",
                i + 1,
                r.title,
                label(&r.priority),
                label(&r.impact),
                label(&r.effort),
                label(&r.category),
                r.description
            )
        })
        .collect()
}

/// Write the report as pretty JSON, creating parent directories as needed
pub fn save_report(report: &EvaluationReport, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("Failed to serialize report to JSON")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    std::fs::write(path, content).with_context(|| format!("Failed to write report file: {}", path.display()))
}
