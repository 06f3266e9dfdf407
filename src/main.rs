use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod alerts;
mod assistant;
mod config;
mod database;
mod error;
mod evaluation_loop;
mod evaluator;
mod insights_database;
mod meta_tracker;
mod models;
mod notifications;
mod output;
mod rate_limit;
mod scenarios;
mod stats;
mod trend_analyzer;

use crate::alerts::{AlertSystem, AlertThresholds, Dashboard};
use crate::config::TestingConfig;
use crate::database::{ResultsDatabase, StoreLocation};
use crate::evaluation_loop::EvaluationLoop;
use crate::meta_tracker::MetaTracker;
use crate::models::{Insight, InsightCategory, InsightType};
use crate::notifications::NotificationManager;
use crate::output::OutputFormat;
use crate::scenarios::{load_scenarios, select_scenarios};
use crate::trend_analyzer::TrendAnalyzer;

/// Calendar assistant evaluation CLI - score assistant responses, track trends and raise alerts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain", global = true)]
    output: OutputFormat,

    /// Verbose logging - show progress for each prompt
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenarios, store the scores and report trends, regressions and alerts
    Run {
        /// Path to the TOML configuration file
        config: PathBuf,

        /// Only run the named scenario (repeatable)
        #[arg(short, long = "scenario")]
        scenarios: Vec<String>,

        /// Also write the full report as JSON to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Show key metrics and trends over stored results
    Trends {
        config: PathBuf,

        /// Restrict trend analysis to one scenario's results
        #[arg(short, long)]
        scenario: Option<String>,
    },
    /// List stored insights
    Insights {
        config: PathBuf,

        /// Show a single insight by id
        #[arg(long, conflicts_with_all = ["insight_type", "category", "code_version"])]
        id: Option<String>,

        #[arg(long)]
        insight_type: Option<InsightType>,

        #[arg(long)]
        category: Option<InsightCategory>,

        /// Only insights recorded against this code version
        #[arg(long)]
        code_version: Option<String>,

        #[arg(long)]
        min_confidence: Option<f64>,
    },
    /// Recommendations derived from every stored insight
    Recommendations { config: PathBuf },
    /// Check that each enabled notification channel is reachable
    TestNotifications { config: PathBuf },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("calendar_eval={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config_path: &Path, scenario_names: &[String], save: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = TestingConfig::from_file(config_path)?;
    let eval_loop = EvaluationLoop::from_config(&config)?;
    let alert_system = AlertSystem::new(
        AlertThresholds::from_config(&config),
        NotificationManager::from_config(&config)?,
    );

    let (scenarios, mut warnings) = load_scenarios(&config.scenarios, &config.personas);
    let (selected, unknown) = select_scenarios(scenarios, scenario_names);
    warnings.extend(unknown);

    let mut batch = eval_loop.run_batch(&selected).await;
    warnings.append(&mut batch.warnings);
    batch.warnings = warnings;

    let report = eval_loop.generate_report(&batch).await;
    let alerts = alert_system.alerts_for_report(&report);
    let outcomes = alert_system.dispatch(&alerts).await;

    if let Some(path) = save {
        output::save_report(&report, path)?;
        info!(path = %path.display(), "Report saved");
    }

    output::print_report(&report, &outcomes, format);
    Ok(())
}

fn trends(config_path: &Path, scenario: Option<&str>, format: OutputFormat) -> anyhow::Result<()> {
    let config = TestingConfig::from_file(config_path)?;
    let results_db = ResultsDatabase::open(&StoreLocation::parse(&config.results_storage))?;
    let analyzer = TrendAnalyzer::from_config(&config);

    let history = match scenario {
        Some(name) => results_db.get_results_by_scenario(name)?,
        None => results_db.get_recent_results(config.history_limit)?,
    };
    let trends = analyzer.analyze_performance_trends(&history);
    let view = analyzer.trends_view(&trends);
    let key_metrics = Dashboard::new(&results_db, config.success_score).get_key_metrics(config.history_limit)?;
    let batch_history = results_db.get_metric_history("batch.average_score")?;

    output::print_trends(&key_metrics, &batch_history, &view, &trends, format);
    Ok(())
}

struct InsightFilter {
    id: Option<String>,
    insight_type: Option<InsightType>,
    category: Option<InsightCategory>,
    code_version: Option<String>,
    min_confidence: Option<f64>,
}

fn insights(config_path: &Path, filter: InsightFilter, format: OutputFormat) -> anyhow::Result<()> {
    let config = TestingConfig::from_file(config_path)?;
    let tracker = MetaTracker::from_config(&config)?;
    let insights_db = tracker.insights_db();

    let mut selected: Vec<Insight> = if let Some(id) = &filter.id {
        let insight = insights_db
            .get_insight(id)?
            .ok_or_else(|| anyhow!("No insight with id {}", id))?;
        vec![insight]
    } else if let Some(insight_type) = filter.insight_type {
        tracker.get_insights_by_type(insight_type)?
    } else if let Some(code_version) = &filter.code_version {
        tracker.get_insights_by_version(code_version)?
    } else if let Some(category) = filter.category {
        insights_db.get_insights_by_category(category)?
    } else if let Some(min) = filter.min_confidence {
        insights_db.get_high_confidence_insights(min)?
    } else {
        insights_db.get_all_insights()?
    };

    selected.retain(|insight| {
        filter.category.is_none_or(|c| insight.category == c)
            && filter.code_version.as_ref().is_none_or(|v| &insight.code_version == v)
            && filter.min_confidence.is_none_or(|min| insight.confidence >= min)
    });

    output::print_insights(&insights_db.get_insights_summary()?, &selected, format);
    Ok(())
}

fn recommendations(config_path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let config = TestingConfig::from_file(config_path)?;
    let tracker = MetaTracker::from_config(&config)?;
    output::print_recommendations(&tracker.generate_recommendations()?, format);
    Ok(())
}

async fn test_notifications(config_path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let config = TestingConfig::from_file(config_path)?;
    let manager = NotificationManager::from_config(&config)?;
    info!(channels = ?manager.channel_names(), "Probing notification channels");
    output::print_connection_results(&manager.test_connections().await, format);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match &args.command {
        Command::Run { config, scenarios, save } => run(config, scenarios, save.as_deref(), args.output).await,
        Command::Trends { config, scenario } => trends(config, scenario.as_deref(), args.output),
        Command::Insights { config, id, insight_type, category, code_version, min_confidence } => {
            let filter = InsightFilter {
                id: id.clone(),
                insight_type: *insight_type,
                category: *category,
                code_version: code_version.clone(),
                min_confidence: *min_confidence,
            };
            insights(config, filter, args.output)
        }
        Command::Recommendations { config } => recommendations(config, args.output),
        Command::TestNotifications { config } => test_notifications(config, args.output).await,
    }
}
