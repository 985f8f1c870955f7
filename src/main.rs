//! Pipetrace CLI - run the demo pipeline and inspect stored history

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::future::join_all;

use pipetrace::{
    FixSuggestion, FsAdapter, Pipeline, PipetraceConfig, PipetraceError, RunFilter, RunStatus,
    RunTracker, Step, StepHierarchy, StepStatus, StorageAdapter, TimeRange, TimeseriesSummary,
};

#[derive(Parser)]
#[command(name = "pipetrace")]
#[command(about = "Pipetrace - step tracking for nested async pipelines")]
#[command(version)]
struct Cli {
    /// Storage directory (overrides config and PIPETRACE_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bundled demo pipeline and persist it
    Demo {
        /// Multiplier applied to every sleep (0.01 = 100x faster)
        #[arg(long, default_value_t = 1.0)]
        time_scale: f64,

        /// Persist step starts/completions while the run is in flight
        #[arg(long)]
        live: bool,
    },

    /// List runs of a pipeline, newest first
    Runs {
        pipeline: String,

        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Print a run as a step hierarchy (JSON)
    Run { run_id: String },

    /// Print one step of a run (JSON)
    Step {
        run_id: String,
        key: String,

        /// Which of several steps sharing the key (0 = first)
        #[arg(long, default_value_t = 0)]
        occurrence: usize,
    },

    /// List the step keys ever recorded for a pipeline
    Steps { pipeline: String },

    /// Durations of one step across runs
    Timeseries {
        pipeline: String,
        step_key: String,

        /// Only runs from the last N days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Drop runs older than the retention window
    Purge {
        pipeline: String,

        /// Overrides the configured retention
        #[arg(long)]
        days: Option<u32>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match PipetraceConfig::load().and_then(PipetraceConfig::with_env) {
        Ok(mut config) => {
            if let Some(dir) = cli.dir.clone() {
                config.storage.dir = Some(dir);
            }
            config
        }
        Err(e) => fail(e),
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli.command, &config).await {
        fail(e);
    }
}

fn fail(e: PipetraceError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), e);
    if let Some(suggestion) = e.fix_suggestion() {
        eprintln!("  {} {}", "Fix:".yellow(), suggestion);
    }
    std::process::exit(1);
}

async fn dispatch(command: Commands, config: &PipetraceConfig) -> Result<(), PipetraceError> {
    if let Commands::Config = command {
        return print_config(config);
    }

    let adapter = FsAdapter::new(config.storage_dir());
    adapter.connect().await?;

    match command {
        Commands::Demo { time_scale, live } => run_demo(adapter, time_scale, live).await,
        Commands::Runs {
            pipeline,
            status,
            limit,
            offset,
        } => {
            let mut filter = RunFilter::new().with_offset(offset);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            list_runs(&adapter, &pipeline, &filter).await
        }
        Commands::Run { run_id } => show_run(&adapter, &run_id).await,
        Commands::Step {
            run_id,
            key,
            occurrence,
        } => {
            let data = adapter.get_run_data(&run_id).await?;
            let step = data.step(&key, occurrence)?;
            println!("{}", serde_json::to_string_pretty(step)?);
            Ok(())
        }
        Commands::Steps { pipeline } => {
            for key in adapter.list_pipeline_steps(&pipeline).await? {
                println!("{}", key);
            }
            Ok(())
        }
        Commands::Timeseries {
            pipeline,
            step_key,
            days,
        } => {
            let range = days.map(TimeRange::last_days).unwrap_or_else(TimeRange::all);
            show_timeseries(&adapter, &pipeline, &step_key, &range).await
        }
        Commands::Purge { pipeline, days } => {
            let days = days.unwrap_or(config.retention.days);
            let report = adapter.purge_old_data(&pipeline, days).await?;
            println!(
                "{} Purged {} run(s) and {} point(s) older than {} day(s)",
                "✓".green(),
                report.runs_removed,
                report.points_removed,
                days
            );
            Ok(())
        }
        Commands::Config => print_config(config),
    }
}

fn print_config(config: &PipetraceConfig) -> Result<(), PipetraceError> {
    println!(
        "{} {}",
        "config:".dimmed(),
        PipetraceConfig::config_path().display()
    );
    println!("storage.dir    = {}", config.storage_dir().display());
    println!("retention.days = {}", config.retention.days);
    println!("logging.filter = {}", config.log_filter());
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// Demo pipeline
// ═══════════════════════════════════════════════════════════════

async fn pause(ms: u64, scale: f64) {
    let scaled = (ms as f64 * scale.max(0.0)).round() as u64;
    tokio::time::sleep(Duration::from_millis(scaled)).await;
}

async fn fetch_url(step: Step, url: String, ms: u64, scale: f64) -> Result<usize, Infallible> {
    step.record("url", url.as_str());
    pause(ms, scale).await;
    Ok(url.len())
}

async fn run_demo(adapter: FsAdapter, scale: f64, live: bool) -> Result<(), PipetraceError> {
    let tracker = RunTracker::new(Arc::new(adapter)).with_step_persistence(live);
    let pipeline = Pipeline::new("demo");

    println!(
        "{} Running pipeline {} (run {})",
        "→".cyan(),
        pipeline.name().cyan().bold(),
        pipeline.run_id()
    );

    let outcome = tracker
        .track(&pipeline, |main| async move {
            main.step("demo", |st| async move {
                st.record("foo", "bar");
                pause(200, scale).await;
                Ok::<_, Infallible>(())
            })
            .await?;

            main.step("fetch", |st| async move {
                st.step("preprocess", |pre| async move {
                    pre.record("someData", 12345);
                    pause(1000, scale).await;
                    Ok::<_, Infallible>(())
                })
                .await?;

                let parent = &st;
                let plan = [("url1", 1500), ("url2", 3500), ("url3", 500)];
                let fetches = plan.iter().map(move |&(name, ms)| {
                    let url = format!("https://example.com/{}", name);
                    parent.step(name, move |s| fetch_url(s, url, ms, scale))
                });
                let sizes: Result<Vec<usize>, Infallible> =
                    join_all(fetches).await.into_iter().collect();
                Ok::<_, Infallible>(sizes?.iter().sum::<usize>())
            })
            .await
        })
        .await;

    match outcome {
        Ok(bytes) => println!("{} Finished, {} url bytes fetched", "✓".green(), bytes),
        Err(never) => match never {},
    }

    if let Some(tree) = pipeline.to_hierarchy() {
        print_tree(&tree, 0);
    }

    let failures = tracker.persistence_failures();
    if failures > 0 {
        eprintln!(
            "{} {} persistence call(s) failed",
            "⚠".yellow(),
            failures
        );
    }
    Ok(())
}

fn status_label(status: StepStatus) -> colored::ColoredString {
    match status {
        StepStatus::Completed => status.as_str().green(),
        StepStatus::Failed => status.as_str().red(),
        StepStatus::Running => status.as_str().yellow(),
    }
}

fn print_tree(node: &StepHierarchy, depth: usize) {
    let meta = &node.meta;
    let duration = meta
        .time
        .duration_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}{} {} {} {}",
        "  ".repeat(depth),
        meta.name.bold(),
        meta.key.dimmed(),
        status_label(meta.status()),
        duration.cyan()
    );
    if !meta.records.is_empty() {
        println!(
            "{}  {}",
            "  ".repeat(depth),
            serde_json::Value::Object(meta.records.clone())
                .to_string()
                .dimmed()
        );
    }
    if let Some(error) = &meta.error {
        println!("{}  {} {}", "  ".repeat(depth), "error:".red(), error);
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

// ═══════════════════════════════════════════════════════════════
// History queries
// ═══════════════════════════════════════════════════════════════

async fn list_runs(
    adapter: &FsAdapter,
    pipeline: &str,
    filter: &RunFilter,
) -> Result<(), PipetraceError> {
    let runs = adapter.list_runs(pipeline, filter).await?;
    if runs.is_empty() {
        println!("{} No runs for {}", "→".cyan(), pipeline);
        return Ok(());
    }
    for run in runs {
        let started = chrono::DateTime::from_timestamp_millis(run.start_ts)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| run.start_ts.to_string());
        let duration = run
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {:>9}  {}",
            run.run_id,
            started,
            status_label(run.status),
            duration
        );
    }
    Ok(())
}

async fn show_run(adapter: &FsAdapter, run_id: &str) -> Result<(), PipetraceError> {
    let data = adapter.get_run_data(run_id).await?;
    match data.to_hierarchy() {
        Some(tree) => println!("{}", serde_json::to_string_pretty(&tree)?),
        None => println!("{}", serde_json::to_string_pretty(&data.record)?),
    }
    Ok(())
}

async fn show_timeseries(
    adapter: &FsAdapter,
    pipeline: &str,
    step_key: &str,
    range: &TimeRange,
) -> Result<(), PipetraceError> {
    let points = adapter
        .get_pipeline_step_timeseries(pipeline, step_key, range)
        .await?;
    for point in &points {
        let suffix = if point.occurrence > 0 {
            format!(" #{}", point.occurrence)
        } else {
            String::new()
        };
        println!(
            "{}{}  {:>8}ms  {}",
            point.run_id,
            suffix,
            point.duration_ms,
            status_label(point.status)
        );
    }
    match TimeseriesSummary::from_points(&points) {
        Some(summary) => println!(
            "{} n={} min={}ms max={}ms avg={:.1}ms",
            "Σ".cyan(),
            summary.count,
            summary.min_ms,
            summary.max_ms,
            summary.avg_ms
        ),
        None => println!("{} No points for {}", "→".cyan(), step_key),
    }
    Ok(())
}
