//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, info_span, warn};

use spamflow_core::artifacts::{pull_outputs, push_outputs, resolve_remote};
use spamflow_core::{
    BuiltinExecutor, Pipeline, RunObserver, RunOptions, RunReport, Runner, StageLogLayer,
    StageOutcome, StageRun, StaleReason, TransferSummary, status,
};
use spamflow_shared::{
    MetricsReport, PARAMS_FILE_NAME, PIPELINE_FILE_NAME, Params, ParamsDocument,
    PipelineDocument, layout,
};
use spamflow_stages::output::read_json;
use spamflow_stages::{StageKind, run_stage};
use spamflow_storage::{Experiment, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// spamflow: reproducible spam/ham text classification.
#[derive(Parser)]
#[command(
    name = "spamflow",
    version,
    about = "Run the spam classifier pipeline with cached, reproducible stages.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Project root holding pipeline.toml and params.toml.
    #[arg(long, env = "SPAMFLOW_ROOT", default_value = ".", global = true)]
    pub root: PathBuf,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Write default params.toml and pipeline.toml into the project root.
    Init {
        /// Labelled source CSV (defaults to data/external/spam.csv).
        #[arg(long)]
        source: Option<String>,

        /// Overwrite existing documents.
        #[arg(long)]
        force: bool,
    },

    /// Bring the pipeline up to date, running only stale stages.
    Repro {
        /// Stages to reproduce, with everything upstream of them. Defaults to all.
        targets: Vec<String>,

        /// Run selected stages even if they are up to date.
        #[arg(short, long)]
        force: bool,

        /// Print the plan without executing anything.
        #[arg(long)]
        dry_run: bool,

        /// Do not record the run in the experiment database.
        #[arg(long)]
        no_track: bool,
    },

    /// Show which stages are out of date and why.
    Status,

    /// Print the execution order and the dependency edges.
    Dag,

    /// Run a single built-in stage directly, without caching.
    Stage {
        /// One of data_ingestion, preprocessing, feature_engineering,
        /// model_building, model_evaluation.
        name: String,
    },

    /// Upload every output recorded in pipeline.lock to the remote.
    Push {
        /// Remote directory (overrides [remote] path in pipeline.toml).
        #[arg(long, env = "SPAMFLOW_REMOTE")]
        remote: Option<PathBuf>,
    },

    /// Restore every output recorded in pipeline.lock from the remote.
    Pull {
        /// Remote directory (overrides [remote] path in pipeline.toml).
        #[arg(long, env = "SPAMFLOW_REMOTE")]
        remote: Option<PathBuf>,
    },

    /// Inspect the latest evaluation metrics.
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },

    /// Inspect the parameter document.
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },

    /// Query the experiment database.
    Experiments {
        #[command(subcommand)]
        action: ExperimentsAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum MetricsAction {
    /// Print reports/metrics.json.
    Show,
}

#[derive(Subcommand)]
pub(crate) enum ParamsAction {
    /// Print the resolved parameters, defaults applied.
    Show,
}

/// Experiment database subcommands.
#[derive(Subcommand)]
pub(crate) enum ExperimentsAction {
    /// List recorded experiments, newest first.
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Print one experiment as JSON.
    Show {
        id: String,
    },
    /// Rank experiments by a metric, highest first.
    Best {
        #[arg(short, long, default_value = "f1")]
        metric: String,

        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
///
/// Console output goes to stderr; events inside a stage span are also
/// appended to `<root>/logs/<stage>.log`.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "spamflow=info",
        1 => "spamflow=debug",
        _ => "spamflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(StageLogLayer::new(cli.root.join(layout::LOG_DIR)));

    match cli.log_format {
        LogFormat::Text => {
            registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { source, force } => cmd_init(root, source.as_deref(), force),
        Command::Repro {
            targets,
            force,
            dry_run,
            no_track,
        } => {
            let options = RunOptions {
                targets,
                force,
                dry_run,
            };
            cmd_repro(root, &options, no_track).await
        }
        Command::Status => cmd_status(root),
        Command::Dag => cmd_dag(root),
        Command::Stage { name } => cmd_stage(root, &name),
        Command::Push { remote } => cmd_push(root, remote.as_deref()),
        Command::Pull { remote } => cmd_pull(root, remote.as_deref()),
        Command::Metrics { action } => match action {
            MetricsAction::Show => cmd_metrics_show(root),
        },
        Command::Params { action } => match action {
            ParamsAction::Show => cmd_params_show(root),
        },
        Command::Experiments { action } => match action {
            ExperimentsAction::List { limit } => cmd_experiments_list(root, limit).await,
            ExperimentsAction::Show { id } => cmd_experiments_show(root, &id).await,
            ExperimentsAction::Best { metric, limit } => {
                cmd_experiments_best(root, &metric, limit).await
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_init(root: &Path, source: Option<&str>, force: bool) -> Result<()> {
    let params_path = root.join(PARAMS_FILE_NAME);
    let pipeline_path = root.join(PIPELINE_FILE_NAME);
    for path in [&params_path, &pipeline_path] {
        if path.exists() && !force {
            return Err(eyre!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ));
        }
    }

    let mut params = Params::default();
    if let Some(source) = source {
        params.data_ingestion.source = source.to_string();
    }
    let params = ParamsDocument::from_params(params)?;
    let source = params.params.data_ingestion.source.clone();
    let pipeline = PipelineDocument::standard(&source);

    std::fs::create_dir_all(root)?;
    std::fs::write(&params_path, params.to_toml()?)?;
    std::fs::write(&pipeline_path, pipeline.to_toml()?)?;
    if let Some(parent) = root.join(&source).parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(root = %root.display(), %source, "initialized project");
    println!("Wrote {}", params_path.display());
    println!("Wrote {}", pipeline_path.display());
    println!("Place the labelled dataset at {source}, then run `spamflow repro`.");
    Ok(())
}

async fn cmd_repro(root: &Path, options: &RunOptions, no_track: bool) -> Result<()> {
    let pipeline = Pipeline::load(root)?;
    let executor = BuiltinExecutor::default();
    let progress = CliProgress::new();

    let tracker = if options.dry_run || no_track {
        None
    } else {
        Some(Storage::open(&root.join(layout::EXPERIMENTS_DB)).await?)
    };

    let mut runner = Runner::new(&pipeline, &executor, &progress);
    if let Some(tracker) = tracker.as_ref() {
        runner = runner.with_tracker(tracker);
    }
    let report = runner.run(options).await?;

    print_report(&report);

    let failed: Vec<&str> = report.failed().map(|s| s.name.as_str()).collect();
    if !failed.is_empty() {
        return Err(eyre!(
            "{} stage(s) failed: {} (see {}/)",
            failed.len(),
            failed.join(", "),
            layout::LOG_DIR
        ));
    }
    Ok(())
}

fn cmd_status(root: &Path) -> Result<()> {
    let pipeline = Pipeline::load(root)?;
    let report = status(&pipeline)?;
    for stage in &report {
        if stage.up_to_date() {
            println!("  {:<22} up to date", stage.name);
        } else {
            println!(
                "  {:<22} {} ({})",
                stage.name,
                stage.state,
                join_reasons(&stage.reasons)
            );
        }
    }
    if report.iter().all(|s| s.up_to_date()) {
        println!();
        println!("  Pipeline is up to date.");
    }
    Ok(())
}

fn cmd_dag(root: &Path) -> Result<()> {
    let pipeline = Pipeline::load(root)?;
    let dag = pipeline.dag();

    println!("Execution order:");
    for (pos, &idx) in dag.order().iter().enumerate() {
        let stage = dag.stage(idx);
        println!("  {}. {:<22} {}", pos + 1, stage.name, stage.cmd);
    }
    println!();
    println!("Edges:");
    for (from, to) in dag.edges() {
        println!("  {from} -> {to}");
    }
    Ok(())
}

fn cmd_stage(root: &Path, name: &str) -> Result<()> {
    let kind: StageKind = name.parse()?;
    let params = ParamsDocument::load(&root.join(PARAMS_FILE_NAME))?;

    let span = info_span!("stage", name = kind.name());
    let _guard = span.enter();
    match run_stage(kind, root, &params.params) {
        Ok(outcome) => {
            info!("{outcome}");
            println!("{kind}: {outcome}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "stage failed");
            Err(e.into())
        }
    }
}

fn cmd_push(root: &Path, remote: Option<&Path>) -> Result<()> {
    let pipeline = Pipeline::load(root)?;
    let store = resolve_remote(pipeline.document(), remote, root)?;
    let lock = pipeline.load_lock()?;
    if lock.stages.is_empty() {
        warn!("pipeline.lock records no outputs; run `spamflow repro` first");
    }

    let summary = push_outputs(&store, root, &lock)?;
    print_transfer("Pushed", &summary, store.root());
    Ok(())
}

fn cmd_pull(root: &Path, remote: Option<&Path>) -> Result<()> {
    let pipeline = Pipeline::load(root)?;
    let store = resolve_remote(pipeline.document(), remote, root)?;
    let lock = pipeline.load_lock()?;
    if lock.stages.is_empty() {
        warn!("pipeline.lock records no outputs; nothing to pull");
    }

    let summary = pull_outputs(&store, root, &lock)?;
    print_transfer("Pulled", &summary, store.root());
    Ok(())
}

fn cmd_metrics_show(root: &Path) -> Result<()> {
    let path = root.join(layout::METRICS);
    if !path.is_file() {
        return Err(eyre!(
            "no metrics at {}; run `spamflow repro` first",
            path.display()
        ));
    }
    let report: MetricsReport = read_json(&path)?;
    print_metrics(&report);
    Ok(())
}

fn cmd_params_show(root: &Path) -> Result<()> {
    let params = ParamsDocument::load(&root.join(PARAMS_FILE_NAME))?;
    println!("{}", params.to_toml()?);
    Ok(())
}

async fn cmd_experiments_list(root: &Path, limit: usize) -> Result<()> {
    let storage = Storage::open_readonly(&root.join(layout::EXPERIMENTS_DB)).await?;
    let experiments = storage.list_experiments(limit).await?;
    if experiments.is_empty() {
        println!("No experiments recorded yet.");
        return Ok(());
    }
    let total = storage.count_experiments().await?;
    for experiment in &experiments {
        print_experiment_row(experiment);
    }
    println!();
    println!("  {} of {total} experiment(s)", experiments.len());
    Ok(())
}

async fn cmd_experiments_show(root: &Path, id: &str) -> Result<()> {
    let storage = Storage::open_readonly(&root.join(layout::EXPERIMENTS_DB)).await?;
    let experiment = storage
        .get_experiment(id)
        .await?
        .ok_or_else(|| eyre!("no experiment with id '{id}'"))?;
    println!("{}", serde_json::to_string_pretty(&experiment)?);
    Ok(())
}

async fn cmd_experiments_best(root: &Path, metric: &str, limit: usize) -> Result<()> {
    let storage = Storage::open_readonly(&root.join(layout::EXPERIMENTS_DB)).await?;
    let experiments = storage.best_by_metric(metric, limit).await?;
    if experiments.is_empty() {
        println!("No experiments record '{metric}'.");
        return Ok(());
    }
    for experiment in &experiments {
        print_experiment_row(experiment);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn join_reasons(reasons: &[StaleReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe(outcome: &StageOutcome) -> String {
    match outcome {
        StageOutcome::Cached => "up to date".to_string(),
        StageOutcome::Planned { reasons } => format!("would run ({})", join_reasons(reasons)),
        StageOutcome::Executed {
            reasons,
            elapsed,
            experiment_id,
            ..
        } => {
            let mut line = format!(
                "ran in {:.1}s ({})",
                elapsed.as_secs_f64(),
                join_reasons(reasons)
            );
            if let Some(id) = experiment_id {
                line.push_str(&format!(", experiment {id}"));
            }
            line
        }
        StageOutcome::Failed { error } => format!("FAILED: {error}"),
        StageOutcome::Blocked { upstream } => format!("blocked by {upstream}"),
    }
}

fn print_report(report: &RunReport) {
    println!();
    let metrics = report.stages.iter().find_map(|s| match &s.outcome {
        StageOutcome::Executed {
            metrics: Some(m), ..
        } => Some(m),
        _ => None,
    });
    if let Some(metrics) = metrics {
        print_metrics(metrics);
        println!();
    }
    println!(
        "  {} stage(s) executed in {:.1}s",
        report.executed().len(),
        report.elapsed.as_secs_f64()
    );
}

fn print_metrics(report: &MetricsReport) {
    for (name, value) in report {
        println!("  {name:<10} {value:.4}");
    }
}

fn print_transfer(verb: &str, summary: &TransferSummary, remote: &Path) {
    println!(
        "  {verb} {} object(s), {} already in place ({})",
        summary.transferred,
        summary.unchanged,
        remote.display()
    );
    for skipped in &summary.skipped {
        println!("  skipped {skipped}");
    }
}

fn print_experiment_row(experiment: &Experiment) {
    let metrics: Vec<String> = experiment
        .metrics
        .iter()
        .map(|(k, v)| format!("{k}={v:.4}"))
        .collect();
    println!(
        "  {}  {}  {}",
        experiment.id,
        experiment.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        metrics.join(" ")
    );
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Run observer drawing an indicatif spinner and one line per finished stage.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunObserver for CliProgress {
    fn stage_started(&self, name: &str, reasons: &[StaleReason]) {
        self.spinner
            .set_message(format!("{name} ({})", join_reasons(reasons)));
    }

    fn stage_finished(&self, run: &StageRun) {
        self.spinner
            .println(format!("  {:<22} {}", run.name, describe(&run.outcome)));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("spamflow_cli_{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repro_flags() {
        let cli = Cli::parse_from([
            "spamflow",
            "--root",
            "proj",
            "repro",
            "model_building",
            "--force",
            "--dry-run",
        ]);
        assert_eq!(cli.root, PathBuf::from("proj"));
        match cli.command {
            Command::Repro {
                targets,
                force,
                dry_run,
                no_track,
            } => {
                assert_eq!(targets, vec!["model_building".to_string()]);
                assert!(force && dry_run && !no_track);
            }
            _ => panic!("expected repro"),
        }
    }

    #[test]
    fn init_writes_loadable_documents() {
        let root = scratch_dir();
        cmd_init(&root, Some("data/external/sms.csv"), false).unwrap();

        let pipeline = Pipeline::load(&root).unwrap();
        assert_eq!(pipeline.dag().len(), 5);
        assert_eq!(
            pipeline.params().params.data_ingestion.source,
            "data/external/sms.csv"
        );
        assert!(root.join("data/external").is_dir());

        assert!(cmd_init(&root, None, false).is_err());
        cmd_init(&root, None, true).unwrap();
    }

    #[test]
    fn describes_outcomes() {
        assert_eq!(describe(&StageOutcome::Cached), "up to date");
        assert_eq!(
            describe(&StageOutcome::Blocked {
                upstream: "preprocessing".into()
            }),
            "blocked by preprocessing"
        );
        assert_eq!(
            describe(&StageOutcome::Planned {
                reasons: vec![StaleReason::New, StaleReason::Forced]
            }),
            "would run (never run; forced)"
        );
    }
}
