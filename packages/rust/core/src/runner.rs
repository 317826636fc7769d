//! The pipeline runner: plan, execute, record.
//!
//! Stages run one at a time in topological order. Before each stage the
//! runner recomputes its fingerprint from the files on disk, so a stage
//! downstream of a re-executed stage only runs again if its inputs actually
//! changed. Lock state is saved after every state transition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{error, info, info_span, instrument, warn};

use spamflow_shared::{
    MetricsReport, PARAMS_FILE_NAME, PIPELINE_FILE_NAME, ParamsDocument, PipelineDocument, Result,
    SpamflowError, StageDef, layout,
};
use spamflow_stages::output::{read_json, remove_outputs};
use spamflow_storage::{NewExperiment, Storage};

use crate::dag::Dag;
use crate::executor::StageExecutor;
use crate::fingerprint::{self, Fingerprint, output_hash};
use crate::lock::{LockEntry, LockFile, StageState};

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A loaded project: graph document, parameters, and the validated DAG.
#[derive(Debug, Clone)]
pub struct Pipeline {
    root: PathBuf,
    doc: PipelineDocument,
    params: ParamsDocument,
    dag: Dag,
}

impl Pipeline {
    /// Load `pipeline.toml` and `params.toml` from `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let doc = PipelineDocument::load(&root.join(PIPELINE_FILE_NAME))?;
        let params = ParamsDocument::load(&root.join(PARAMS_FILE_NAME))?;
        Self::from_parts(root, doc, params)
    }

    pub fn from_parts(root: &Path, doc: PipelineDocument, params: ParamsDocument) -> Result<Self> {
        let dag = Dag::build(&doc, &params)?;
        Ok(Self {
            root: root.to_path_buf(),
            doc,
            params,
            dag,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document(&self) -> &PipelineDocument {
        &self.doc
    }

    pub fn params(&self) -> &ParamsDocument {
        &self.params
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(layout::LOCK_FILE)
    }

    pub fn load_lock(&self) -> Result<LockFile> {
        LockFile::load(&self.lock_path())
    }

    /// Every consumed parameter of every stage, keyed by dotted name.
    pub fn consumed_params(&self) -> BTreeMap<String, Value> {
        self.dag
            .stages()
            .iter()
            .flat_map(|s| s.params.iter())
            .filter_map(|key| Some((key.clone(), self.params.lookup(key)?.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Why a stage needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Never run.
    New,
    Forced,
    CommandChanged,
    DepChanged(String),
    ParamChanged(String),
    OutputMissing(String),
    LastRunFailed,
    /// The lock says `running`: a previous run was interrupted.
    Interrupted,
    /// An upstream stage is out of date, so inputs will change.
    UpstreamChanged(String),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("never run"),
            Self::Forced => f.write_str("forced"),
            Self::CommandChanged => f.write_str("command changed"),
            Self::DepChanged(p) => write!(f, "dependency changed: {p}"),
            Self::ParamChanged(k) => write!(f, "parameter changed: {k}"),
            Self::OutputMissing(p) => write!(f, "output missing: {p}"),
            Self::LastRunFailed => f.write_str("last run failed"),
            Self::Interrupted => f.write_str("last run was interrupted"),
            Self::UpstreamChanged(s) => write!(f, "upstream stage out of date: {s}"),
        }
    }
}

/// Compare the current fingerprint and outputs against the lock entry.
pub fn stale_reasons(
    stage: &StageDef,
    fp: &Fingerprint,
    entry: Option<&LockEntry>,
    root: &Path,
) -> Vec<StaleReason> {
    let Some(entry) = entry else {
        return vec![StaleReason::New];
    };

    let mut reasons = Vec::new();
    match entry.state {
        StageState::Failed => reasons.push(StaleReason::LastRunFailed),
        StageState::Running => reasons.push(StaleReason::Interrupted),
        StageState::Stale => reasons.push(StaleReason::New),
        StageState::Success => {}
    }

    if entry.fingerprint != fp.digest {
        let before = reasons.len();
        if entry.cmd != fp.cmd {
            reasons.push(StaleReason::CommandChanged);
        }
        let dep_keys: BTreeSet<&String> = entry.deps.keys().chain(fp.deps.keys()).collect();
        for key in dep_keys {
            if entry.deps.get(key) != fp.deps.get(key) {
                reasons.push(StaleReason::DepChanged(key.clone()));
            }
        }
        let param_keys: BTreeSet<&String> = entry.params.keys().chain(fp.params.keys()).collect();
        for key in param_keys {
            if entry.params.get(key) != fp.params.get(key) {
                reasons.push(StaleReason::ParamChanged(key.clone()));
            }
        }
        if reasons.len() == before {
            reasons.push(StaleReason::CommandChanged);
        }
    }

    for out in stage.produced_paths() {
        if !root.join(out).exists() {
            reasons.push(StaleReason::OutputMissing(out.to_string()));
        }
    }
    reasons
}

/// Up-to-date report for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageStatus {
    pub name: String,
    /// Last recorded state, `Stale` if never run.
    pub state: StageState,
    /// Empty when the stage is up to date.
    pub reasons: Vec<StaleReason>,
}

impl StageStatus {
    pub fn up_to_date(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Report, for every stage in execution order, whether it would run and why.
///
/// Nothing is executed or written.
pub fn status(pipeline: &Pipeline) -> Result<Vec<StageStatus>> {
    let lock = pipeline.load_lock()?;
    let dag = pipeline.dag();
    let mut stale: BTreeSet<usize> = BTreeSet::new();
    let mut report = Vec::with_capacity(dag.len());

    for &idx in dag.order() {
        let stage = dag.stage(idx);
        let entry = lock.get(&stage.name);
        let fp = fingerprint::compute(stage, pipeline.root(), pipeline.params())?;
        let mut reasons = stale_reasons(stage, &fp, entry, pipeline.root());
        reasons.extend(upstream_reasons(dag, idx, &stale));
        if !reasons.is_empty() {
            stale.insert(idx);
        }
        report.push(StageStatus {
            name: stage.name.clone(),
            state: entry.map_or(StageState::Stale, |e| e.state),
            reasons,
        });
    }
    Ok(report)
}

fn upstream_reasons(dag: &Dag, idx: usize, stale: &BTreeSet<usize>) -> Vec<StaleReason> {
    dag.upstream(idx)
        .iter()
        .filter(|u| stale.contains(u))
        .map(|&u| StaleReason::UpstreamChanged(dag.stage(u).name.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callbacks for a run.
pub trait RunObserver: Send + Sync {
    /// A stage is about to execute.
    fn stage_started(&self, name: &str, reasons: &[StaleReason]);
    /// A stage finished with the given outcome (cached, executed, failed...).
    fn stage_finished(&self, run: &StageRun);
    fn done(&self, report: &RunReport);
}

/// No-op observer for headless/test usage.
pub struct SilentProgress;

impl RunObserver for SilentProgress {
    fn stage_started(&self, _name: &str, _reasons: &[StaleReason]) {}
    fn stage_finished(&self, _run: &StageRun) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Options for [`Runner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stages to bring up to date, with their upstream closure. Empty = all.
    pub targets: Vec<String>,
    /// Execute every selected stage regardless of fingerprints.
    pub force: bool,
    /// Report the plan without executing or writing anything.
    pub dry_run: bool,
}

/// What happened to one stage in this invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Up to date; not executed.
    Cached,
    /// Would execute (dry run).
    Planned { reasons: Vec<StaleReason> },
    Executed {
        reasons: Vec<StaleReason>,
        elapsed: Duration,
        metrics: Option<MetricsReport>,
        experiment_id: Option<String>,
    },
    Failed { error: String },
    /// Not attempted because an upstream stage failed.
    Blocked { upstream: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageRun {
    pub name: String,
    pub outcome: StageOutcome,
}

/// Result of a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub stages: Vec<StageRun>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &StageRun> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed { .. }))
    }

    pub fn succeeded(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Executed { .. }))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }
}

/// Executes a [`Pipeline`].
pub struct Runner<'a> {
    pipeline: &'a Pipeline,
    executor: &'a dyn StageExecutor,
    observer: &'a dyn RunObserver,
    tracker: Option<&'a Storage>,
}

impl<'a> Runner<'a> {
    pub fn new(
        pipeline: &'a Pipeline,
        executor: &'a dyn StageExecutor,
        observer: &'a dyn RunObserver,
    ) -> Self {
        Self {
            pipeline,
            executor,
            observer,
            tracker: None,
        }
    }

    /// Record an experiment whenever a metrics-producing stage executes.
    pub fn with_tracker(mut self, tracker: &'a Storage) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Bring the selected stages up to date.
    ///
    /// Stage failures do not abort the run: the failed stage's outputs are
    /// removed, its downstream stages are reported as blocked, and independent
    /// stages still run. A metrics file that cannot be read or recorded fails
    /// its stage the same way. Errors are returned only for problems outside
    /// any stage (unreadable lock file, unknown target).
    #[instrument(
        skip_all,
        fields(
            root = %self.pipeline.root().display(),
            force = options.force,
            dry_run = options.dry_run
        )
    )]
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let start = Instant::now();
        let pipeline = self.pipeline;
        let dag = pipeline.dag();
        let root = pipeline.root();
        let lock_path = pipeline.lock_path();
        let mut lock = pipeline.load_lock()?;

        let selected = dag.select(&options.targets)?;
        let mut report = RunReport::default();
        let mut broken: BTreeSet<usize> = BTreeSet::new();
        // stages that will run in a dry run, for upstream propagation
        let mut planned: BTreeSet<usize> = BTreeSet::new();

        info!(stages = selected.len(), "starting run");

        for &idx in dag.order().iter().filter(|i| selected.contains(i)) {
            let stage = dag.stage(idx);

            if let Some(&up) = dag.upstream(idx).iter().find(|u| broken.contains(u)) {
                broken.insert(idx);
                let upstream = dag.stage(up).name.clone();
                warn!(stage = %stage.name, %upstream, "blocked by failed upstream stage");
                self.finish(&mut report, stage, StageOutcome::Blocked { upstream });
                continue;
            }

            let fp = match fingerprint::compute(stage, root, pipeline.params()) {
                Ok(fp) => fp,
                Err(e) => {
                    broken.insert(idx);
                    error!(stage = %stage.name, error = %e, "cannot fingerprint stage");
                    let outcome = StageOutcome::Failed {
                        error: e.to_string(),
                    };
                    self.finish(&mut report, stage, outcome);
                    continue;
                }
            };

            let reasons = if options.force {
                vec![StaleReason::Forced]
            } else {
                let mut r = stale_reasons(stage, &fp, lock.get(&stage.name), root);
                if options.dry_run {
                    r.extend(upstream_reasons(dag, idx, &planned));
                }
                r
            };

            if reasons.is_empty() {
                info!(stage = %stage.name, "up to date");
                self.finish(&mut report, stage, StageOutcome::Cached);
                continue;
            }

            if options.dry_run {
                planned.insert(idx);
                self.finish(&mut report, stage, StageOutcome::Planned { reasons });
                continue;
            }

            self.observer.stage_started(&stage.name, &reasons);
            lock.set(&stage.name, LockEntry::new(StageState::Running, &fp));
            lock.save(&lock_path)?;

            let stage_start = Instant::now();
            // metrics are read and tracked before the stage counts as a success
            let result = match self.execute(stage) {
                Ok(outs) => match self.record_metrics(stage, &fp).await {
                    Ok(recorded) => Ok((outs, recorded)),
                    Err(e) => {
                        info_span!("stage", name = stage.name.as_str())
                            .in_scope(|| error!(error = %e, "could not record metrics"));
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            let elapsed = stage_start.elapsed();

            match result {
                Ok((outs, (metrics, experiment_id))) => {
                    let mut entry = LockEntry::new(StageState::Success, &fp);
                    entry.outs = outs;
                    lock.set(&stage.name, entry);
                    lock.save(&lock_path)?;

                    info!(
                        stage = %stage.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "stage succeeded"
                    );
                    self.finish(
                        &mut report,
                        stage,
                        StageOutcome::Executed {
                            reasons,
                            elapsed,
                            metrics,
                            experiment_id,
                        },
                    );
                }
                Err(e) => {
                    broken.insert(idx);
                    remove_outputs(root, stage.produced_paths());
                    lock.set(&stage.name, LockEntry::new(StageState::Failed, &fp));
                    lock.save(&lock_path)?;
                    let outcome = StageOutcome::Failed {
                        error: e.to_string(),
                    };
                    self.finish(&mut report, stage, outcome);
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            executed = report.executed().len(),
            failed = report.failed().count(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        self.observer.done(&report);
        Ok(report)
    }

    fn finish(&self, report: &mut RunReport, stage: &StageDef, outcome: StageOutcome) {
        let run = StageRun {
            name: stage.name.clone(),
            outcome,
        };
        self.observer.stage_finished(&run);
        report.stages.push(run);
    }

    /// Run the stage inside its log span and hash what it produced.
    fn execute(&self, stage: &StageDef) -> Result<BTreeMap<String, String>> {
        let root = self.pipeline.root();
        let span = info_span!("stage", name = stage.name.as_str());
        span.in_scope(|| {
            info!(cmd = %stage.cmd, "starting stage");
            let result = self
                .executor
                .execute(stage, root, self.pipeline.params())
                .and_then(|()| {
                    let mut outs = BTreeMap::new();
                    for out in &stage.outs {
                        let hash = output_hash(&root.join(out))?.ok_or_else(|| {
                            SpamflowError::stage_failed(
                                &stage.name,
                                format!("declared output was not produced: {out}"),
                            )
                        })?;
                        outs.insert(out.clone(), hash);
                    }
                    if let Some(metrics) = &stage.metrics {
                        if !root.join(metrics).exists() {
                            return Err(SpamflowError::stage_failed(
                                &stage.name,
                                format!("declared metrics file was not produced: {metrics}"),
                            ));
                        }
                    }
                    Ok(outs)
                });
            if let Err(e) = &result {
                error!(error = %e, "stage failed");
            }
            result
        })
    }

    async fn record_metrics(
        &self,
        stage: &StageDef,
        fp: &Fingerprint,
    ) -> Result<(Option<MetricsReport>, Option<String>)> {
        let Some(path) = &stage.metrics else {
            return Ok((None, None));
        };
        let report: MetricsReport = read_json(&self.pipeline.root().join(path))?;
        let Some(tracker) = self.tracker else {
            return Ok((Some(report), None));
        };

        let params = serde_json::to_value(self.pipeline.consumed_params())
            .map_err(|e| SpamflowError::Storage(e.to_string()))?;
        let experiment = tracker
            .record_experiment(&NewExperiment {
                stage: &stage.name,
                fingerprint: &fp.digest,
                params: &params,
                metrics: &report,
            })
            .await?;
        info!(stage = %stage.name, id = %experiment.id, "recorded experiment");
        Ok((Some(report), Some(experiment.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BuiltinExecutor, ShellExecutor};
    use spamflow_shared::{Label, Params, Record};
    use spamflow_stages::dataset::write_records;

    fn scratch_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spamflow_{prefix}_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn synthetic_dataset(n: usize) -> Vec<Record> {
        const SPAM: [&str; 4] = [
            "WINNER! claim your free prize now, call 0800 555",
            "Free entry to win cash, text WIN to 80086",
            "Urgent: your mobile won a bonus reward, call now",
            "Cash prize waiting, reply CLAIM to collect",
        ];
        const HAM: [&str; 4] = [
            "are we still on for lunch today?",
            "I'll be home late, save me some dinner",
            "can you send me the notes from class",
            "thanks for yesterday, had a great time",
        ];
        (0..n)
            .map(|i| {
                if i % 5 == 0 {
                    Record::new(Label::Spam, format!("{} ref{i}", SPAM[i % 4]))
                } else {
                    Record::new(Label::Ham, format!("{} msg{i}", HAM[i % 4]))
                }
            })
            .collect()
    }

    fn project(params: Params) -> Pipeline {
        let root = scratch_dir("runner");
        write_records(
            &root.join(&params.data_ingestion.source),
            &synthetic_dataset(1000),
        )
        .unwrap();
        let doc = PipelineDocument::standard(&params.data_ingestion.source);
        Pipeline::from_parts(&root, doc, ParamsDocument::from_params(params).unwrap()).unwrap()
    }

    fn with_params(pipeline: &Pipeline, params: Params) -> Pipeline {
        Pipeline::from_parts(
            pipeline.root(),
            pipeline.document().clone(),
            ParamsDocument::from_params(params).unwrap(),
        )
        .unwrap()
    }

    async fn run(pipeline: &Pipeline, options: &RunOptions) -> RunReport {
        let executor = BuiltinExecutor::default();
        Runner::new(pipeline, &executor, &SilentProgress)
            .run(options)
            .await
            .expect("run")
    }

    fn all_stages() -> Vec<&'static str> {
        vec![
            "data_ingestion",
            "preprocessing",
            "feature_engineering",
            "model_building",
            "model_evaluation",
        ]
    }

    #[tokio::test]
    async fn full_run_then_cached_rerun() {
        let pipeline = project(Params::default());
        let root = pipeline.root().to_path_buf();

        let first = run(&pipeline, &RunOptions::default()).await;
        assert!(first.succeeded(), "{first:?}");
        assert_eq!(first.executed(), all_stages());

        let train = spamflow_stages::dataset::read_records(&root.join(layout::RAW_TRAIN)).unwrap();
        let test = spamflow_stages::dataset::read_records(&root.join(layout::RAW_TEST)).unwrap();
        assert_eq!((train.len(), test.len()), (800, 200));

        let features =
            spamflow_stages::FeatureTable::read_csv(&root.join(layout::FEATURES_TRAIN)).unwrap();
        assert!(features.width() <= 5000);

        let metrics_bytes = std::fs::read(root.join(layout::METRICS)).unwrap();
        let metrics: MetricsReport = serde_json::from_slice(&metrics_bytes).unwrap();
        assert_eq!(metrics.len(), 4);
        assert!(metrics.values().all(|v| (0.0..=1.0).contains(v)));

        let second = run(&pipeline, &RunOptions::default()).await;
        assert!(second.executed().is_empty());
        assert!(second.stages.iter().all(|s| s.outcome == StageOutcome::Cached));
        assert_eq!(std::fs::read(root.join(layout::METRICS)).unwrap(), metrics_bytes);

        let statuses = status(&pipeline).unwrap();
        assert!(statuses.iter().all(StageStatus::up_to_date));
        assert!(statuses.iter().all(|s| s.state == StageState::Success));
    }

    #[tokio::test]
    async fn forced_rerun_reproduces_identical_metrics() {
        let pipeline = project(Params::default());
        let forced = RunOptions {
            force: true,
            ..Default::default()
        };

        let first = run(&pipeline, &forced).await;
        assert_eq!(first.executed(), all_stages());
        let first_bytes = std::fs::read(pipeline.root().join(layout::METRICS)).unwrap();

        let second = run(&pipeline, &forced).await;
        assert_eq!(second.executed(), all_stages());
        let second_bytes = std::fs::read(pipeline.root().join(layout::METRICS)).unwrap();

        assert_eq!(first_bytes, second_bytes);
    }

    #[tokio::test]
    async fn param_change_reruns_stage_and_downstream_only() {
        let pipeline = project(Params::default());
        let root = pipeline.root().to_path_buf();
        run(&pipeline, &RunOptions::default()).await;

        let raw_before = std::fs::read(root.join(layout::RAW_TRAIN)).unwrap();
        let features_before = std::fs::read(root.join(layout::FEATURES_TRAIN)).unwrap();

        let mut params = Params::default();
        params.model_building.c = 0.25;
        let changed = with_params(&pipeline, params);

        let statuses = status(&changed).unwrap();
        let stale: Vec<&str> = statuses
            .iter()
            .filter(|s| !s.up_to_date())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(stale, vec!["model_building", "model_evaluation"]);
        assert_eq!(
            statuses[3].reasons,
            vec![StaleReason::ParamChanged("model_building.C".into())]
        );

        let report = run(&changed, &RunOptions::default()).await;
        assert_eq!(report.executed(), vec!["model_building", "model_evaluation"]);
        assert_eq!(report.outcome("data_ingestion"), Some(&StageOutcome::Cached));
        assert_eq!(std::fs::read(root.join(layout::RAW_TRAIN)).unwrap(), raw_before);
        assert_eq!(
            std::fs::read(root.join(layout::FEATURES_TRAIN)).unwrap(),
            features_before
        );
    }

    #[tokio::test]
    async fn missing_output_triggers_rerun() {
        let pipeline = project(Params::default());
        run(&pipeline, &RunOptions::default()).await;
        std::fs::remove_file(pipeline.root().join(layout::VECTORIZER)).unwrap();

        let report = run(&pipeline, &RunOptions::default()).await;
        // re-running feature engineering rewrites identical tables, so
        // training and evaluation stay cached
        assert_eq!(report.executed(), vec!["feature_engineering"]);
        assert!(pipeline.root().join(layout::VECTORIZER).exists());
    }

    #[tokio::test]
    async fn targets_force_and_dry_run() {
        let pipeline = project(Params::default());

        let dry = run(
            &pipeline,
            &RunOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(dry.stages.len(), 5);
        assert!(dry.stages.iter().all(|s| matches!(s.outcome, StageOutcome::Planned { .. })));
        assert!(!pipeline.lock_path().exists());
        assert!(!pipeline.root().join(layout::RAW_TRAIN).exists());

        let partial = run(
            &pipeline,
            &RunOptions {
                targets: vec!["preprocessing".into()],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(partial.executed(), vec!["data_ingestion", "preprocessing"]);

        let forced = run(
            &pipeline,
            &RunOptions {
                targets: vec!["data_ingestion".into()],
                force: true,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(forced.executed(), vec!["data_ingestion"]);
        match forced.outcome("data_ingestion") {
            Some(StageOutcome::Executed { reasons, .. }) => {
                assert_eq!(reasons, &vec![StaleReason::Forced]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_blocks_downstream_and_cleans_outputs() {
        let root = scratch_dir("runner");
        let doc = PipelineDocument::parse(
            r#"
[[stages]]
name = "make"
cmd = "echo partial > a.txt && exit 1"
outs = ["a.txt"]

[[stages]]
name = "use"
cmd = "cat a.txt > b.txt"
deps = ["a.txt"]
outs = ["b.txt"]

[[stages]]
name = "other"
cmd = "echo ok > c.txt"
outs = ["c.txt"]
"#,
        )
        .unwrap();
        let params = ParamsDocument::from_params(Params::default()).unwrap();
        let pipeline = Pipeline::from_parts(&root, doc, params).unwrap();

        let report = Runner::new(&pipeline, &ShellExecutor, &SilentProgress)
            .run(&RunOptions::default())
            .await
            .unwrap();
        assert!(!report.succeeded());
        assert!(matches!(report.outcome("make"), Some(StageOutcome::Failed { .. })));
        assert_eq!(
            report.outcome("use"),
            Some(&StageOutcome::Blocked {
                upstream: "make".into()
            })
        );
        assert!(matches!(report.outcome("other"), Some(StageOutcome::Executed { .. })));
        assert!(!root.join("a.txt").exists());

        let lock = pipeline.load_lock().unwrap();
        assert_eq!(lock.get("make").unwrap().state, StageState::Failed);
        assert!(lock.get("use").is_none());

        let statuses = status(&pipeline).unwrap();
        let make = statuses.iter().find(|s| s.name == "make").unwrap();
        assert!(make.reasons.contains(&StaleReason::LastRunFailed));
    }

    #[tokio::test]
    async fn missing_declared_output_fails_stage() {
        let root = scratch_dir("runner");
        let doc = PipelineDocument::parse(
            r#"
[[stages]]
name = "lazy"
cmd = "true"
outs = ["never.txt"]
"#,
        )
        .unwrap();
        let params = ParamsDocument::from_params(Params::default()).unwrap();
        let pipeline = Pipeline::from_parts(&root, doc, params).unwrap();
        let report = Runner::new(&pipeline, &ShellExecutor, &SilentProgress)
            .run(&RunOptions::default())
            .await
            .unwrap();
        match report.outcome("lazy") {
            Some(StageOutcome::Failed { error }) => assert!(error.contains("never.txt")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreadable_metrics_fail_the_stage() {
        let root = scratch_dir("runner");
        let doc = PipelineDocument::parse(
            r#"
[[stages]]
name = "score"
cmd = "echo model > model.bin && echo not-json > metrics.json"
outs = ["model.bin"]
metrics = "metrics.json"
"#,
        )
        .unwrap();
        let params = ParamsDocument::from_params(Params::default()).unwrap();
        let pipeline = Pipeline::from_parts(&root, doc, params).unwrap();

        let report = Runner::new(&pipeline, &ShellExecutor, &SilentProgress)
            .run(&RunOptions::default())
            .await
            .unwrap();
        assert!(matches!(report.outcome("score"), Some(StageOutcome::Failed { .. })));
        assert_eq!(
            pipeline.load_lock().unwrap().get("score").unwrap().state,
            StageState::Failed
        );
        assert!(!root.join("model.bin").exists());
        assert!(!root.join("metrics.json").exists());
    }

    #[tokio::test]
    async fn evaluation_is_tracked_only_when_executed() {
        let pipeline = project(Params::default());
        let db = pipeline.root().join(layout::EXPERIMENTS_DB);
        let tracker = Storage::open(&db).await.unwrap();

        let executor = BuiltinExecutor::default();
        let runner = Runner::new(&pipeline, &executor, &SilentProgress).with_tracker(&tracker);
        let first = runner.run(&RunOptions::default()).await.unwrap();
        let Some(StageOutcome::Executed {
            experiment_id: Some(id),
            ..
        }) = first.outcome("model_evaluation")
        else {
            panic!("evaluation not recorded: {first:?}");
        };

        runner.run(&RunOptions::default()).await.unwrap();
        assert_eq!(tracker.count_experiments().await.unwrap(), 1);

        let experiment = tracker.get_experiment(id).await.unwrap().unwrap();
        assert_eq!(experiment.stage, "model_evaluation");
        assert_eq!(experiment.metrics.len(), 4);
        assert_eq!(experiment.params["model_building.C"], 1.0);
    }
}
