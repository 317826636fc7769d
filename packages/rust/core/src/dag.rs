//! Pipeline DAG: edges inferred from deps/outs, validated, topologically ordered.

use std::collections::{BTreeSet, HashMap};

use spamflow_shared::{ParamsDocument, PipelineDocument, Result, SpamflowError, StageDef};

/// A validated stage graph.
///
/// Stage indices follow declaration order in `pipeline.toml`.
#[derive(Debug, Clone)]
pub struct Dag {
    stages: Vec<StageDef>,
    upstream: Vec<BTreeSet<usize>>,
    downstream: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

/// Strip `./` prefixes and trailing slashes so equal paths compare equal.
pub(crate) fn normalize_path(path: &str) -> &str {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/')
}

/// `dep` names `out` itself or something inside it.
fn depends_on(dep: &str, out: &str) -> bool {
    let (dep, out) = (normalize_path(dep), normalize_path(out));
    dep == out
        || dep
            .strip_prefix(out)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl Dag {
    /// Build and validate the graph.
    ///
    /// Fails with a graph error on duplicate output ownership or a cycle, and
    /// with a config error on an unknown parameter key.
    pub fn build(doc: &PipelineDocument, params: &ParamsDocument) -> Result<Self> {
        doc.check()?;

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for stage in &doc.stages {
            for out in stage.produced_paths() {
                if let Some(owner) = owners.insert(normalize_path(out), stage.name.as_str()) {
                    return Err(SpamflowError::graph(format!(
                        "output '{out}' is declared by both '{owner}' and '{}'",
                        stage.name
                    )));
                }
            }
            for key in &stage.params {
                if params.lookup(key).is_none() {
                    return Err(SpamflowError::config(format!(
                        "stage '{}' consumes unknown parameter '{key}'",
                        stage.name
                    )));
                }
            }
        }

        let n = doc.stages.len();
        let mut upstream = vec![BTreeSet::new(); n];
        let mut downstream = vec![BTreeSet::new(); n];
        for (to, consumer) in doc.stages.iter().enumerate() {
            for (from, producer) in doc.stages.iter().enumerate() {
                let linked = consumer
                    .deps
                    .iter()
                    .any(|dep| producer.produced_paths().any(|out| depends_on(dep, out)));
                if linked {
                    if from == to {
                        return Err(SpamflowError::graph(format!(
                            "stage '{}' depends on its own output",
                            consumer.name
                        )));
                    }
                    upstream[to].insert(from);
                    downstream[from].insert(to);
                }
            }
        }

        let order = topo_sort(&upstream, &downstream).ok_or_else(|| {
            SpamflowError::graph("pipeline contains a cycle")
        })?;

        Ok(Self {
            stages: doc.stages.clone(),
            upstream,
            downstream,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, idx: usize) -> &StageDef {
        &self.stages[idx]
    }

    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Stage indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Direct upstream stages of `idx`.
    pub fn upstream(&self, idx: usize) -> &BTreeSet<usize> {
        &self.upstream[idx]
    }

    pub fn downstream(&self, idx: usize) -> &BTreeSet<usize> {
        &self.downstream[idx]
    }

    /// Named targets plus everything they transitively depend on.
    ///
    /// An empty target list selects the whole graph.
    pub fn select(&self, targets: &[String]) -> Result<BTreeSet<usize>> {
        if targets.is_empty() {
            return Ok((0..self.len()).collect());
        }
        let mut selected = BTreeSet::new();
        let mut stack = Vec::new();
        for name in targets {
            let idx = self
                .index_of(name)
                .ok_or_else(|| SpamflowError::config(format!("unknown stage '{name}'")))?;
            stack.push(idx);
        }
        while let Some(idx) = stack.pop() {
            if selected.insert(idx) {
                stack.extend(self.upstream[idx].iter().copied());
            }
        }
        Ok(selected)
    }

    /// All stages reachable downstream of `idx`, excluding `idx`.
    pub fn descendants(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.downstream[idx].iter().copied().collect();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.downstream[i].iter().copied());
            }
        }
        seen
    }

    /// `(from, to)` stage-name pairs in execution order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.order
            .iter()
            .flat_map(|&to| {
                self.upstream[to].iter().map(move |&from| {
                    (self.stages[from].name.as_str(), self.stages[to].name.as_str())
                })
            })
            .collect()
    }
}

/// Kahn's algorithm; ready stages are taken in declaration order.
fn topo_sort(upstream: &[BTreeSet<usize>], downstream: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut in_degree: Vec<usize> = upstream.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..upstream.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(upstream.len());

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &downstream[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    (order.len() == upstream.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spamflow_shared::Params;

    fn params() -> ParamsDocument {
        ParamsDocument::from_params(Params::default()).unwrap()
    }

    fn stage(name: &str, deps: &[&str], outs: &[&str]) -> StageDef {
        StageDef {
            name: name.into(),
            cmd: format!("echo {name}"),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            outs: outs.iter().map(|s| s.to_string()).collect(),
            params: vec![],
            metrics: None,
        }
    }

    fn doc(stages: Vec<StageDef>) -> PipelineDocument {
        PipelineDocument {
            remote: None,
            stages,
        }
    }

    fn names(dag: &Dag) -> Vec<&str> {
        dag.order().iter().map(|&i| dag.stage(i).name.as_str()).collect()
    }

    #[test]
    fn standard_pipeline_is_linear() {
        let dag = Dag::build(&PipelineDocument::standard("data/external/spam.csv"), &params())
            .expect("build");
        assert_eq!(
            names(&dag),
            vec![
                "data_ingestion",
                "preprocessing",
                "feature_engineering",
                "model_building",
                "model_evaluation"
            ]
        );
        assert_eq!(dag.edges().len(), 5); // evaluation reads both model and features
    }

    #[test]
    fn order_follows_edges_not_declaration() {
        let dag = Dag::build(
            &doc(vec![
                stage("train", &["feat.csv"], &["model.json"]),
                stage("featurize", &["raw.csv"], &["feat.csv"]),
            ]),
            &params(),
        )
        .unwrap();
        assert_eq!(names(&dag), vec!["featurize", "train"]);
    }

    #[test]
    fn independent_stages_keep_declaration_order() {
        let dag = Dag::build(
            &doc(vec![
                stage("b", &[], &["b.out"]),
                stage("a", &[], &["a.out"]),
                stage("c", &["a.out", "b.out"], &["c.out"]),
            ]),
            &params(),
        )
        .unwrap();
        assert_eq!(names(&dag), vec!["b", "a", "c"]);
    }

    #[test]
    fn dep_under_output_directory_is_an_edge() {
        let dag = Dag::build(
            &doc(vec![
                stage("use", &["./data/dir/file.csv"], &["x"]),
                stage("make", &[], &["data/dir/"]),
            ]),
            &params(),
        )
        .unwrap();
        assert_eq!(names(&dag), vec!["make", "use"]);
        // a sibling with a shared prefix is not an edge
        assert!(!depends_on("data/dir2/file.csv", "data/dir"));
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Dag::build(
            &doc(vec![stage("a", &["b.out"], &["a.out"]), stage("b", &["a.out"], &["b.out"])]),
            &params(),
        )
        .unwrap_err();
        assert!(matches!(err, SpamflowError::Graph { .. }));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let looped = doc(vec![stage("a", &["a.out"], &["a.out"])]);
        let err = Dag::build(&looped, &params()).unwrap_err();
        assert!(matches!(err, SpamflowError::Graph { .. }));
    }

    #[test]
    fn shared_output_is_rejected() {
        let err = Dag::build(
            &doc(vec![stage("a", &[], &["x.csv"]), stage("b", &[], &["./x.csv"])]),
            &params(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("x.csv"));
    }

    #[test]
    fn unknown_param_key_is_rejected() {
        let mut s = stage("a", &[], &["a.out"]);
        s.params = vec!["model_building.gamma".into()];
        let err = Dag::build(&doc(vec![s]), &params()).unwrap_err();
        assert!(matches!(err, SpamflowError::Config { .. }));
    }

    #[test]
    fn select_includes_upstream_closure() {
        let dag = Dag::build(&PipelineDocument::standard("src.csv"), &params()).unwrap();
        let selected = dag.select(&["feature_engineering".into()]).unwrap();
        assert_eq!(selected, BTreeSet::from([0, 1, 2]));
        assert!(dag.select(&["nope".into()]).is_err());
        assert_eq!(dag.descendants(2), BTreeSet::from([3, 4]));
    }
}
