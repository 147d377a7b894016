//! Level-by-level parallel execution of the task graph.
//!
//! The orchestrator turns a task graph into an [`ExecutionPlan`] of
//! topological levels and walks them in order:
//!
//! 1. Every node in the current level gets its fingerprint computed; all
//!    upstream fingerprints are already known because dependencies live in
//!    earlier levels.
//! 2. Nodes whose fingerprint matches the recorded one from the last
//!    successful run are marked skipped without spawning anything.
//! 3. The remaining nodes of the level run concurrently on the rayon pool,
//!    results flowing back over an mpsc channel.
//! 4. After the level drains, fingerprints of successful nodes are
//!    recorded. On any non-success, in-flight siblings have already been
//!    allowed to finish, and no further level starts.

use std::collections::HashMap;
use std::sync::mpsc::channel;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::cache::CacheStore;
use crate::config::BuildRequest;
use crate::core::Fingerprint;
use crate::error::BuildError;
use crate::graph::{self, TaskGraph};
use crate::process::{self, CancelToken, ExecStatus, ExecutionResult};

/// Topologically ordered execution levels. Nodes within a level are
/// independent and may run concurrently; a node never appears before all
/// of its dependencies' levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub(crate) levels: Vec<Vec<NodeIndex>>,
}

impl ExecutionPlan {
    /// Node names per level, mostly useful for logging and assertions.
    pub fn level_names(&self, graph: &TaskGraph) -> Vec<Vec<String>> {
        self.levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|&index| graph.node(index).name.to_string())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Success,
    Failed,
    Cancelled,
}

/// Aggregated outcome of one full build invocation. Every node that was
/// executed or skipped appears here; nodes in levels never reached do not.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub results: Vec<ExecutionResult>,
}

impl BuildReport {
    /// Results of nodes that ran and did not succeed.
    pub fn failed(&self) -> Vec<&ExecutionResult> {
        self.results.iter().filter(|r| !r.is_success()).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Schedules and executes a task graph. The fingerprint cache is owned
/// here and only ever touched from the scheduling thread.
pub struct Orchestrator {
    cache_dir: Utf8PathBuf,
    cache: CacheStore,
    workers: Option<usize>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(cache_dir: &Utf8Path, workers: Option<usize>, cancel: CancelToken) -> Self {
        Self {
            cache_dir: cache_dir.to_owned(),
            cache: CacheStore::load(cache_dir),
            workers,
            cancel,
        }
    }

    /// Topological sort with a lexicographic tie-break among nodes whose
    /// dependencies are all satisfied. Deterministic for identical graphs.
    pub fn schedule(&self, graph: &TaskGraph) -> ExecutionPlan {
        ExecutionPlan {
            levels: graph.levels(),
        }
    }

    /// Runs the plan level by level. A failing node lets its in-flight
    /// siblings finish but prevents any further level from starting.
    pub fn execute(
        &mut self,
        graph: &TaskGraph,
        plan: &ExecutionPlan,
        request: &BuildRequest,
    ) -> Result<BuildReport, BuildError> {
        match self.workers {
            Some(count) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(count)
                    .build()?;
                pool.install(|| self.run_levels(graph, plan, request))
            }
            None => self.run_levels(graph, plan, request),
        }
    }

    fn run_levels(
        &mut self,
        graph: &TaskGraph,
        plan: &ExecutionPlan,
        request: &BuildRequest,
    ) -> Result<BuildReport, BuildError> {
        std::fs::create_dir_all(&request.output_dir)?;
        std::fs::create_dir_all(request.aot_dir())?;

        let bar = ProgressBar::new(graph.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );

        let mut fingerprints: HashMap<NodeIndex, Fingerprint> = HashMap::new();
        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut aborted = false;

        for level in &plan.levels {
            if self.cancel.is_cancelled() || aborted {
                break;
            }

            let mut pending = Vec::new();

            for &index in level {
                let node = graph.node(index);
                let fingerprint =
                    graph::fingerprint(node.kind, request, &self.upstream(graph, index, &fingerprints))?;
                fingerprints.insert(index, fingerprint);

                if self.cache.get(&node.name) == Some(fingerprint) {
                    tracing::debug!("Skipping '{}', fingerprint unchanged", node.name);
                    results.push(ExecutionResult::skipped(&node.name));
                    bar.inc(1);
                } else {
                    pending.push(index);
                }
            }

            let (sender, receiver) = channel::<(NodeIndex, ExecutionResult)>();

            rayon::scope(|s| {
                for &index in &pending {
                    let node = graph.node(index);
                    let name = node.name.clone();
                    let invocation = node.invocation.clone();
                    let sender = sender.clone();
                    let cancel = self.cancel.clone();

                    s.spawn(move |_| {
                        let result = process::run(&invocation, &name, &cancel);
                        // The receiver outlives the scope, the send cannot fail.
                        let _ = sender.send((index, result));
                    });
                }
            });
            drop(sender);

            for (index, result) in receiver {
                let node = graph.node(index);
                match result.status {
                    ExecStatus::Success => self.cache.record(&node.name, fingerprints[&index]),
                    _ => aborted = true,
                }
                bar.set_message(result.name.clone());
                bar.inc(1);
                results.push(result);
            }
        }

        bar.finish_and_clear();

        if let Err(err) = self.cache.save(&self.cache_dir) {
            tracing::warn!("Couldn't persist fingerprint store: {err}");
        }

        let cancelled = self.cancel.is_cancelled()
            || results.iter().any(|r| r.status == ExecStatus::Cancelled);
        let failed = results.iter().any(|r| !r.is_success());

        if cancelled {
            return Err(BuildError::Cancelled(BuildReport {
                status: BuildStatus::Cancelled,
                results,
            }));
        }

        if failed {
            return Err(BuildError::Failed(BuildReport {
                status: BuildStatus::Failed,
                results,
            }));
        }

        Ok(BuildReport {
            status: BuildStatus::Success,
            results,
        })
    }

    /// Upstream fingerprints in lexicographic node-name order, so chained
    /// hashes are deterministic.
    fn upstream(
        &self,
        graph: &TaskGraph,
        index: NodeIndex,
        fingerprints: &HashMap<NodeIndex, Fingerprint>,
    ) -> Vec<Fingerprint> {
        let mut upstream: Vec<(&str, Fingerprint)> = graph
            .upstream(index)
            .into_iter()
            .map(|dep| (&*graph.node(dep).name, fingerprints[&dep]))
            .collect();
        upstream.sort_by(|a, b| a.0.cmp(b.0));
        upstream.into_iter().map(|(_, fp)| fp).collect()
    }
}
