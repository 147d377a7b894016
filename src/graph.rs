//! Task graph expansion and topological planning.
//!
//! A build request expands into a fixed pipeline: the agent pass that
//! generates reflection config, the native compilation itself, and the
//! packaging of the produced image. The graph is stored as a petgraph
//! DAG; a toposort over it doubles as the cycle guard for graphs
//! assembled programmatically.

use std::collections::HashMap;
use std::time::Duration;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::config::BuildRequest;
use crate::core::{ArcStr, Fingerprint, FingerprintBuilder};
use crate::error::GraphError;
use crate::process::Invocation;

/// The kind of work a node performs. Determines both the invocation recipe
/// and which request fields feed the node's fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Run the application under the native-image agent to collect
    /// reflection config.
    ReflectConfig,
    /// Invoke the ahead-of-time compiler.
    NativeCompile,
    /// Archive the compiled image for distribution.
    Package,
}

/// One unit of work: a unique name, upstream dependencies by name, and the
/// fully assembled external invocation. Immutable after expansion; the
/// orchestrator only reads it.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: ArcStr,
    pub kind: TaskKind,
    pub deps: Vec<ArcStr>,
    pub invocation: Invocation,
}

/// External programs used by the pipeline nodes.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// JVM launcher running the agent pass.
    pub java: String,
    /// Ahead-of-time compiler.
    pub native_image: String,
    /// Archiver producing the distributable.
    pub archiver: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            java: "java".to_string(),
            native_image: "native-image".to_string(),
            archiver: "tar".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
}

impl TaskGraph {
    /// Expands a build request into the fixed pipeline topology:
    /// `reflect-config` -> `native-compile` -> `package`.
    pub fn expand(
        request: &BuildRequest,
        toolchain: &Toolchain,
        timeout: Option<Duration>,
    ) -> Result<Self, GraphError> {
        tracing::debug!(
            "Expanding task graph for image '{}'",
            request.image_path()
        );

        let nodes = vec![
            TaskNode {
                name: "reflect-config".into(),
                kind: TaskKind::ReflectConfig,
                deps: vec![],
                invocation: invocation(TaskKind::ReflectConfig, request, toolchain)
                    .timeout(timeout),
            },
            TaskNode {
                name: "native-compile".into(),
                kind: TaskKind::NativeCompile,
                deps: vec!["reflect-config".into()],
                invocation: invocation(TaskKind::NativeCompile, request, toolchain)
                    .timeout(timeout),
            },
            TaskNode {
                name: "package".into(),
                kind: TaskKind::Package,
                deps: vec!["native-compile".into()],
                invocation: invocation(TaskKind::Package, request, toolchain).timeout(timeout),
            },
        ];

        Self::from_nodes(nodes)
    }

    /// Builds a graph from explicit nodes, wiring dependency edges and
    /// rejecting unknown dependencies and cycles.
    pub(crate) fn from_nodes(nodes: Vec<TaskNode>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut indices: HashMap<ArcStr, NodeIndex> = HashMap::new();

        for node in nodes {
            let name = node.name.clone();
            let index = graph.add_node(node);
            indices.insert(name, index);
        }

        for index in graph.node_indices().collect::<Vec<_>>() {
            for dep in graph[index].deps.clone() {
                let Some(&dep_index) = indices.get(&dep) else {
                    return Err(GraphError::UnknownDependency(
                        graph[index].name.to_string(),
                        dep.to_string(),
                    ));
                };
                graph.add_edge(dep_index, index, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].name.to_string()))?;

        Ok(Self { graph })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub(crate) fn upstream(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    /// Topological levels: every node's dependencies live in an earlier
    /// level. Nodes within a level are independent and ordered
    /// lexicographically by name, which makes plans deterministic.
    pub(crate) fn levels(&self) -> Vec<Vec<NodeIndex>> {
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| {
                (
                    i,
                    self.graph.neighbors_directed(i, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: Vec<NodeIndex> = indegree
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&i, _)| i)
            .collect();

        let mut levels = Vec::new();

        while !ready.is_empty() {
            ready.sort_by(|&a, &b| self.graph[a].name.cmp(&self.graph[b].name));

            let mut next = Vec::new();
            for &index in &ready {
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    let count = indegree
                        .get_mut(&dependent)
                        .expect("dependent missing from indegree map");
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent);
                    }
                }
            }

            levels.push(std::mem::replace(&mut ready, next));
        }

        levels
    }
}

/// Assembles the external command for a node. Argument ordering is
/// deterministic: flags, then classpath, then main class, then output.
pub(crate) fn invocation(
    kind: TaskKind,
    request: &BuildRequest,
    toolchain: &Toolchain,
) -> Invocation {
    match kind {
        TaskKind::ReflectConfig => {
            let mut args = vec![
                format!(
                    "-agentlib:native-image-agent=config-output-dir={}",
                    request.aot_dir()
                ),
                "-cp".to_string(),
                request.joined_classpath(),
                request.main_class.clone(),
            ];
            if !request.envs.is_empty() {
                args.push(format!("--env={}", request.envs.join(",")));
            }
            Invocation::new(&toolchain.java, args)
        }
        TaskKind::NativeCompile => {
            let mut args = request.flags.clone();
            args.push(format!(
                "-H:ConfigurationFileDirectories={}",
                request.aot_dir()
            ));
            args.push("--class-path".to_string());
            args.push(request.joined_classpath());
            args.push(request.main_class.clone());
            args.push("-o".to_string());
            args.push(request.image_path().into_string());
            Invocation::new(&toolchain.native_image, args)
        }
        TaskKind::Package => Invocation::new(
            &toolchain.archiver,
            vec![
                "-czf".to_string(),
                request.archive_path().into_string(),
                "-C".to_string(),
                request.output_dir.clone().into_string(),
                request.image_name.clone(),
            ],
        ),
    }
}

/// Computes a node's fingerprint from the request fields relevant to its
/// kind, the stamps of files it consumes, and the fingerprints of its
/// upstream nodes (so invalidation cascades downstream).
pub(crate) fn fingerprint(
    kind: TaskKind,
    request: &BuildRequest,
    upstream: &[Fingerprint],
) -> std::io::Result<Fingerprint> {
    let builder = match kind {
        TaskKind::ReflectConfig => FingerprintBuilder::default()
            .field("reflect-config")
            .field(&request.main_class)
            .fields(&request.envs)
            .field(&request.target),
        TaskKind::NativeCompile => {
            let mut builder = FingerprintBuilder::default()
                .field("native-compile")
                .fields(&request.flags)
                .field(&request.main_class)
                .field(&request.image_name)
                .field(&request.target);
            for entry in &request.classpath {
                builder = builder.file_stamp(entry)?;
            }
            builder
        }
        TaskKind::Package => FingerprintBuilder::default()
            .field("package")
            .field(&request.image_name),
    };

    let mut builder = builder;
    for &fp in upstream {
        builder = builder.chain(fp);
    }

    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn request(classpath: Vec<Utf8PathBuf>) -> BuildRequest {
        BuildRequest {
            main_class: "com.acme.App".to_string(),
            classpath,
            output_dir: Utf8PathBuf::from("/out"),
            image_name: "app".to_string(),
            flags: vec!["--no-fallback".to_string()],
            envs: vec![],
            target: "linux-x86_64".to_string(),
        }
    }

    fn node(name: &str, deps: &[&str]) -> TaskNode {
        TaskNode {
            name: name.into(),
            kind: TaskKind::ReflectConfig,
            deps: deps.iter().map(|&d| d.into()).collect(),
            invocation: Invocation::new("true", vec![]),
        }
    }

    #[test]
    fn expansion_yields_canonical_topology() {
        let request = request(vec![Utf8PathBuf::from("a.jar")]);
        let graph = TaskGraph::expand(&request, &Toolchain::default(), None).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 2);

        let levels = graph.levels();
        let names: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| level.iter().map(|&i| &*graph.node(i).name).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec!["reflect-config"], vec!["native-compile"], vec!["package"]]
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(matches!(
            TaskGraph::from_nodes(nodes),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn unknown_dependencies_are_rejected() {
        let nodes = vec![node("a", &["ghost"])];
        match TaskGraph::from_nodes(nodes) {
            Err(GraphError::UnknownDependency(from, to)) => {
                assert_eq!(from, "a");
                assert_eq!(to, "ghost");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn levels_break_ties_lexicographically() {
        // diamond: root -> {beta, alpha} -> sink
        let nodes = vec![
            node("root", &[]),
            node("beta", &["root"]),
            node("alpha", &["root"]),
            node("sink", &["alpha", "beta"]),
        ];
        let graph = TaskGraph::from_nodes(nodes).unwrap();

        let names: Vec<Vec<&str>> = graph
            .levels()
            .iter()
            .map(|level| level.iter().map(|&i| &*graph.node(i).name).collect())
            .collect();
        assert_eq!(names, vec![vec!["root"], vec!["alpha", "beta"], vec!["sink"]]);
    }

    #[test]
    fn compile_argv_ordering_is_deterministic() {
        let request = request(vec![Utf8PathBuf::from("a.jar"), Utf8PathBuf::from("b.jar")]);
        let inv = invocation(TaskKind::NativeCompile, &request, &Toolchain::default());

        assert_eq!(inv.program, "native-image");
        // flags first, then classpath, then main class, then output
        assert_eq!(inv.args[0], "--no-fallback");
        let cp = inv.args.iter().position(|a| a == "--class-path").unwrap();
        assert_eq!(inv.args[cp + 1], "a.jar:b.jar");
        assert_eq!(inv.args[cp + 2], "com.acme.App");
        assert_eq!(inv.args[cp + 3], "-o");
        assert_eq!(inv.args[cp + 4], "/out/app");
    }

    #[test]
    fn package_archives_the_image() {
        let request = request(vec![Utf8PathBuf::from("a.jar")]);
        let inv = invocation(TaskKind::Package, &request, &Toolchain::default());

        assert_eq!(inv.program, "tar");
        assert_eq!(
            inv.args,
            vec!["-czf", "/out/app.tar.gz", "-C", "/out", "app"]
        );
    }

    #[test]
    fn classpath_change_invalidates_compile_but_not_reflect() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("app.jar");
        std::fs::write(&jar, b"v1").unwrap();
        let jar = Utf8PathBuf::from_path_buf(jar).unwrap();
        let request = request(vec![jar.clone()]);

        let reflect_before = fingerprint(TaskKind::ReflectConfig, &request, &[]).unwrap();
        let compile_before =
            fingerprint(TaskKind::NativeCompile, &request, &[reflect_before]).unwrap();
        let package_before =
            fingerprint(TaskKind::Package, &request, &[compile_before]).unwrap();

        std::fs::write(&jar, b"v2 with different length").unwrap();

        let reflect_after = fingerprint(TaskKind::ReflectConfig, &request, &[]).unwrap();
        let compile_after =
            fingerprint(TaskKind::NativeCompile, &request, &[reflect_after]).unwrap();
        let package_after =
            fingerprint(TaskKind::Package, &request, &[compile_after]).unwrap();

        assert_eq!(reflect_before, reflect_after);
        assert_ne!(compile_before, compile_after);
        assert_ne!(package_before, package_after);
    }
}
