use camino::Utf8PathBuf;
use thiserror::Error;

use crate::executor::BuildReport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required option '{0}' is missing")]
    MissingOption(&'static str),

    #[error("Classpath entry '{0}' does not exist")]
    ClasspathNotFound(Utf8PathBuf),

    #[error("Classpath resolved to no entries")]
    EmptyClasspath,

    #[error("Couldn't compile classpath glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't expand classpath glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't parse 'extraFlags' as a JSON array.\n{0}")]
    FlagsFormat(#[source] serde_json::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Violations of the task graph invariants. The fixed pipeline topology
/// makes these unreachable in practice; they exist as a defensive check
/// for programmatically assembled graphs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in task graph at node '{0}'")]
    Cycle(String),

    #[error("Task '{0}' depends on unknown task '{1}'")]
    UnknownDependency(String, String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't build worker pool.\n{0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{} task(s) failed", .0.failed().len())]
    Failed(BuildReport),

    #[error("Build cancelled before completion")]
    Cancelled(BuildReport),
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Task graph construction failed:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while building the native image.\n{0}")]
    Build(#[from] BuildError),
}
