#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod core;
mod error;
mod executor;
mod graph;
mod plugin;
mod process;

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

pub use crate::config::{BuildRequest, ConfigResolver};
pub use crate::core::Fingerprint;
pub use crate::error::{BuildError, ConfigError, ForgeError, GraphError};
pub use crate::executor::{BuildReport, BuildStatus, ExecutionPlan, Orchestrator};
pub use crate::graph::{TaskGraph, TaskKind, TaskNode, Toolchain};
pub use crate::plugin::{HostContext, NATIVE_BUILD_TASK, NativeImagePlugin, TaskRegistration};
pub use crate::process::{CancelToken, ExecStatus, ExecutionResult, Invocation};

/// Default location of the fingerprint store.
const DEFAULT_CACHE_DIR: &str = ".cache";

/// A builder struct collecting everything a [`Forge`] needs: plugin
/// options, environment overrides, the toolchain and execution limits.
pub struct Blueprint {
    options: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    toolchain: Toolchain,
    cache_dir: Utf8PathBuf,
    workers: Option<usize>,
    timeout: Option<Duration>,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Blueprint {
    pub fn new() -> Self {
        Self {
            options: BTreeMap::new(),
            env: BTreeMap::new(),
            toolchain: Toolchain::default(),
            cache_dir: Utf8PathBuf::from(DEFAULT_CACHE_DIR),
            workers: None,
            timeout: None,
        }
    }

    /// Sets one plugin option, e.g. `mainClass` or `outputDir`.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.options
            .extend(options.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets an explicit environment override (`IMAGEFORGE_*` key form).
    /// Takes precedence over anything harvested from the process
    /// environment.
    pub fn env_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn cache_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.cache_dir = dir.as_ref().to_owned();
        self
    }

    /// Caps the worker pool; defaults to the global rayon pool size.
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = Some(count);
        self
    }

    /// Per-node deadline for external processes.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn finish(self) -> Forge {
        let mut env: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("IMAGEFORGE_"))
            .collect();
        // explicit overrides beat harvested ones
        env.extend(self.env);

        Forge {
            options: self.options,
            env,
            toolchain: self.toolchain,
            cache_dir: self.cache_dir,
            workers: self.workers,
            timeout: self.timeout,
            cancel: CancelToken::new(),
        }
    }
}

/// The configured build pipeline. Each [`build`](Forge::build) call
/// resolves options into a request, expands the task graph, schedules it
/// and executes it, reusing fingerprints recorded by previous runs.
pub struct Forge {
    options: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    toolchain: Toolchain,
    cache_dir: Utf8PathBuf,
    workers: Option<usize>,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl Forge {
    pub fn configure() -> Blueprint {
        Blueprint::new()
    }

    /// Token cancelling the in-flight build; safe to clone into signal
    /// handlers or other threads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn build(&self) -> Result<BuildReport, ForgeError> {
        eprintln!(
            "Running {} in {} mode.",
            style("Imageforge").red(),
            style("build").blue()
        );

        let request = ConfigResolver::new(self.options.clone())
            .with_env(self.env.clone())
            .resolve()?;

        let graph = TaskGraph::expand(&request, &self.toolchain, self.timeout)?;

        let mut orchestrator =
            Orchestrator::new(&self.cache_dir, self.workers, self.cancel.clone());
        let plan = orchestrator.schedule(&graph);

        tracing::debug!("Execution plan: {:?}", plan.level_names(&graph));

        let report = orchestrator.execute(&graph, &plan, &request)?;
        Ok(report)
    }
}

/// Installs a stderr `tracing` subscriber honoring `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_surfaces_configuration_errors() {
        let forge = Forge::configure()
            .option("outputDir", "build/native")
            .finish();

        assert!(matches!(
            forge.build(),
            Err(ForgeError::Config(ConfigError::MissingOption("mainClass")))
        ));
    }

    #[test]
    fn blueprint_env_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("app.jar");
        std::fs::write(&jar, b"jar").unwrap();

        let forge = Forge::configure()
            .option("mainClass", "com.acme.App")
            .option("outputDir", "build/native")
            .option("classpath", jar.to_str().unwrap())
            .env_override("IMAGEFORGE_IMAGE_NAME", "overridden")
            .finish();

        let request = ConfigResolver::new(forge.options.clone())
            .with_env(forge.env.clone())
            .resolve()
            .unwrap();
        assert_eq!(request.image_name, "overridden");
    }
}
