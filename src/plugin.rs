//! The host build-system boundary.
//!
//! A host (Gradle-like) build tool applies the plugin once per project.
//! The plugin resolves its options and registers a single coarse task with
//! the host's own task graph, declaring inputs and outputs so the host can
//! layer its own up-to-date checks on top of the fine-grained fingerprint
//! skipping done inside the pipeline.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::config::{BuildRequest, ConfigResolver};

/// Name under which the native-build task is registered with the host.
pub const NATIVE_BUILD_TASK: &str = "nativeBuild";

/// A single task registration handed to the host build system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRegistration {
    pub name: String,
    /// Paths the host should treat as task inputs.
    pub inputs: Vec<Utf8PathBuf>,
    /// Paths the host should treat as task outputs.
    pub outputs: Vec<Utf8PathBuf>,
}

/// The slice of the host build system the plugin talks to. Passed in
/// explicitly; the plugin holds no process-wide registry state.
pub trait HostContext {
    /// Raw plugin options as configured in the host build script.
    fn options(&self) -> BTreeMap<String, String>;

    /// Registers a task with the host's own task graph.
    fn register_task(&mut self, registration: TaskRegistration) -> anyhow::Result<()>;
}

/// Thin adapter wiring the native-build pipeline into a host.
#[derive(Debug, Default)]
pub struct NativeImagePlugin;

impl NativeImagePlugin {
    /// Resolves the host's options and registers the native-build task,
    /// returning the resolved request for the host to act on.
    pub fn apply(&self, host: &mut dyn HostContext) -> anyhow::Result<BuildRequest> {
        let request = ConfigResolver::new(host.options()).resolve()?;

        host.register_task(TaskRegistration {
            name: NATIVE_BUILD_TASK.to_string(),
            inputs: request.classpath.clone(),
            outputs: vec![request.image_path(), request.archive_path()],
        })?;

        Ok(request)
    }
}
