//! Resolution of raw plugin options into an immutable [`BuildRequest`].
//!
//! The host build system hands over a flat map of option strings. The
//! resolver validates it once, applies environment overrides, expands
//! classpath globs and produces a value that never changes for the rest of
//! the invocation.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::error::ConfigError;

/// Options consumed from the host build script. Anything else is ignored
/// with a warning rather than an error.
const RECOGNIZED: &[&str] = &[
    "mainClass",
    "outputDir",
    "extraFlags",
    "imageName",
    "classpath",
    "envs",
    "target",
];

/// Prefix for environment variables overriding individual options, e.g.
/// `IMAGEFORGE_MAIN_CLASS` overrides `mainClass`.
const ENV_PREFIX: &str = "IMAGEFORGE_";

/// Immutable description of a single native-image build.
///
/// Created once per invocation by [`ConfigResolver::resolve`]; everything
/// downstream (graph expansion, fingerprints, invocations) only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Entry point handed to the compiler.
    pub main_class: String,
    /// Ordered classpath entries, globs already expanded.
    pub classpath: Vec<Utf8PathBuf>,
    /// Root directory for everything the pipeline produces.
    pub output_dir: Utf8PathBuf,
    /// File name of the compiled image inside `output_dir`.
    pub image_name: String,
    /// Extra compiler flags, appended verbatim ahead of the classpath.
    pub flags: Vec<String>,
    /// Application environment names forwarded to the agent pass.
    pub envs: Vec<String>,
    /// Target platform identifier, part of every fingerprint.
    pub target: String,
}

impl BuildRequest {
    /// Path of the compiled image.
    pub fn image_path(&self) -> Utf8PathBuf {
        self.output_dir.join(&self.image_name)
    }

    /// Path of the distributable archive produced by the package node.
    pub fn archive_path(&self) -> Utf8PathBuf {
        self.output_dir.join(format!("{}.tar.gz", self.image_name))
    }

    /// Directory the agent pass writes reflection config into.
    pub fn aot_dir(&self) -> Utf8PathBuf {
        self.output_dir.join("aot")
    }

    pub(crate) fn joined_classpath(&self) -> String {
        let sep = if cfg!(windows) { ";" } else { ":" };
        self.classpath
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(sep)
    }
}

/// Merges plugin-level options with per-invocation environment overrides
/// into one validated [`BuildRequest`]. No side effects beyond validation
/// and warnings.
pub struct ConfigResolver {
    options: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl ConfigResolver {
    pub fn new(options: BTreeMap<String, String>) -> Self {
        Self {
            options,
            env: BTreeMap::new(),
        }
    }

    /// Environment overrides take precedence over plugin options. Keys are
    /// expected in the `IMAGEFORGE_*` form.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn get(&self, name: &'static str) -> Option<&str> {
        self.env
            .get(&env_key(name))
            .or_else(|| self.options.get(name))
            .map(String::as_str)
    }

    fn required(&self, name: &'static str) -> Result<&str, ConfigError> {
        self.get(name).ok_or(ConfigError::MissingOption(name))
    }

    pub fn resolve(&self) -> Result<BuildRequest, ConfigError> {
        for name in self.options.keys() {
            if !RECOGNIZED.contains(&name.as_str()) {
                tracing::warn!("Ignoring unrecognized option '{name}'");
            }
        }

        let main_class = self.required("mainClass")?.to_string();
        let output_dir = Utf8PathBuf::from(self.required("outputDir")?);
        let classpath = expand_classpath(self.required("classpath")?)?;

        let image_name = match self.get("imageName") {
            Some(name) => name.to_string(),
            None => default_image_name(&main_class),
        };

        let flags = parse_flags(self.get("extraFlags"))?;
        let envs = split_list(self.get("envs"));

        let target = match self.get("target") {
            Some(target) => target.to_string(),
            None => format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        };

        Ok(BuildRequest {
            main_class,
            classpath,
            output_dir,
            image_name,
            flags,
            envs,
            target,
        })
    }
}

/// `mainClass` -> `IMAGEFORGE_MAIN_CLASS`
fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(ENV_PREFIX.len() + name.len() + 2);
    key.push_str(ENV_PREFIX);

    for c in name.chars() {
        if c.is_ascii_uppercase() {
            key.push('_');
        }
        key.push(c.to_ascii_uppercase());
    }

    key
}

/// Classpath entries are comma-separated; entries containing glob
/// metacharacters are expanded, literal entries must exist.
fn expand_classpath(raw: &str) -> Result<Vec<Utf8PathBuf>, ConfigError> {
    let mut entries = Vec::new();

    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.contains(['*', '?', '[']) {
            let mut matched: Vec<Utf8PathBuf> = Vec::new();
            for path in glob::glob(part)? {
                matched.push(Utf8PathBuf::try_from(path?)?);
            }
            matched.sort();
            entries.extend(matched);
        } else {
            let path = Utf8PathBuf::from(part);
            if !path.exists() {
                return Err(ConfigError::ClasspathNotFound(path));
            }
            entries.push(path);
        }
    }

    if entries.is_empty() {
        return Err(ConfigError::EmptyClasspath);
    }

    Ok(entries)
}

/// `extraFlags` accepts either a JSON array (`["--no-fallback"]`) or a
/// whitespace-separated string, appended verbatim to the compiler argv.
fn parse_flags(raw: Option<&str>) -> Result<Vec<String>, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(json) if json.starts_with('[') => {
            serde_json::from_str(json).map_err(ConfigError::FlagsFormat)
        }
        Some(text) => Ok(text.split_whitespace().map(str::to_string).collect()),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_image_name(main_class: &str) -> String {
    main_class
        .rsplit(['.', '$'])
        .next()
        .unwrap_or(main_class)
        .to_ascii_lowercase()
}
