use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".foreman.toml";
pub const CONFIG_JSON: &str = ".foreman.json";

/// File inside each identity subdirectory.
pub const IDENTITY_FILE: &str = "identity.json";

/// Find the config file path, preferring .foreman.toml over .foreman.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level project descriptor.
///
/// All structs use snake_case (TOML native) with `alias` attributes so
/// camelCase JSON descriptors load too.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub identities: IdentitiesConfig,
    /// Extra environment passed to every worker process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    /// Branch every task branch is cut from.
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Repository the worker trees are added to (defaults to the project root).
    #[serde(default, alias = "sourceRepo")]
    pub source_repo: Option<PathBuf>,
    #[serde(default = "default_workspace_dir", alias = "workspaceDir")]
    pub workspace_dir: PathBuf,
    /// Project-level context appended to every directive.
    #[serde(default = "default_context_file", alias = "contextFile")]
    pub context_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms", alias = "tickMs")]
    pub tick_ms: u64,
    #[serde(default = "default_idle_timeout", alias = "idleTimeoutSecs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_runtime", alias = "maxRuntimeSecs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    /// Quit after the first task reaches a terminal outcome.
    #[serde(default, alias = "exitOnce")]
    pub exit_once: bool,
    #[serde(default = "default_quota_refresh", alias = "quotaRefreshSecs")]
    pub quota_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_program")]
    pub program: String,
    /// Local tracker cache inside a working tree; re-imported when present.
    #[serde(default = "default_cache_dir", alias = "cacheDir")]
    pub cache_dir: String,
    #[serde(default = "default_import_args", alias = "importArgs")]
    pub import_args: Vec<String>,
    #[serde(default = "default_command_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    /// Worker command; the directive is appended as the final argument.
    #[serde(default = "default_worker_command")]
    pub command: Vec<String>,
    /// Additional output substrings that abort a run.
    #[serde(default, alias = "fatalPatterns")]
    pub fatal_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IdentitiesConfig {
    #[serde(default)]
    pub pooling: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Command printing quota buckets as JSON; run with the identity's HOME.
    #[serde(default, alias = "quotaCommand")]
    pub quota_command: Vec<String>,
    /// Category name -> model id substrings that belong to it.
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<String, Vec<String>>,
}

fn default_branch() -> String { "main".into() }
fn default_workers() -> usize { 3 }
fn default_workspace_dir() -> PathBuf { PathBuf::from(".foreman/workers") }
fn default_context_file() -> Option<PathBuf> { Some(PathBuf::from("AGENTS.md")) }
fn default_tick_ms() -> u64 { 1000 }
fn default_idle_timeout() -> u64 { 600 }
fn default_max_runtime() -> u64 { 3600 }
fn default_max_retries() -> u32 { crate::claims::DEFAULT_MAX_RETRIES }
fn default_quota_refresh() -> u64 { 300 }
fn default_tracker_program() -> String { "bd".into() }
fn default_cache_dir() -> String { ".beads".into() }
fn default_import_args() -> Vec<String> { vec!["sync".into(), "--import-only".into()] }
fn default_command_timeout() -> u64 { 30 }
fn default_worker_command() -> Vec<String> {
    vec![
        "gemini".into(),
        "--yolo".into(),
        "--output-format".into(),
        "stream-json".into(),
        "-p".into(),
    ]
}
fn default_categories() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("flash".to_string(), vec!["flash".to_string()]),
        ("pro".to_string(), vec!["pro".to_string()]),
    ])
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            idle_timeout_secs: default_idle_timeout(),
            max_runtime_secs: default_max_runtime(),
            max_retries: default_max_retries(),
            exit_once: false,
            quota_refresh_secs: default_quota_refresh(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            program: default_tracker_program(),
            cache_dir: default_cache_dir(),
            import_args: default_import_args(),
            timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            fatal_patterns: Vec::new(),
        }
    }
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            pooling: false,
            directory: None,
            quota_command: Vec::new(),
            categories: default_categories(),
        }
    }
}

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.worker.command.is_empty() {
            return Err(ExitError::Config("worker.command must not be empty".into()).into());
        }
        if self.tracker.program.trim().is_empty() {
            return Err(ExitError::Config("tracker.program must not be empty".into()).into());
        }
        Ok(())
    }

    /// Repository the worker trees share, resolved against the project root.
    pub fn source_repo(&self, root: &Path) -> PathBuf {
        self.project
            .source_repo
            .as_deref()
            .map_or_else(|| root.to_path_buf(), |p| resolve(root, p))
    }

    pub fn workspace_dir(&self, root: &Path) -> PathBuf {
        resolve(root, &self.project.workspace_dir)
    }

    pub fn context_file(&self, root: &Path) -> Option<PathBuf> {
        self.project.context_file.as_deref().map(|p| resolve(root, p))
    }

    /// Identity records directory: configured path, else
    /// `<config dir>/foreman/identities`.
    pub fn identity_dir(&self, root: &Path) -> Option<PathBuf> {
        match self.identities.directory {
            Some(ref dir) => Some(resolve(root, &expand_home(dir))),
            None => default_identity_dir(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_ms.max(10))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker.timeout_secs)
    }
}

/// `<config dir>/foreman/identities`, used when no directory is configured.
pub fn default_identity_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("foreman").join("identities"))
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |h| h.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
