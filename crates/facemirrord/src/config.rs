use facemirror_core::{DistanceMetric, ModelConfig};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What a recognition request does when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Log the failure and classify against the last-good mirror.
    Degraded,
    /// Answer with a `store_error` result.
    FailClosed,
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degraded" => Ok(SyncPolicy::Degraded),
            "fail_closed" | "fail-closed" => Ok(SyncPolicy::FailClosed),
            other => Err(format!("unknown sync policy: {other}")),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `FACEMIRROR_CONFIG`, then `FACEMIRROR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Container name inside `store_dir`.
    pub bucket: String,
    /// Directory holding blob containers.
    pub store_dir: PathBuf,
    /// Local gallery mirror scanned by the matcher.
    pub mirror_root: PathBuf,
    /// Where uploaded probe images are staged for the duration of a request.
    pub scratch_dir: PathBuf,
    /// Models to run, in order. The first one answers `/recognize`.
    pub models: Vec<String>,
    pub metric: DistanceMetric,
    /// Default acceptance threshold (inclusive).
    pub threshold: f64,
    /// Per-model threshold overrides (config file only).
    pub model_thresholds: BTreeMap<String, f64>,
    /// Upper bound on each blob store call.
    pub store_timeout_secs: u64,
    /// Parallel downloads per reconciliation.
    pub sync_concurrency: usize,
    pub sync_policy: SyncPolicy,
    pub listen_addr: SocketAddr,
    pub max_upload_bytes: usize,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bucket: Option<String>,
    store_dir: Option<PathBuf>,
    mirror_root: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    models: Option<Vec<String>>,
    metric: Option<DistanceMetric>,
    threshold: Option<f64>,
    #[serde(default)]
    model_thresholds: BTreeMap<String, f64>,
    store_timeout_secs: Option<u64>,
    sync_concurrency: Option<usize>,
    sync_policy: Option<SyncPolicy>,
    listen_addr: Option<SocketAddr>,
    max_upload_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facemirror");

        Self {
            bucket: "face-recognition-db".to_string(),
            store_dir: data_dir.join("store"),
            mirror_root: data_dir.join("mirror"),
            scratch_dir: std::env::temp_dir().join("facemirror-scratch"),
            models: vec![
                "gray-32".to_string(),
                "gray-16".to_string(),
                "histogram-32".to_string(),
            ],
            metric: DistanceMetric::Cosine,
            threshold: 0.6,
            model_thresholds: BTreeMap::new(),
            store_timeout_secs: 30,
            sync_concurrency: 4,
            sync_policy: SyncPolicy::Degraded,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load defaults, the optional config file, and environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEMIRROR_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(text)?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.bucket {
            self.bucket = v;
        }
        if let Some(v) = file.store_dir {
            self.store_dir = v;
        }
        if let Some(v) = file.mirror_root {
            self.mirror_root = v;
        }
        if let Some(v) = file.scratch_dir {
            self.scratch_dir = v;
        }
        if let Some(v) = file.models {
            self.models = v;
        }
        if let Some(v) = file.metric {
            self.metric = v;
        }
        if let Some(v) = file.threshold {
            self.threshold = v;
        }
        self.model_thresholds.extend(file.model_thresholds);
        if let Some(v) = file.store_timeout_secs {
            self.store_timeout_secs = v;
        }
        if let Some(v) = file.sync_concurrency {
            self.sync_concurrency = v;
        }
        if let Some(v) = file.sync_policy {
            self.sync_policy = v;
        }
        if let Some(v) = file.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = file.max_upload_bytes {
            self.max_upload_bytes = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FACEMIRROR_BUCKET") {
            self.bucket = v;
        }
        if let Ok(v) = std::env::var("FACEMIRROR_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMIRROR_MIRROR_ROOT") {
            self.mirror_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMIRROR_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEMIRROR_MODELS") {
            self.models = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_parse("FACEMIRROR_METRIC") {
            self.metric = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_THRESHOLD") {
            self.threshold = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_STORE_TIMEOUT_SECS") {
            self.store_timeout_secs = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_SYNC_CONCURRENCY") {
            self.sync_concurrency = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_SYNC_POLICY") {
            self.sync_policy = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = env_parse("FACEMIRROR_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("bucket must not be empty".into()));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Invalid("at least one model is required".into()));
        }
        let mut seen = BTreeSet::new();
        for model in &self.models {
            if !seen.insert(model.as_str()) {
                return Err(ConfigError::Invalid(format!("model {model} listed twice")));
            }
        }
        for (model, threshold) in std::iter::once(("default", &self.threshold))
            .chain(self.model_thresholds.iter().map(|(m, t)| (m.as_str(), t)))
        {
            if !threshold.is_finite() || *threshold < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "threshold for {model} must be a non-negative number"
                )));
            }
        }
        if self.store_timeout_secs == 0 {
            return Err(ConfigError::Invalid("store_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// One model config per configured model, in order.
    pub fn model_configs(&self) -> Vec<ModelConfig> {
        self.models
            .iter()
            .map(|id| {
                let threshold = self.model_thresholds.get(id).copied().unwrap_or(self.threshold);
                ModelConfig::new(id.clone(), self.metric, threshold)
            })
            .collect()
    }

    /// The model that answers single-model recognition.
    pub fn primary_model(&self) -> Option<ModelConfig> {
        self.model_configs().into_iter().next()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Parse an environment variable, warning (and ignoring it) when malformed.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment variable");
            None
        }
    }
}
