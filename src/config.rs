use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::delegate::WebhookConfig;
use crate::fetch::FetchOptions;
use crate::request::{ArchiveLayout, RequestDescriptor, UrlTemplate};
use crate::retry::RetryConfig;
use crate::types::Strategy;
use crate::version::{Step, Version};
use crate::workflow::SyncPlan;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read dataset file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse dataset file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Dataset '{dataset}': {reason}")]
    Invalid { dataset: String, reason: String },

    #[error("Dataset id '{0}' is defined more than once")]
    DuplicateId(String),

    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),
}

/// Command run on each fetched file, e.g. `cdo -f nc copy {input} {output}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub command: String,
    /// Extension of the file the command writes.
    #[serde(default)]
    pub output_extension: Option<String>,
}

/// One dataset definition from the JSON dataset file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub id: String,
    /// Output namespace; defaults to the id.
    #[serde(default)]
    pub namespace: Option<String>,
    pub base_url: String,
    /// Resource URL template, e.g.
    /// `{_url}/{_yyyymmdd}/{_H}z/ifs/0p25/{stream}/{_yyyymmddHHMMSS}-{step}h-{stream}-{type}.{_extension}`.
    pub template: String,
    pub request: RequestDescriptor,
    pub step: Step,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
    #[serde(default)]
    pub start: Option<Version>,
    #[serde(default = "default_true")]
    pub use_index: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    pub output_dir: String,
    #[serde(default)]
    pub cleanup_past: bool,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default)]
    pub webhook_args: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_probes() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_deadline_secs() -> u64 {
    1800
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetFile {
    datasets: Vec<DatasetConfig>,
}

impl DatasetConfig {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.id)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn output_dir(&self) -> PathBuf {
        expand_tilde(&self.output_dir)
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            dataset: self.id.clone(),
            reason: reason.into(),
        }
    }

    pub fn layout(&self) -> Result<ArchiveLayout, ConfigError> {
        let template = UrlTemplate::parse(&self.template).map_err(|e| self.invalid(e.to_string()))?;
        Ok(ArchiveLayout::new(self.base_url.as_str(), template))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("id must not be empty"));
        }
        if self.request.is_empty() {
            return Err(self.invalid("request must name at least one dimension"));
        }
        if self.max_probes == 0 {
            return Err(self.invalid("max_probes must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(self.invalid("concurrency must be at least 1"));
        }
        if self.interval_secs == 0 || self.deadline_secs == 0 {
            return Err(self.invalid("interval_secs and deadline_secs must be positive"));
        }
        let layout = self.layout()?;
        // Every URL dimension must render; unbound placeholders surface here
        // instead of on the first probe.
        let (url_dims, _) = self.request.split(&layout.template);
        let probe = self
            .start
            .or_else(|| Version::from_ymd_h(2000, 1, 1, 0))
            .ok_or_else(|| self.invalid("cannot build a sample version"))?;
        layout
            .resource_keys(&url_dims, probe)
            .map_err(|e| self.invalid(e.to_string()))?;
        Ok(())
    }

    /// Build the sync plan for this dataset. Partial downloads go under
    /// `work_root`.
    pub fn plan(&self, work_root: &Path) -> Result<SyncPlan, ConfigError> {
        Ok(SyncPlan {
            dataset_id: self.id.clone(),
            namespace: self.namespace().to_string(),
            layout: self.layout()?,
            request: self.request.clone(),
            step: self.step,
            strategy: self.strategy,
            max_probes: self.max_probes,
            start: self.start,
            fetch: FetchOptions {
                use_index: self.use_index,
                concurrency: self.concurrency,
                retry: self.retry,
                work_dir: work_root.to_path_buf(),
            },
        })
    }
}

pub fn parse_datasets(text: &str, path: &Path) -> Result<Vec<DatasetConfig>, ConfigError> {
    let file: DatasetFile = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let mut seen = HashSet::new();
    for dataset in &file.datasets {
        dataset.validate()?;
        if !seen.insert(dataset.id.as_str()) {
            return Err(ConfigError::DuplicateId(dataset.id.clone()));
        }
    }
    Ok(file.datasets)
}

pub fn load_datasets(path: &Path) -> Result<Vec<DatasetConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_datasets(&text, path)
}

/// Application configuration.
pub struct Config {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub webhook: WebhookConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("config_path", &self.config_path)
            .field("state_dir", &self.state_dir)
            .field("work_dir", &self.work_dir)
            .field("timeout", &self.timeout)
            .field("webhook_url", &self.webhook.url)
            .field("webhook_secret", &self.webhook.secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: &crate::cli::Cli) -> anyhow::Result<Self> {
        if cli.timeout_secs == 0 {
            anyhow::bail!("--timeout-secs must be positive");
        }
        let state_dir = expand_tilde(&cli.state_dir);
        let work_dir = cli
            .work_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| state_dir.join("work"));

        Ok(Self {
            config_path: expand_tilde(&cli.config),
            state_dir,
            work_dir,
            timeout: Duration::from_secs(cli.timeout_secs),
            webhook: WebhookConfig {
                url: cli.webhook_url.clone(),
                secret: cli.webhook_secret.clone(),
                args: None,
            },
        })
    }

    /// Datasets from the dataset file, narrowed to `only` when non-empty.
    pub fn datasets(&self, only: &[String]) -> Result<Vec<DatasetConfig>, ConfigError> {
        let all = load_datasets(&self.config_path)?;
        if only.is_empty() {
            return Ok(all);
        }
        for id in only {
            if !all.iter().any(|d| &d.id == id) {
                return Err(ConfigError::UnknownDataset(id.clone()));
            }
        }
        Ok(all.into_iter().filter(|d| only.contains(&d.id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECMWF: &str = r#"{
        "datasets": [{
            "id": "ecmwf-hres",
            "namespace": "oper_fc",
            "base_url": "https://data.ecmwf.int/forecasts",
            "template": "{_url}/{_yyyymmdd}/{_H}z/ifs/0p25/{stream}/{_yyyymmddHHMMSS}-{step}h-{stream}-{type}.{_extension}",
            "request": {"stream": "oper", "type": "fc", "step": [0, 3, 6], "param": ["2t", "msl"]},
            "step": "6h",
            "output_dir": "/data/ecmwf",
            "transform": {"command": "cdo -f nc copy {input} {output}", "output_extension": "nc"},
            "retry": {"max_retries": 5, "base_delay": 2}
        }, {
            "id": "chirps",
            "base_url": "https://data.chc.ucsb.edu/products/CHIRPS-2.0/africa_monthly/tifs",
            "template": "{_url}/chirps-v2.0.{_yyyy}.{_mm}.tif.gz",
            "request": {"product": "monthly"},
            "step": "1mo",
            "strategy": "next",
            "start": "2023-11-01",
            "use_index": false,
            "interval_secs": 86400,
            "output_dir": "~/rainfall",
            "cleanup_past": true
        }]
    }"#;

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_parse_dataset_file_with_defaults() {
        let datasets = parse_datasets(ECMWF, Path::new("datasets.json")).unwrap();
        assert_eq!(datasets.len(), 2);

        let ecmwf = &datasets[0];
        assert_eq!(ecmwf.namespace(), "oper_fc");
        assert_eq!(ecmwf.step, Step::Hours(6));
        assert_eq!(ecmwf.strategy, Strategy::Latest);
        assert_eq!(ecmwf.max_probes, 10);
        assert!(ecmwf.use_index);
        assert_eq!(ecmwf.retry.max_retries, 5);
        assert_eq!(ecmwf.retry.base_delay, Duration::from_secs(2));
        assert_eq!(ecmwf.request.values("step").unwrap(), ["0", "3", "6"]);

        let chirps = &datasets[1];
        assert_eq!(chirps.namespace(), "chirps");
        assert_eq!(chirps.strategy, Strategy::Next);
        assert_eq!(chirps.start, Version::from_ymd_h(2023, 11, 1, 0));
        assert!(!chirps.use_index);
        assert_eq!(chirps.interval(), Duration::from_secs(86400));
    }

    #[test]
    fn test_plan_carries_fetch_options() {
        let datasets = parse_datasets(ECMWF, Path::new("datasets.json")).unwrap();
        let plan = datasets[1].plan(Path::new("/tmp/work")).unwrap();
        assert_eq!(plan.dataset_id, "chirps");
        assert!(!plan.fetch.use_index);
        assert_eq!(plan.fetch.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(plan.layout.base_url, "https://data.chc.ucsb.edu/products/CHIRPS-2.0/africa_monthly/tifs");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"{"datasets": [
            {"id": "a", "base_url": "u", "template": "{_url}/{x}", "request": {"x": 1}, "step": "1d", "output_dir": "o"},
            {"id": "a", "base_url": "u", "template": "{_url}/{x}", "request": {"x": 2}, "step": "1d", "output_dir": "o"}
        ]}"#;
        assert!(matches!(
            parse_datasets(text, Path::new("d.json")),
            Err(ConfigError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_unbound_placeholder_rejected() {
        let text = r#"{"datasets": [
            {"id": "a", "base_url": "u", "template": "{_url}/{missing}", "request": {"x": 1}, "step": "1d", "output_dir": "o"}
        ]}"#;
        assert!(matches!(
            parse_datasets(text, Path::new("d.json")),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_step_rejected() {
        let text = r#"{"datasets": [
            {"id": "a", "base_url": "u", "template": "{_url}/{x}", "request": {"x": 1}, "step": "fortnightly", "output_dir": "o"}
        ]}"#;
        assert!(matches!(
            parse_datasets(text, Path::new("d.json")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_from_cli_defaults_work_dir_under_state() {
        use clap::Parser;
        let cli = crate::cli::Cli::try_parse_from([
            "gridsync",
            "status",
            "--state-dir",
            "/srv/state",
            "--config",
            "/srv/datasets.json",
        ])
        .unwrap();
        let cfg = Config::from_cli(&cli).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/srv/state/work"));
        assert_eq!(cfg.config_path, PathBuf::from("/srv/datasets.json"));
    }
}
