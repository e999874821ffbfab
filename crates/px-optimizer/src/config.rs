//! The params document: one JSON or YAML file holding run metadata,
//! optimizer settings, opaque project settings and the search space.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use px_types::{config_error, PxResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::adapters::AdapterConfig;
use crate::sampler::{SamplerConfig, SamplerKind};

/// `meta` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub name: String,
    pub study_version: Option<u32>,
    pub seed: u64,
    #[serde(alias = "adapter", alias = "adapter_path")]
    pub objective_adapter: Option<String>,
    pub prune_adapter: Option<String>,
    pub worker_adapter: Option<String>,
    pub master_adapter: Option<String>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            name: "study".to_string(),
            study_version: None,
            seed: 42,
            objective_adapter: None,
            prune_adapter: None,
            worker_adapter: None,
            master_adapter: None,
        }
    }
}

/// `optimizer` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub n_trials: i64,
    pub n_jobs: i64,
    /// Seconds; 0 disables the timeout.
    pub timeout_sec: u64,
    pub sampler: String,
    pub grid_params: Option<IndexMap<String, Vec<Value>>>,
    pub exploration_weight: f64,
    pub storage_url: Option<String>,
    /// Shorthand for a SQLite store at this path.
    #[serde(alias = "storage_sqlite")]
    pub storage_path: Option<PathBuf>,
    #[serde(alias = "sqlite_timeout")]
    pub sqlite_timeout_sec: u64,
    pub out_path: PathBuf,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_trials: 100,
            n_jobs: 1,
            timeout_sec: 0,
            sampler: "bayesian".to_string(),
            grid_params: None,
            exploration_weight: 0.3,
            storage_url: None,
            storage_path: None,
            sqlite_timeout_sec: 30,
            out_path: PathBuf::from("best.json"),
        }
    }
}

impl OptimizerConfig {
    /// The configured store url, if any.
    pub fn storage_url(&self) -> Option<String> {
        self.storage_url.clone().or_else(|| {
            self.storage_path
                .as_ref()
                .map(|p| format!("{}{}", px_storage::SQLITE_SCHEME, p.display()))
        })
    }

    pub fn sampler_config(&self, seed: u64) -> PxResult<SamplerConfig> {
        let kind: SamplerKind = self.sampler.parse()?;
        Ok(SamplerConfig {
            kind,
            seed,
            grid_params: self.grid_params.clone(),
            exploration_weight: self.exploration_weight,
        })
    }
}

/// Typed view of a params document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub meta: MetaConfig,
    #[serde(alias = "optuna")]
    pub optimizer: OptimizerConfig,
    pub project: Map<String, Value>,
    pub search_space: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> PxResult<Format> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => Ok(Format::Json),
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        _ => Err(config_error!(
            "Unsupported params file extension for '{}'. Use .json or .yaml/.yml.",
            path.display()
        )),
    }
}

fn section<'a>(raw: &'a Map<String, Value>, key: &str) -> PxResult<Option<&'a Map<String, Value>>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_error!("params['{}'] must be a mapping", key)),
    }
}

/// A loaded params file: the raw document, kept for write-back, and its
/// typed view.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamsDocument {
    pub path: PathBuf,
    pub raw: Map<String, Value>,
    pub config: RunConfig,
}

impl ParamsDocument {
    pub fn load(path: &Path) -> PxResult<Self> {
        let format = format_of(path)?;
        let text = fs::read_to_string(path)?;
        let value: Value = match format {
            Format::Json => serde_json::from_str(&text)?,
            Format::Yaml => serde_yaml::from_str(&text)?,
        };
        let Value::Object(raw) = value else {
            return Err(config_error!(
                "params root must be a mapping: {}",
                path.display()
            ));
        };
        Self::from_raw(path, raw)
    }

    pub fn from_raw(path: &Path, raw: Map<String, Value>) -> PxResult<Self> {
        for key in ["meta", "optimizer", "optuna", "project", "search_space"] {
            section(&raw, key)?;
        }
        let config: RunConfig = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| config_error!("invalid params file {}: {}", path.display(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            raw,
            config,
        })
    }

    /// Write the raw document back in its original format.
    pub fn save(&self) -> PxResult<()> {
        save_params(&self.path, &self.raw)
    }

    /// Record a resolved study version in both views.
    pub fn set_study_version(&mut self, version: u32) {
        self.config.meta.study_version = Some(version);
        let meta = self
            .raw
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert("study_version".to_string(), Value::from(version));
        }
    }

    /// Sections handed to adapter constructors.
    pub fn adapter_config(&self) -> AdapterConfig {
        let get = |key: &str| {
            self.raw
                .get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };
        AdapterConfig {
            meta: get("meta"),
            project: get("project"),
        }
    }
}

/// Write a params document, choosing the format by extension.
pub fn save_params(path: &Path, raw: &Map<String, Value>) -> PxResult<()> {
    let body = match format_of(path)? {
        Format::Json => {
            let mut body = serde_json::to_string_pretty(raw)?;
            body.push('\n');
            body
        }
        Format::Yaml => serde_yaml::to_string(raw)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)?;
    Ok(())
}
