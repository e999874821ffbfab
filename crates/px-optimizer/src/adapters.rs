//! Capability interfaces for user code, one per role, and the registry
//! that maps configured names to constructors.
//!
//! A run names its adapters in configuration; each process resolves them
//! once at startup through an [`AdapterRegistry`] handed in by the binary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use px_types::{config_error, Params, PxResult, TrialState, UserAttrs};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::search::{self, SearchSpace};
use crate::study::Trial;

/// Explicit early stop of one trial. Return it from user code as an
/// `anyhow::Error`; it is recovered by downcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trial pruned: {0}")]
pub struct TrialPruned(pub String);

/// Identity of the trial a callback is running for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialContext {
    pub study_name: String,
    pub trial_number: u64,
    pub worker_pid: u32,
}

/// What an objective returns: a score, optionally with attributes to
/// attach to the trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialValue {
    pub value: f64,
    pub user_attrs: UserAttrs,
}

impl TrialValue {
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_attrs.insert(key.into(), value.into());
        self
    }
}

impl From<f64> for TrialValue {
    fn from(value: f64) -> Self {
        Self {
            value,
            user_attrs: UserAttrs::new(),
        }
    }
}

/// Configuration sections handed to every adapter constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub meta: Map<String, Value>,
    pub project: Map<String, Value>,
}

/// User objective.
pub trait ObjectiveAdapter: Send {
    /// Once per worker process, before `setup`.
    fn worker_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once per worker process, after `worker_init`.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once when the worker loop ends.
    fn teardown(&mut self) {}

    /// Checked once at startup; any message aborts the run.
    fn validate_search_space(&self, _space: &SearchSpace) -> Vec<String> {
        Vec::new()
    }

    /// Checked per trial; any message prunes the trial.
    fn validate_trial_params(&self, _params: &Params) -> Vec<String> {
        Vec::new()
    }

    /// Produce the trial's parameters. Override to add conditional or
    /// derived parameters.
    fn suggest_params(&self, trial: &mut Trial, space: &SearchSpace) -> PxResult<Params> {
        search::suggest_params(trial, space)
    }

    fn on_trial_start(&mut self, _ctx: &TrialContext, _params: &Params) {}

    fn on_trial_end(&mut self, _ctx: &TrialContext, _value: Option<f64>, _params: &Params) {}

    /// Evaluate one parameter assignment.
    fn execute(&mut self, params: &Params, ctx: &TrialContext) -> anyhow::Result<TrialValue>;
}

/// Optional pre-execution prune check.
pub trait PruneAdapter: Send {
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return a [`TrialPruned`] error to stop the trial before it executes.
    fn prune(&mut self, params: &Params, ctx: &TrialContext) -> anyhow::Result<()>;
}

/// Which process role a hook runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookRole {
    Worker,
    Master,
}

/// Data passed to worker and master hooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookContext {
    pub role: HookRole,
    pub study_name: String,
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_attrs: Option<UserAttrs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TrialState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookContext {
    pub fn new(role: HookRole, study_name: &str, phase: &'static str) -> Self {
        Self {
            role,
            study_name: study_name.to_string(),
            phase,
            trial_number: None,
            params: None,
            user_attrs: None,
            value: None,
            state: None,
            error: None,
        }
    }

    pub fn for_trial(mut self, number: u64) -> Self {
        self.trial_number = Some(number);
        self
    }
}

/// Observability hooks around a worker's life and each claimed trial.
/// Errors are logged, never acted on.
pub trait WorkerAdapter: Send {
    fn on_worker_start(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_worker_end(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks run by the launching process around the whole study.
pub trait MasterAdapter: Send {
    fn init(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once per reloaded trial after all workers exit.
    fn execute(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type ObjectiveFactory =
    Arc<dyn Fn(&AdapterConfig) -> anyhow::Result<Box<dyn ObjectiveAdapter>> + Send + Sync>;
pub type PruneFactory =
    Arc<dyn Fn(&AdapterConfig) -> anyhow::Result<Box<dyn PruneAdapter>> + Send + Sync>;
pub type WorkerFactory =
    Arc<dyn Fn(&AdapterConfig) -> anyhow::Result<Box<dyn WorkerAdapter>> + Send + Sync>;
pub type MasterFactory =
    Arc<dyn Fn(&AdapterConfig) -> anyhow::Result<Box<dyn MasterAdapter>> + Send + Sync>;

/// Names of the adapters a run uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSelection {
    pub objective: String,
    #[serde(default)]
    pub prune: Option<String>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub master: Option<String>,
}

/// Name → constructor table for every adapter role.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    objectives: BTreeMap<String, ObjectiveFactory>,
    pruners: BTreeMap<String, PruneFactory>,
    workers: BTreeMap<String, WorkerFactory>,
    masters: BTreeMap<String, MasterFactory>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("objectives", &self.objectives.keys().collect::<Vec<_>>())
            .field("pruners", &self.pruners.keys().collect::<Vec<_>>())
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("masters", &self.masters.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn missing(role: &str, name: &str, known: Vec<&String>) -> px_types::PxError {
    config_error!(
        "Unknown {} adapter '{}'. Registered: {:?}",
        role,
        name,
        known
    )
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_objective<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&AdapterConfig) -> anyhow::Result<Box<dyn ObjectiveAdapter>> + Send + Sync + 'static,
    {
        self.objectives.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn register_prune<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&AdapterConfig) -> anyhow::Result<Box<dyn PruneAdapter>> + Send + Sync + 'static,
    {
        self.pruners.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn register_worker<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&AdapterConfig) -> anyhow::Result<Box<dyn WorkerAdapter>> + Send + Sync + 'static,
    {
        self.workers.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn register_master<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&AdapterConfig) -> anyhow::Result<Box<dyn MasterAdapter>> + Send + Sync + 'static,
    {
        self.masters.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn objective(&self, name: &str) -> PxResult<ObjectiveFactory> {
        self.objectives
            .get(name)
            .cloned()
            .ok_or_else(|| missing("objective", name, self.objectives.keys().collect()))
    }

    pub fn prune(&self, name: &str) -> PxResult<PruneFactory> {
        self.pruners
            .get(name)
            .cloned()
            .ok_or_else(|| missing("prune", name, self.pruners.keys().collect()))
    }

    pub fn worker(&self, name: &str) -> PxResult<WorkerFactory> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| missing("worker", name, self.workers.keys().collect()))
    }

    pub fn master(&self, name: &str) -> PxResult<MasterFactory> {
        self.masters
            .get(name)
            .cloned()
            .ok_or_else(|| missing("master", name, self.masters.keys().collect()))
    }

    /// Check that every name in the selection is registered.
    pub fn check(&self, selection: &AdapterSelection) -> PxResult<()> {
        self.objective(&selection.objective)?;
        if let Some(name) = &selection.prune {
            self.prune(name)?;
        }
        if let Some(name) = &selection.worker {
            self.worker(name)?;
        }
        if let Some(name) = &selection.master {
            self.master(name)?;
        }
        Ok(())
    }
}

/// Whether `error` is an explicit prune signal, and its reason.
pub fn prune_reason(error: &anyhow::Error) -> Option<&str> {
    error.downcast_ref::<TrialPruned>().map(|p| p.0.as_str())
}
