//! # px-optimizer
//!
//! Parallel parameter search for Parallax.
//!
//! Provides search-space compilation, samplers (grid, random, Bayesian,
//! quasi-random), the ask/tell study surface, the per-trial execution
//! protocol, the worker loop and its multi-process supervisor, study
//! versioning, and best-result aggregation.

mod adapters;
mod aggregate;
mod config;
mod executor;
mod reporting;
mod runner;
mod sampler;
mod search;
mod study;
mod supervisor;
mod version;
mod worker;

pub use adapters::{
    prune_reason, AdapterConfig, AdapterRegistry, AdapterSelection, HookContext, HookRole,
    MasterAdapter, ObjectiveAdapter, PruneAdapter, TrialContext, TrialPruned, TrialValue,
    WorkerAdapter,
};
pub use aggregate::{aggregate, best_trial, BestResult};
pub use config::{save_params, MetaConfig, OptimizerConfig, ParamsDocument, RunConfig};
pub use executor::TrialExecutor;
pub use reporting::{read_best_json, write_best_json};
pub use runner::{
    prepare, run, run_study, run_worker_spec, AdapterOverrides, PreparedRun, RunOptions,
    RunSummary, DIRECTION,
};
pub use sampler::{
    BayesianSampler, Distribution, GridSampler, QmcSampler, RandomSampler, SampleContext,
    Sampler, SamplerConfig, SamplerKind,
};
pub use search::{
    flatten, is_spec_marker, normalize, parse_spec, rebuild_tree, resolve_value, suggest_params,
    suggest_value, ParamSpec, SearchSpace,
};
pub use study::{Study, Trial, TrialOutcome};
pub use supervisor::{
    InProcessLauncher, ProcessLauncher, SupervisorReport, WorkerHandle, WorkerLauncher,
    WorkerSupervisor, EXIT_SIGNALED,
};
pub use version::{
    format_study_name, next_free_version, resolve_study_name, StudyIdentity, MAX_VERSION_PROBES,
};
pub use worker::{
    run_loop, run_worker, WorkerAssignment, WorkerExit, WorkerLimits, WorkerOutcome, WorkerSetup,
    WorkerSpec, WorkerSummary, EXIT_OK, EXIT_PANIC, EXIT_SETUP, EXIT_STORE,
};
