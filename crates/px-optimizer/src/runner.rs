//! Run orchestration: startup checks, study identity, worker pool, master
//! hooks, aggregation and the result document.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use px_storage::{is_persistent, open_store};
use px_types::{config_error, PxError, PxResult, StudyDirection, TrialStore};
use tracing::{error, info, warn};

use crate::adapters::{AdapterRegistry, AdapterSelection, HookContext, HookRole, MasterAdapter};
use crate::aggregate::{aggregate, BestResult};
use crate::config::ParamsDocument;
use crate::reporting::write_best_json;
use crate::sampler::SamplerConfig;
use crate::search::SearchSpace;
use crate::supervisor::{ProcessLauncher, SupervisorReport, WorkerLauncher, WorkerSupervisor};
use crate::version::{resolve_study_name, StudyIdentity};
use crate::worker::{run_worker, WorkerLimits, WorkerSetup, WorkerSpec, EXIT_SETUP};

/// This core always maximizes; minimize by negating the objective.
pub const DIRECTION: StudyDirection = StudyDirection::Maximize;

/// Adapter names given on the command line; each overrides `meta`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOverrides {
    pub objective: Option<String>,
    pub prune: Option<String>,
    pub worker: Option<String>,
    pub master: Option<String>,
}

/// Caller-supplied options for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub params_path: PathBuf,
    /// Reuse the requested study version even if it exists.
    pub continue_study: bool,
    /// Replaces `optimizer.n_trials`.
    pub n_trials: Option<i64>,
    pub adapters: AdapterOverrides,
}

/// A validated run, ready to launch workers.
pub struct PreparedRun {
    pub doc: ParamsDocument,
    pub identity: StudyIdentity,
    pub store: Arc<dyn TrialStore>,
    pub space: SearchSpace,
    pub sampler: SamplerConfig,
    pub adapters: AdapterSelection,
    pub n_trials: usize,
    pub n_jobs: usize,
    pub timeout: Option<Duration>,
    pub out_path: PathBuf,
}

impl std::fmt::Debug for PreparedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRun")
            .field("identity", &self.identity)
            .field("adapters", &self.adapters)
            .field("n_trials", &self.n_trials)
            .field("n_jobs", &self.n_jobs)
            .field("timeout", &self.timeout)
            .field("out_path", &self.out_path)
            .finish()
    }
}

impl PreparedRun {
    pub fn limits(&self) -> WorkerLimits {
        WorkerLimits::new(self.n_trials, self.timeout)
    }

    /// Setup for workers that run inside this process.
    pub fn worker_setup(&self, registry: &AdapterRegistry) -> WorkerSetup {
        WorkerSetup {
            store: Arc::clone(&self.store),
            space: self.space.clone(),
            registry: registry.clone(),
            adapters: self.adapters.clone(),
            adapter_config: self.doc.adapter_config(),
            sampler: self.sampler.clone(),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub best: BestResult,
    pub out_path: PathBuf,
    pub workers: SupervisorReport,
}

fn positive(value: i64, name: &str) -> PxResult<usize> {
    if value < 1 {
        return Err(config_error!("{} must be >= 1, got {}", name, value));
    }
    usize::try_from(value).map_err(|_| config_error!("{} is too large: {}", name, value))
}

fn selection(doc: &ParamsDocument, overrides: &AdapterOverrides) -> PxResult<AdapterSelection> {
    let meta = &doc.config.meta;
    let objective = overrides
        .objective
        .clone()
        .or_else(|| meta.objective_adapter.clone())
        .ok_or_else(|| {
            config_error!(
                "Objective adapter not configured; set meta.objective_adapter or --objective-adapter."
            )
        })?;
    Ok(AdapterSelection {
        objective,
        prune: overrides.prune.clone().or_else(|| meta.prune_adapter.clone()),
        worker: overrides.worker.clone().or_else(|| meta.worker_adapter.clone()),
        master: overrides.master.clone().or_else(|| meta.master_adapter.clone()),
    })
}

/// Everything that must hold before a worker starts. Resolves the study
/// identity, writes a bumped version back to the params file and creates
/// the study.
pub fn prepare(options: &RunOptions, registry: &AdapterRegistry) -> PxResult<PreparedRun> {
    let mut doc = ParamsDocument::load(&options.params_path)?;
    let cfg = doc.config.clone();
    let opt = &cfg.optimizer;

    let mut n_trials = positive(options.n_trials.unwrap_or(opt.n_trials), "n_trials")?;
    let n_jobs = positive(opt.n_jobs, "n_jobs")?;
    if n_trials < n_jobs {
        return Err(config_error!(
            "n_trials ({}) must be >= n_jobs ({}).",
            n_trials,
            n_jobs
        ));
    }

    let sampler = opt.sampler_config(cfg.meta.seed)?;
    sampler.build()?;
    if let Some(grid_size) = sampler.grid_size()? {
        if n_trials > grid_size {
            info!(n_trials, grid_size, "capping n_trials at grid size");
            n_trials = grid_size;
        }
    }

    let space = SearchSpace::compile(&cfg.search_space)?;
    let adapters = selection(&doc, &options.adapters)?;
    registry.check(&adapters)?;

    let mut objective = (registry.objective(&adapters.objective)?)(&doc.adapter_config())
        .map_err(|e| config_error!("objective adapter construction failed: {:#}", e))?;
    let errors = objective.validate_search_space(&space);
    objective.teardown();
    if !errors.is_empty() {
        return Err(config_error!(
            "Invalid search_space configuration:\n  {}",
            errors.join("\n  ")
        ));
    }

    let url = opt.storage_url().filter(|u| is_persistent(u)).ok_or_else(|| {
        config_error!(
            "Multiprocess optimization requires a persistent storage url (optimizer.storage_url or optimizer.storage_path)."
        )
    })?;
    let store = open_store(&url, Duration::from_secs(opt.sqlite_timeout_sec))?;

    let requested = cfg.meta.study_version;
    let identity = resolve_study_name(
        Some(store.as_ref()),
        cfg.meta.name.trim(),
        requested,
        options.continue_study,
    )?;
    if let Some(version) = identity.version.filter(|v| Some(*v) != requested) {
        doc.set_study_version(version);
        doc.save()?;
        info!(path = %doc.path.display(), version, "wrote resolved study version");
    }

    store.create_or_load_study(&identity.name, DIRECTION, &opt.sampler)?;
    info!(
        study = %identity.name,
        n_trials,
        n_jobs,
        sampler = %opt.sampler,
        params = space.len(),
        "study ready"
    );

    Ok(PreparedRun {
        timeout: (opt.timeout_sec > 0).then(|| Duration::from_secs(opt.timeout_sec)),
        out_path: opt.out_path.clone(),
        doc,
        identity,
        store,
        space,
        sampler,
        adapters,
        n_trials,
        n_jobs,
    })
}

#[derive(Debug, Clone, Copy)]
enum MasterPhase {
    Init,
    Execute,
    Finish,
}

fn master_hook(adapter: &mut dyn MasterAdapter, phase: MasterPhase, ctx: &HookContext) {
    let result = match phase {
        MasterPhase::Init => adapter.init(ctx),
        MasterPhase::Execute => adapter.execute(ctx),
        MasterPhase::Finish => adapter.finish(ctx),
    };
    if let Err(e) = result {
        warn!(hook = ?phase, trial = ?ctx.trial_number, error = %e, "master hook failed");
    }
}

/// Launch the worker pool for a prepared run and aggregate the result.
pub async fn run_study(
    prepared: PreparedRun,
    registry: &AdapterRegistry,
    launcher: Arc<dyn WorkerLauncher>,
) -> PxResult<RunSummary> {
    let study_name = prepared.identity.name.clone();
    let mut master = match &prepared.adapters.master {
        Some(name) => Some((registry.master(name)?)(&prepared.doc.adapter_config()).map_err(
            |e| config_error!("master adapter construction failed: {:#}", e),
        )?),
        None => None,
    };
    if let Some(master) = master.as_deref_mut() {
        let ctx = HookContext::new(HookRole::Master, &study_name, "init");
        master_hook(master, MasterPhase::Init, &ctx);
    }

    let supervisor = WorkerSupervisor::new(
        launcher,
        study_name.clone(),
        prepared.n_jobs,
        prepared.limits(),
    );
    let workers = supervisor.run().await;

    let trials = prepared.store.trials(&study_name)?;
    if let Some(master) = master.as_deref_mut() {
        for trial in &trials {
            let mut ctx =
                HookContext::new(HookRole::Master, &study_name, "trial").for_trial(trial.number);
            ctx.params = Some(trial.params.clone());
            ctx.user_attrs = Some(trial.user_attrs.clone());
            ctx.value = trial.value;
            ctx.state = Some(trial.state);
            master_hook(master, MasterPhase::Execute, &ctx);
            master_hook(master, MasterPhase::Finish, &ctx);
        }
    }

    let best = aggregate(
        &prepared.identity,
        &prepared.space,
        &trials,
        DIRECTION,
        workers.failed_workers,
    )?;
    write_best_json(&prepared.out_path, &best)?;
    Ok(RunSummary {
        best,
        out_path: prepared.out_path,
        workers,
    })
}

/// Full run with one OS process per worker.
pub async fn run(options: &RunOptions, registry: &AdapterRegistry) -> PxResult<RunSummary> {
    let prepared = prepare(options, registry)?;
    let launcher = ProcessLauncher::current_exe(
        options.params_path.clone(),
        prepared.adapters.clone(),
    )?;
    run_study(prepared, registry, Arc::new(launcher)).await
}

fn worker_setup_from_spec(spec: &WorkerSpec, registry: &AdapterRegistry) -> PxResult<WorkerSetup> {
    let doc = ParamsDocument::load(&spec.params_path)?;
    let opt = &doc.config.optimizer;
    let url = opt
        .storage_url()
        .ok_or_else(|| PxError::Worker("params file names no storage".to_string()))?;
    let store = open_store(&url, Duration::from_secs(opt.sqlite_timeout_sec))?;
    Ok(WorkerSetup {
        store,
        space: SearchSpace::compile(&doc.config.search_space)?,
        registry: registry.clone(),
        adapters: spec.adapters.clone(),
        adapter_config: doc.adapter_config(),
        sampler: opt.sampler_config(doc.config.meta.seed)?,
    })
}

/// Entry point of a worker process. Returns the process exit code.
pub fn run_worker_spec(spec: &WorkerSpec, registry: &AdapterRegistry) -> i32 {
    match worker_setup_from_spec(spec, registry) {
        Ok(setup) => run_worker(&setup, &spec.assignment()),
        Err(e) => {
            error!(worker = spec.index, error = %e, "worker setup failed");
            EXIT_SETUP
        }
    }
}
