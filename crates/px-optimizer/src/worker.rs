//! The worker loop: claim, run and report trials until a stop condition
//! holds.
//!
//! A worker is single-threaded and sequential. It finishes one trial before
//! claiming the next, and the only state it shares with other workers is
//! the trial store.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use px_types::{PxResult, TrialState, TrialStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::adapters::{
    AdapterConfig, AdapterRegistry, AdapterSelection, HookContext, HookRole, WorkerAdapter,
};
use crate::executor::TrialExecutor;
use crate::sampler::SamplerConfig;
use crate::search::SearchSpace;
use crate::study::{Study, TrialOutcome};

/// Normal stop: timeout or trial ceiling.
pub const EXIT_OK: i32 = 0;
/// Store failure: claim, report, or the count query gave up.
pub const EXIT_STORE: i32 = 1;
/// Worker could not start: adapters, setup or study load.
pub const EXIT_SETUP: i32 = 2;
/// Worker panicked.
pub const EXIT_PANIC: i32 = 101;

/// When a worker stops.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLimits {
    /// Advisory; checked only before claiming.
    pub timeout: Option<Duration>,
    /// Study-wide trial ceiling, 0 for none.
    pub n_trials: usize,
    pub count_retry_delay: Duration,
    pub max_count_errors: u32,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            n_trials: 0,
            count_retry_delay: Duration::from_millis(500),
            max_count_errors: 10,
        }
    }
}

impl WorkerLimits {
    pub fn new(n_trials: usize, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            n_trials,
            ..Self::default()
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    Timeout,
    CeilingReached,
    CountQueryFailed { attempts: u32, error: String },
    ClaimFailed(String),
    ReportFailed(String),
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            Self::Timeout | Self::CeilingReached => EXIT_OK,
            Self::CountQueryFailed { .. } | Self::ClaimFailed(_) | Self::ReportFailed(_) => {
                EXIT_STORE
            }
        }
    }
}

/// One finished trial as seen by the worker that ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub number: u64,
    pub state: TrialState,
    pub value: Option<f64>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub outcomes: Vec<WorkerOutcome>,
    pub exit: WorkerExit,
}

#[derive(Debug, Clone, Copy)]
enum HookPoint {
    Start,
    Execute,
    Finish,
    End,
}

fn hook(hooks: &mut Option<Box<dyn WorkerAdapter>>, point: HookPoint, ctx: &HookContext) {
    let Some(adapter) = hooks.as_mut() else {
        return;
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| match point {
        HookPoint::Start => adapter.on_worker_start(ctx),
        HookPoint::Execute => adapter.execute(ctx),
        HookPoint::Finish => adapter.finish(ctx),
        HookPoint::End => adapter.on_worker_end(ctx),
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(hook = ?point, trial = ?ctx.trial_number, error = %e, "worker hook failed")
        }
        Err(_) => warn!(hook = ?point, trial = ?ctx.trial_number, "worker hook panicked"),
    }
}

/// Claim and run trials until a stop condition holds.
pub fn run_loop(
    study: &Study,
    executor: &mut TrialExecutor,
    hooks: &mut Option<Box<dyn WorkerAdapter>>,
    limits: &WorkerLimits,
) -> WorkerSummary {
    let started = Instant::now();
    let pid = std::process::id();
    let mut outcomes = Vec::new();
    let mut count_errors = 0u32;

    let exit = loop {
        if let Some(timeout) = limits.timeout {
            if started.elapsed() > timeout {
                info!(pid, study = study.name(), "timeout reached");
                break WorkerExit::Timeout;
            }
        }

        if limits.n_trials > 0 {
            match study.trial_count() {
                Ok(count) => {
                    count_errors = 0;
                    if count >= limits.n_trials {
                        info!(pid, study = study.name(), count, "trial ceiling reached");
                        break WorkerExit::CeilingReached;
                    }
                }
                Err(e) => {
                    count_errors += 1;
                    if count_errors >= limits.max_count_errors {
                        error!(pid, attempts = count_errors, error = %e, "storage error; giving up");
                        break WorkerExit::CountQueryFailed {
                            attempts: count_errors,
                            error: e.to_string(),
                        };
                    }
                    warn!(pid, attempts = count_errors, error = %e, "storage error; retrying");
                    thread::sleep(limits.count_retry_delay);
                    continue;
                }
            }
        }

        let mut trial = match study.ask() {
            Ok(trial) => trial,
            Err(e) => {
                error!(pid, study = study.name(), error = %e, "claiming a trial failed");
                break WorkerExit::ClaimFailed(e.to_string());
            }
        };

        let number = trial.number();
        let trial_started = Instant::now();
        let mut ctx = HookContext::new(HookRole::Worker, study.name(), "execute").for_trial(number);
        hook(hooks, HookPoint::Execute, &ctx);

        let outcome = executor.run(&mut trial);
        ctx.phase = "finish";
        ctx.params = Some(trial.params().clone());
        ctx.user_attrs = Some(trial.user_attrs().clone());
        ctx.value = outcome.value();
        ctx.state = Some(outcome.state());
        if let TrialOutcome::Failed { error } = &outcome {
            ctx.error = Some(error.clone());
        }

        let reported = study.tell(trial, &outcome);
        hook(hooks, HookPoint::Finish, &ctx);
        outcomes.push(WorkerOutcome {
            number,
            state: outcome.state(),
            value: outcome.value(),
            elapsed: trial_started.elapsed(),
            error: ctx.error.take(),
        });
        if let Err(e) = reported {
            error!(pid, trial = number, error = %e, "reporting a trial failed");
            break WorkerExit::ReportFailed(e.to_string());
        }
    };

    WorkerSummary { outcomes, exit }
}

/// Everything a worker needs besides its assignment.
#[derive(Clone)]
pub struct WorkerSetup {
    pub store: Arc<dyn TrialStore>,
    pub space: SearchSpace,
    pub registry: AdapterRegistry,
    pub adapters: AdapterSelection,
    pub adapter_config: AdapterConfig,
    pub sampler: SamplerConfig,
}

impl std::fmt::Debug for WorkerSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSetup")
            .field("params", &self.space.len())
            .field("adapters", &self.adapters)
            .field("sampler", &self.sampler)
            .finish()
    }
}

/// What one worker is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerAssignment {
    pub study_name: String,
    pub index: usize,
    pub limits: WorkerLimits,
}

/// Serialized assignment passed to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub params_path: std::path::PathBuf,
    pub study_name: String,
    pub index: usize,
    pub n_trials: usize,
    /// Seconds; 0 for none.
    pub timeout_sec: f64,
    pub adapters: AdapterSelection,
}

impl WorkerSpec {
    pub fn assignment(&self) -> WorkerAssignment {
        let timeout = (self.timeout_sec > 0.0).then(|| Duration::from_secs_f64(self.timeout_sec));
        WorkerAssignment {
            study_name: self.study_name.clone(),
            index: self.index,
            limits: WorkerLimits::new(self.n_trials, timeout),
        }
    }
}

fn start(
    setup: &WorkerSetup,
    assignment: &WorkerAssignment,
) -> PxResult<(Study, TrialExecutor, Option<Box<dyn WorkerAdapter>>)> {
    let config = &setup.adapter_config;
    let objective = (setup.registry.objective(&setup.adapters.objective)?)(config)
        .map_err(|e| px_types::config_error!("objective adapter construction failed: {:#}", e))?;
    let pruner = match &setup.adapters.prune {
        Some(name) => Some((setup.registry.prune(name)?)(config).map_err(|e| {
            px_types::config_error!("prune adapter construction failed: {:#}", e)
        })?),
        None => None,
    };
    let hooks = match &setup.adapters.worker {
        Some(name) => Some((setup.registry.worker(name)?)(config).map_err(|e| {
            px_types::config_error!("worker adapter construction failed: {:#}", e)
        })?),
        None => None,
    };
    let executor = TrialExecutor::new(setup.space.clone(), objective, pruner)?;
    let (study, _) = Study::load(
        Arc::clone(&setup.store),
        &assignment.study_name,
        setup.sampler.build()?,
    )?;
    Ok((study, executor, hooks))
}

/// Run one worker to completion and return its exit code.
pub fn run_worker(setup: &WorkerSetup, assignment: &WorkerAssignment) -> i32 {
    let pid = std::process::id();
    let (study, mut executor, mut hooks) = match start(setup, assignment) {
        Ok(parts) => parts,
        Err(e) => {
            error!(pid, worker = assignment.index, error = %e, "worker setup failed");
            return EXIT_SETUP;
        }
    };
    info!(pid, worker = assignment.index, study = study.name(), "started");

    let ctx = HookContext::new(HookRole::Worker, study.name(), "start");
    hook(&mut hooks, HookPoint::Start, &ctx);
    let summary = run_loop(&study, &mut executor, &mut hooks, &assignment.limits);
    executor.close();
    let ctx = HookContext::new(HookRole::Worker, study.name(), "end");
    hook(&mut hooks, HookPoint::End, &ctx);

    let completed = summary
        .outcomes
        .iter()
        .filter(|o| o.state == TrialState::Complete)
        .count();
    info!(
        pid,
        worker = assignment.index,
        trials = summary.outcomes.len(),
        completed,
        exit = ?summary.exit,
        "worker finished"
    );
    summary.exit.code()
}
