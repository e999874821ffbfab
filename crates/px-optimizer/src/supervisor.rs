//! Launching a fixed pool of workers against one study and waiting for
//! all of them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use px_types::{PxError, PxResult};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::AdapterSelection;
use crate::worker::{
    run_worker, WorkerAssignment, WorkerLimits, WorkerSetup, WorkerSpec, EXIT_PANIC,
};

/// Exit code reported for a worker killed by a signal.
pub const EXIT_SIGNALED: i32 = -1;

/// A running worker.
#[derive(Debug)]
pub enum WorkerHandle {
    /// A separate OS process.
    Process(Child),
    /// A blocking task inside this process.
    Task(JoinHandle<i32>),
}

impl WorkerHandle {
    /// Wait for the worker and return its exit code.
    pub async fn wait(self) -> i32 {
        match self {
            Self::Process(mut child) => match child.wait().await {
                Ok(status) => status.code().unwrap_or(EXIT_SIGNALED),
                Err(e) => {
                    warn!(error = %e, "waiting for worker process failed");
                    EXIT_SIGNALED
                }
            },
            Self::Task(handle) => match handle.await {
                Ok(code) => code,
                Err(e) => {
                    warn!(error = %e, "worker task panicked");
                    EXIT_PANIC
                }
            },
        }
    }
}

/// How workers are started.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, assignment: &WorkerAssignment) -> PxResult<WorkerHandle>;
}

/// Starts each worker as a fresh copy of a binary running the hidden
/// `worker --spec <json>` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Binary to execute; normally the current executable.
    pub program: PathBuf,
    /// Params document every worker loads.
    pub params_path: PathBuf,
    pub adapters: AdapterSelection,
    /// `RUST_LOG` for workers when the parent has none set.
    pub log_filter: Option<String>,
}

impl ProcessLauncher {
    /// Launch workers from the running binary.
    pub fn current_exe(params_path: PathBuf, adapters: AdapterSelection) -> PxResult<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            params_path,
            adapters,
            log_filter: None,
        })
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn spec(&self, assignment: &WorkerAssignment) -> WorkerSpec {
        WorkerSpec {
            params_path: self.params_path.clone(),
            study_name: assignment.study_name.clone(),
            index: assignment.index,
            n_trials: assignment.limits.n_trials,
            timeout_sec: assignment
                .limits
                .timeout
                .map(|t| t.as_secs_f64())
                .unwrap_or(0.0),
            adapters: self.adapters.clone(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, assignment: &WorkerAssignment) -> PxResult<WorkerHandle> {
        let spec = serde_json::to_string(&self.spec(assignment))?;
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--spec")
            .arg(&spec)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(filter) = &self.log_filter {
            if std::env::var_os("RUST_LOG").is_none() {
                cmd.env("RUST_LOG", filter);
            }
        }
        let child = cmd.spawn().map_err(|e| {
            PxError::Worker(format!(
                "failed to spawn worker {} from {}: {e}",
                assignment.index,
                self.program.display()
            ))
        })?;
        debug!(worker = assignment.index, pid = ?child.id(), "spawned worker process");
        Ok(WorkerHandle::Process(child))
    }
}

/// Runs workers on blocking tasks of the current runtime.
///
/// Workers still share nothing but the store handed in through the setup.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    setup: Arc<WorkerSetup>,
}

impl InProcessLauncher {
    pub fn new(setup: WorkerSetup) -> Self {
        Self {
            setup: Arc::new(setup),
        }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, assignment: &WorkerAssignment) -> PxResult<WorkerHandle> {
        let setup = Arc::clone(&self.setup);
        let assignment = assignment.clone();
        let handle = tokio::task::spawn_blocking(move || run_worker(&setup, &assignment));
        Ok(WorkerHandle::Task(handle))
    }
}

/// Exit status of every worker in a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    /// One entry per worker, in launch order. Workers that failed to spawn
    /// are recorded with [`EXIT_SIGNALED`].
    pub exit_codes: Vec<i32>,
    pub failed_workers: usize,
}

/// Supervises a fixed pool of workers for one study.
///
/// Failed workers are counted and logged, never retried, and trials they
/// left claimed are not reassigned.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    study_name: String,
    n_workers: usize,
    limits: WorkerLimits,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("study_name", &self.study_name)
            .field("n_workers", &self.n_workers)
            .field("limits", &self.limits)
            .finish()
    }
}

impl WorkerSupervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        study_name: impl Into<String>,
        n_workers: usize,
        limits: WorkerLimits,
    ) -> Self {
        Self {
            launcher,
            study_name: study_name.into(),
            n_workers,
            limits,
        }
    }

    /// Launch every worker, then wait for all of them.
    pub async fn run(&self) -> SupervisorReport {
        info!(
            study = %self.study_name,
            workers = self.n_workers,
            n_trials = self.limits.n_trials,
            "launching workers"
        );
        let mut handles = Vec::with_capacity(self.n_workers);
        for index in 0..self.n_workers {
            let assignment = WorkerAssignment {
                study_name: self.study_name.clone(),
                index,
                limits: self.limits.clone(),
            };
            match self.launcher.launch(&assignment) {
                Ok(handle) => handles.push(Some(handle)),
                Err(e) => {
                    warn!(worker = index, error = %e, "worker failed to launch");
                    handles.push(None);
                }
            }
        }

        let mut exit_codes = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let code = match handle {
                Some(handle) => handle.wait().await,
                None => EXIT_SIGNALED,
            };
            debug!(worker = index, code, "worker exited");
            exit_codes.push(code);
        }

        let failed_workers = exit_codes.iter().filter(|code| **code != 0).count();
        if failed_workers > 0 {
            warn!("{failed_workers} worker(s) exited with non-zero code");
        }
        SupervisorReport {
            exit_codes,
            failed_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        AdapterConfig, AdapterRegistry, ObjectiveAdapter, TrialContext, TrialValue,
    };
    use crate::sampler::{SamplerConfig, SamplerKind};
    use crate::search::SearchSpace;
    use crate::worker::{EXIT_SETUP, EXIT_STORE};
    use px_storage::InMemoryStore;
    use px_types::{Params, StudyDirection, TrialState, TrialStore};
    use serde_json::json;
    use std::time::Duration;

    struct Quadratic;

    impl ObjectiveAdapter for Quadratic {
        fn execute(&mut self, params: &Params, _ctx: &TrialContext) -> anyhow::Result<TrialValue> {
            let x = params["x"].as_f64().unwrap_or_default();
            std::thread::sleep(Duration::from_millis(1));
            Ok((-(x - 0.5).powi(2)).into())
        }
    }

    fn setup(store: Arc<dyn TrialStore>) -> WorkerSetup {
        let mut registry = AdapterRegistry::new();
        registry.register_objective("quadratic", |_| Ok(Box::new(Quadratic)));
        WorkerSetup {
            store,
            space: SearchSpace::compile(json!({"x": [0.0, 1.0]}).as_object().unwrap()).unwrap(),
            registry,
            adapters: AdapterSelection {
                objective: "quadratic".into(),
                ..Default::default()
            },
            adapter_config: AdapterConfig::default(),
            sampler: SamplerConfig {
                kind: SamplerKind::Random,
                seed: 5,
                grid_params: None,
                exploration_weight: 0.3,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_respects_trial_ceiling() {
        let store: Arc<dyn TrialStore> = Arc::new(InMemoryStore::new());
        store
            .create_or_load_study("pool", StudyDirection::Maximize, "random")
            .unwrap();
        let launcher = Arc::new(InProcessLauncher::new(setup(Arc::clone(&store))));
        let (n_trials, n_workers) = (20, 4);
        let supervisor =
            WorkerSupervisor::new(launcher, "pool", n_workers, WorkerLimits::new(n_trials, None));

        let report = supervisor.run().await;
        assert_eq!(report.exit_codes, vec![0; n_workers]);
        assert_eq!(report.failed_workers, 0);

        let trials = store.trials("pool").unwrap();
        assert!(trials.len() >= n_trials && trials.len() <= n_trials + n_workers);
        assert!(trials.iter().all(|t| t.state == TrialState::Complete));
        let mut numbers: Vec<u64> = trials.iter().map(|t| t.number).collect();
        numbers.dedup();
        assert_eq!(numbers.len(), trials.len());
    }

    #[tokio::test]
    async fn failed_workers_are_counted_not_retried() {
        struct Refuse;
        impl WorkerLauncher for Refuse {
            fn launch(&self, assignment: &WorkerAssignment) -> PxResult<WorkerHandle> {
                let code = if assignment.index == 0 { EXIT_STORE } else { 0 };
                Ok(WorkerHandle::Task(tokio::spawn(async move { code })))
            }
        }
        let supervisor = WorkerSupervisor::new(Arc::new(Refuse), "s", 3, WorkerLimits::new(3, None));
        let report = supervisor.run().await;
        assert_eq!(report.exit_codes, vec![EXIT_STORE, 0, 0]);
        assert_eq!(report.failed_workers, 1);
    }

    #[tokio::test]
    async fn missing_study_fails_every_worker() {
        let store: Arc<dyn TrialStore> = Arc::new(InMemoryStore::new());
        let launcher = Arc::new(InProcessLauncher::new(setup(store)));
        let supervisor = WorkerSupervisor::new(launcher, "absent", 2, WorkerLimits::new(4, None));
        let report = supervisor.run().await;
        assert_eq!(report.exit_codes, vec![EXIT_SETUP, EXIT_SETUP]);
        assert_eq!(report.failed_workers, 2);
    }

    #[test]
    fn process_spec_carries_assignment() {
        let launcher = ProcessLauncher {
            program: "/usr/bin/parallax".into(),
            params_path: "run.yaml".into(),
            adapters: AdapterSelection {
                objective: "trace".into(),
                ..Default::default()
            },
            log_filter: None,
        };
        let spec = launcher.spec(&WorkerAssignment {
            study_name: "demo_v3".into(),
            index: 2,
            limits: WorkerLimits::new(50, Some(Duration::from_secs(90))),
        });
        assert_eq!(spec.study_name, "demo_v3");
        assert_eq!(spec.index, 2);
        assert_eq!(spec.n_trials, 50);
        assert_eq!(spec.timeout_sec, 90.0);
    }

    #[tokio::test]
    async fn spawn_failure_counts_as_failed_worker() {
        let launcher = ProcessLauncher {
            program: "/nonexistent/parallax-worker".into(),
            params_path: "run.yaml".into(),
            adapters: AdapterSelection::default(),
            log_filter: Some("warn".into()),
        };
        let supervisor = WorkerSupervisor::new(Arc::new(launcher), "s", 1, WorkerLimits::new(1, None));
        let report = supervisor.run().await;
        assert_eq!(report.failed_workers, 1);
    }
}
