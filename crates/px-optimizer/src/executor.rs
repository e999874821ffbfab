//! Per-trial protocol: suggest, validate, prune check, execute, classify.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use px_types::{PxError, PxResult};
use serde_json::Value;
use tracing::{info, warn};

use crate::adapters::{prune_reason, ObjectiveAdapter, PruneAdapter, TrialContext};
use crate::search::SearchSpace;
use crate::study::{Trial, TrialOutcome};

/// Runs trials for one worker process.
///
/// Construction performs the one-time adapter setup; any failure there is
/// returned and the worker must not claim trials.
pub struct TrialExecutor {
    space: SearchSpace,
    objective: Box<dyn ObjectiveAdapter>,
    pruner: Option<Box<dyn PruneAdapter>>,
    pid: u32,
    closed: bool,
}

impl std::fmt::Debug for TrialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialExecutor")
            .field("params", &self.space.len())
            .field("pruner", &self.pruner.is_some())
            .field("pid", &self.pid)
            .finish()
    }
}

fn setup_error(stage: &str, error: anyhow::Error) -> PxError {
    PxError::Worker(format!("{stage} failed: {error:#}"))
}

impl TrialExecutor {
    pub fn new(
        space: SearchSpace,
        mut objective: Box<dyn ObjectiveAdapter>,
        mut pruner: Option<Box<dyn PruneAdapter>>,
    ) -> PxResult<Self> {
        objective
            .worker_init()
            .map_err(|e| setup_error("worker_init", e))?;
        objective.setup().map_err(|e| setup_error("setup", e))?;
        if let Some(pruner) = pruner.as_mut() {
            pruner.init().map_err(|e| setup_error("prune init", e))?;
        }
        Ok(Self {
            space,
            objective,
            pruner,
            pid: std::process::id(),
            closed: false,
        })
    }

    /// Run the protocol for one claimed trial. Never fails and never
    /// unwinds; every error or panic is folded into the outcome.
    pub fn run(&mut self, trial: &mut Trial) -> TrialOutcome {
        let started = Instant::now();
        let ctx = TrialContext {
            study_name: trial.study_name().to_string(),
            trial_number: trial.number(),
            worker_pid: self.pid,
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.protocol(trial, &ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => TrialOutcome::Failed {
                error: format!("trial panicked: {}", panic_message(payload.as_ref())),
            },
        };

        let elapsed_secs = started.elapsed().as_secs_f64();
        match &outcome {
            TrialOutcome::Complete { value } => {
                info!(trial = ctx.trial_number, pid = self.pid, value, elapsed_secs, "trial done")
            }
            TrialOutcome::Pruned { reason } => {
                info!(trial = ctx.trial_number, pid = self.pid, %reason, elapsed_secs, "trial pruned")
            }
            TrialOutcome::Failed { error } => {
                warn!(trial = ctx.trial_number, pid = self.pid, %error, elapsed_secs, "trial error")
            }
        }
        outcome
    }

    fn protocol(&mut self, trial: &mut Trial, ctx: &TrialContext) -> TrialOutcome {
        let params = match self.objective.suggest_params(trial, &self.space) {
            Ok(params) => params,
            Err(e) => {
                return TrialOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let violations = self.objective.validate_trial_params(&params);
        if !violations.is_empty() {
            let reason = violations.join("; ");
            trial.set_user_attr("prune_reason", Value::String(reason.clone()));
            return TrialOutcome::Pruned { reason };
        }

        if let Some(pruner) = self.pruner.as_mut() {
            if let Err(e) = pruner.prune(&params, ctx) {
                return classify_error(trial, &e);
            }
        }

        info!(trial = ctx.trial_number, pid = self.pid, params = ?params, "trial start");
        self.objective.on_trial_start(ctx, &params);
        let objective = &mut self.objective;
        let result = panic::catch_unwind(AssertUnwindSafe(|| objective.execute(&params, ctx)));

        let outcome = match result {
            Ok(Ok(value)) if value.value.is_finite() => {
                for (key, attr) in value.user_attrs {
                    trial.set_user_attr(key, attr);
                }
                TrialOutcome::Complete { value: value.value }
            }
            Ok(Ok(value)) => TrialOutcome::Failed {
                error: format!("objective returned non-finite value {}", value.value),
            },
            Ok(Err(e)) => classify_error(trial, &e),
            Err(payload) => TrialOutcome::Failed {
                error: format!("objective panicked: {}", panic_message(payload.as_ref())),
            },
        };
        self.objective.on_trial_end(ctx, outcome.value(), &params);
        outcome
    }

    /// Run `teardown` once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.objective.teardown();
        }
    }
}

impl Drop for TrialExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

/// A prune signal becomes `Pruned`, anything else `Failed`.
fn classify_error(trial: &mut Trial, error: &anyhow::Error) -> TrialOutcome {
    match prune_reason(error) {
        Some(reason) => {
            trial.set_user_attr("prune_reason", Value::String(reason.to_string()));
            TrialOutcome::Pruned {
                reason: reason.to_string(),
            }
        }
        None => TrialOutcome::Failed {
            error: format!("{error:#}"),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{TrialPruned, TrialValue};
    use crate::sampler::RandomSampler;
    use crate::study::Study;
    use px_storage::InMemoryStore;
    use px_types::{Params, StudyDirection, TrialState, TrialStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        execute: AtomicUsize,
        start: AtomicUsize,
        end: AtomicUsize,
        teardown: AtomicUsize,
    }

    enum Behavior {
        Score,
        Reject,
        Error,
        Panic,
        NotFinite,
        Prune,
        StartPanic,
    }

    struct Scripted {
        calls: Arc<Calls>,
        behavior: Behavior,
    }

    impl ObjectiveAdapter for Scripted {
        fn teardown(&mut self) {
            self.calls.teardown.fetch_add(1, Ordering::SeqCst);
        }

        fn validate_trial_params(&self, _params: &Params) -> Vec<String> {
            match self.behavior {
                Behavior::Reject => vec!["x out of domain".to_string()],
                _ => Vec::new(),
            }
        }

        fn on_trial_start(&mut self, _ctx: &TrialContext, _params: &Params) {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            if let Behavior::StartPanic = self.behavior {
                panic!("start hook broke");
            }
        }

        fn on_trial_end(&mut self, _ctx: &TrialContext, _value: Option<f64>, _params: &Params) {
            self.calls.end.fetch_add(1, Ordering::SeqCst);
        }

        fn execute(&mut self, params: &Params, _ctx: &TrialContext) -> anyhow::Result<TrialValue> {
            self.calls.execute.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Error => anyhow::bail!("objective exploded"),
                Behavior::Panic => panic!("objective panicked hard"),
                Behavior::NotFinite => Ok(f64::NAN.into()),
                Behavior::Prune => Err(TrialPruned("plateau".into()).into()),
                _ => {
                    let x = params["x"].as_f64().unwrap_or_default();
                    Ok(TrialValue::from(x).with_attr("score", json!(x)))
                }
            }
        }
    }

    struct PruneOdd;

    impl PruneAdapter for PruneOdd {
        fn prune(&mut self, _params: &Params, ctx: &TrialContext) -> anyhow::Result<()> {
            if ctx.trial_number % 2 == 1 {
                return Err(TrialPruned(format!("odd trial {}", ctx.trial_number)).into());
            }
            Ok(())
        }
    }

    fn space() -> SearchSpace {
        SearchSpace::compile(
            json!({"x": {"range": [0.0, 1.0]}, "fixed": 5})
                .as_object()
                .unwrap(),
        )
        .unwrap()
    }

    fn study() -> Study {
        let store: Arc<dyn TrialStore> = Arc::new(InMemoryStore::new());
        Study::create_or_load(
            store,
            "exec",
            StudyDirection::Maximize,
            Box::new(RandomSampler::new(3)),
        )
        .unwrap()
        .0
    }

    fn executor(
        behavior: Behavior,
        pruner: Option<Box<dyn PruneAdapter>>,
    ) -> (TrialExecutor, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let objective = Scripted {
            calls: Arc::clone(&calls),
            behavior,
        };
        (TrialExecutor::new(space(), Box::new(objective), pruner).unwrap(), calls)
    }

    #[test]
    fn completes_and_attaches_attributes() {
        let study = study();
        let (mut exec, calls) = executor(Behavior::Score, None);
        let mut trial = study.ask().unwrap();
        let outcome = exec.run(&mut trial);

        let x = trial.params()["x"].as_f64().unwrap();
        assert_eq!(outcome, TrialOutcome::Complete { value: x });
        assert_eq!(trial.user_attrs()["score"], json!(x));
        // Fixed values are not recorded on the trial
        assert!(!trial.params().contains_key("fixed"));
        assert_eq!(calls.start.load(Ordering::SeqCst), 1);
        assert_eq!(calls.end.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validation_failure_prunes_without_executing() {
        let study = study();
        let (mut exec, calls) = executor(Behavior::Reject, None);
        let mut trial = study.ask().unwrap();
        let outcome = exec.run(&mut trial);

        assert_eq!(
            outcome,
            TrialOutcome::Pruned {
                reason: "x out of domain".into()
            }
        );
        assert_eq!(calls.execute.load(Ordering::SeqCst), 0);
        study.tell(trial, &outcome).unwrap();
        let recorded = &study.trials().unwrap()[0];
        assert_eq!(recorded.state, TrialState::Pruned);
        assert_eq!(recorded.user_attrs["prune_reason"], json!("x out of domain"));
    }

    #[test]
    fn prune_adapter_stops_selected_trials() {
        let study = study();
        let (mut exec, calls) = executor(Behavior::Score, Some(Box::new(PruneOdd)));
        let mut first = study.ask().unwrap();
        let mut second = study.ask().unwrap();
        assert!(matches!(exec.run(&mut first), TrialOutcome::Complete { .. }));
        assert_eq!(
            exec.run(&mut second),
            TrialOutcome::Pruned {
                reason: "odd trial 1".into()
            }
        );
        assert_eq!(calls.execute.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_and_panics_fail_the_trial_but_hooks_still_run() {
        let study = study();
        for behavior in [Behavior::Error, Behavior::Panic, Behavior::NotFinite] {
            let (mut exec, calls) = executor(behavior, None);
            let mut trial = study.ask().unwrap();
            let outcome = exec.run(&mut trial);
            assert_eq!(outcome.state(), TrialState::Failed, "{outcome:?}");
            assert_eq!(calls.end.load(Ordering::SeqCst), 1);
        }
    }

    struct PanickingPrune;

    impl PruneAdapter for PanickingPrune {
        fn prune(&mut self, _params: &Params, _ctx: &TrialContext) -> anyhow::Result<()> {
            panic!("prune predicate broke")
        }
    }

    #[test]
    fn panics_outside_execute_fail_the_trial() {
        let study = study();
        let (mut exec, calls) = executor(Behavior::Score, Some(Box::new(PanickingPrune)));
        let mut trial = study.ask().unwrap();
        let outcome = exec.run(&mut trial);
        match &outcome {
            TrialOutcome::Failed { error } => assert!(error.contains("prune predicate broke")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.execute.load(Ordering::SeqCst), 0);
        study.tell(trial, &outcome).unwrap();

        let (mut exec, calls) = executor(Behavior::StartPanic, None);
        let mut trial = study.ask().unwrap();
        let outcome = exec.run(&mut trial);
        assert_eq!(outcome.state(), TrialState::Failed);
        assert_eq!(calls.start.load(Ordering::SeqCst), 1);
        assert_eq!(calls.execute.load(Ordering::SeqCst), 0);
        study.tell(trial, &outcome).unwrap();

        let recorded = study.trials().unwrap();
        assert!(recorded.iter().all(|t| t.state == TrialState::Failed));
        assert!(recorded[1].user_attrs["fail_reason"]
            .as_str()
            .unwrap()
            .contains("start hook broke"));
    }

    #[test]
    fn prune_signal_from_execute_is_pruned() {
        let study = study();
        let (mut exec, _) = executor(Behavior::Prune, None);
        let mut trial = study.ask().unwrap();
        assert_eq!(
            exec.run(&mut trial),
            TrialOutcome::Pruned {
                reason: "plateau".into()
            }
        );
    }

    #[test]
    fn teardown_runs_once() {
        let (mut exec, calls) = executor(Behavior::Score, None);
        exec.close();
        drop(exec);
        assert_eq!(calls.teardown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn setup_failure_is_fatal() {
        struct Broken;
        impl ObjectiveAdapter for Broken {
            fn setup(&mut self) -> anyhow::Result<()> {
                anyhow::bail!("no gpu")
            }
            fn execute(&mut self, _: &Params, _: &TrialContext) -> anyhow::Result<TrialValue> {
                Ok(0.0.into())
            }
        }
        let err = TrialExecutor::new(space(), Box::new(Broken), None).unwrap_err();
        assert!(err.to_string().contains("setup failed: no gpu"));
    }
}
