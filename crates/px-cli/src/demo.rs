//! "trace" adapters: a toy objective plus hooks that log every call.
//! Useful for checking a params file end to end.

use std::time::Duration;

use px_optimizer::{
    AdapterConfig, AdapterRegistry, HookContext, MasterAdapter, ObjectiveAdapter, PruneAdapter,
    TrialContext, TrialPruned, TrialValue, WorkerAdapter,
};
use px_types::Params;
use tracing::info;

pub const TRACE: &str = "trace";

/// Scores a trial as the sum of its numeric parameters.
#[derive(Debug, Clone)]
pub struct TraceObjective {
    delay: Duration,
}

impl TraceObjective {
    /// `project.trace_delay_ms` sets the simulated work per trial.
    pub fn new(config: &AdapterConfig) -> Self {
        let delay_ms = config
            .project
            .get("trace_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(200);
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl ObjectiveAdapter for TraceObjective {
    fn execute(&mut self, params: &Params, ctx: &TrialContext) -> anyhow::Result<TrialValue> {
        info!(trial = ctx.trial_number, params = ?params, "trace objective");
        std::thread::sleep(self.delay);
        let score: f64 = params.values().filter_map(|v| v.as_f64()).sum();
        Ok(TrialValue::from(score).with_attr("score", score))
    }
}

/// Prunes trial 1 to show the prune path.
#[derive(Debug, Clone, Default)]
pub struct TracePrune;

impl PruneAdapter for TracePrune {
    fn prune(&mut self, _params: &Params, ctx: &TrialContext) -> anyhow::Result<()> {
        if ctx.trial_number == 1 {
            return Err(TrialPruned("demo prune: trial_number == 1".to_string()).into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceWorker;

impl WorkerAdapter for TraceWorker {
    fn on_worker_start(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        info!(context = %serde_json::to_string(ctx)?, "on_worker_start");
        Ok(())
    }

    fn on_worker_end(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        info!(context = %serde_json::to_string(ctx)?, "on_worker_end");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceMaster;

impl MasterAdapter for TraceMaster {
    fn init(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        info!(context = %serde_json::to_string(ctx)?, "master init");
        Ok(())
    }

    fn execute(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        info!(context = %serde_json::to_string(ctx)?, "master execute");
        Ok(())
    }

    fn finish(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        info!(context = %serde_json::to_string(ctx)?, "master finish");
        Ok(())
    }
}

/// Register the trace adapters under [`TRACE`] for every role.
pub fn register(registry: &mut AdapterRegistry) {
    registry
        .register_objective(TRACE, |config| Ok(Box::new(TraceObjective::new(config))))
        .register_prune(TRACE, |_| Ok(Box::new(TracePrune)))
        .register_worker(TRACE, |_| Ok(Box::new(TraceWorker)))
        .register_master(TRACE, |_| Ok(Box::new(TraceMaster)));
}
