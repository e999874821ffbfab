//! Studies and live trials: the ask/tell surface on top of a [`TrialStore`].

use std::sync::Arc;

use parking_lot::Mutex;
use px_types::{
    FrozenTrial, ParamValue, Params, PxResult, StudyDirection, StudySummary, TrialReport,
    TrialState, TrialStore, UserAttrs,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::sampler::{Distribution, SampleContext, Sampler};
use crate::search::normalize;

/// Terminal result of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TrialOutcome {
    Complete { value: f64 },
    Pruned { reason: String },
    Failed { error: String },
}

impl TrialOutcome {
    pub fn state(&self) -> TrialState {
        match self {
            Self::Complete { .. } => TrialState::Complete,
            Self::Pruned { .. } => TrialState::Pruned,
            Self::Failed { .. } => TrialState::Failed,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Complete { value } => Some(*value),
            _ => None,
        }
    }
}

/// A named study bound to a store and a sampler.
///
/// Every process that participates in a study builds its own `Study` with
/// the same name and sampler configuration; the store is the only shared
/// state.
pub struct Study {
    name: String,
    store: Arc<dyn TrialStore>,
    sampler: Arc<Mutex<Box<dyn Sampler>>>,
    claimant: String,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.name)
            .field("claimant", &self.claimant)
            .finish()
    }
}

impl Study {
    /// Create the study, or attach to an existing one with the same name.
    pub fn create_or_load(
        store: Arc<dyn TrialStore>,
        name: &str,
        direction: StudyDirection,
        sampler: Box<dyn Sampler>,
    ) -> PxResult<(Self, StudySummary)> {
        let summary = store.create_or_load_study(name, direction, sampler.name())?;
        Ok((Self::with_sampler(store, name, sampler), summary))
    }

    /// Attach to an existing study.
    pub fn load(
        store: Arc<dyn TrialStore>,
        name: &str,
        sampler: Box<dyn Sampler>,
    ) -> PxResult<(Self, StudySummary)> {
        let summary = store.load_study(name)?;
        Ok((Self::with_sampler(store, name, sampler), summary))
    }

    fn with_sampler(store: Arc<dyn TrialStore>, name: &str, sampler: Box<dyn Sampler>) -> Self {
        Self {
            name: name.to_string(),
            store,
            sampler: Arc::new(Mutex::new(sampler)),
            claimant: format!("{}-{}", std::process::id(), Uuid::new_v4()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity this study handle claims trials under.
    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    pub fn store(&self) -> &Arc<dyn TrialStore> {
        &self.store
    }

    /// Trials recorded so far, in any state.
    pub fn trial_count(&self) -> PxResult<usize> {
        Ok(self.store.trial_count(&self.name)?)
    }

    /// Claim the next trial.
    pub fn ask(&self) -> PxResult<Trial> {
        let wants_history = self.sampler.lock().wants_history();
        let history = if wants_history {
            self.store.trials(&self.name)?
        } else {
            Vec::new()
        };
        let frozen = self.store.claim_trial(&self.name, &self.claimant)?;
        debug!(study = %self.name, trial = frozen.number, "claimed trial");
        Ok(Trial {
            number: frozen.number,
            study_name: self.name.clone(),
            params: Params::new(),
            user_attrs: UserAttrs::new(),
            sampler: Arc::clone(&self.sampler),
            history: Arc::new(history),
        })
    }

    /// Report the trial's single terminal outcome. Consumes the trial.
    pub fn tell(&self, trial: Trial, outcome: &TrialOutcome) -> PxResult<()> {
        let mut user_attrs = trial.user_attrs;
        if let TrialOutcome::Failed { error } = outcome {
            user_attrs
                .entry("fail_reason".to_string())
                .or_insert_with(|| Value::String(error.clone()));
        }
        let report = TrialReport {
            number: trial.number,
            claimant: self.claimant.clone(),
            state: outcome.state(),
            value: outcome.value(),
            params: trial.params,
            user_attrs,
        };
        self.store.report_trial(&self.name, &report)?;
        debug!(study = %self.name, trial = report.number, state = %report.state, "reported trial");
        Ok(())
    }

    /// All trials of the study, ordered by number.
    pub fn trials(&self) -> PxResult<Vec<FrozenTrial>> {
        Ok(self.store.trials(&self.name)?)
    }
}

/// A claimed, not yet reported trial.
pub struct Trial {
    number: u64,
    study_name: String,
    params: Params,
    user_attrs: UserAttrs,
    sampler: Arc<Mutex<Box<dyn Sampler>>>,
    history: Arc<Vec<FrozenTrial>>,
}

impl std::fmt::Debug for Trial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trial")
            .field("number", &self.number)
            .field("study_name", &self.study_name)
            .field("params", &self.params)
            .field("user_attrs", &self.user_attrs)
            .finish()
    }
}

impl Trial {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    /// Draw a value for `name` and record it on the trial.
    ///
    /// Suggesting the same name twice returns the recorded value.
    pub fn suggest(&mut self, name: &str, distribution: Distribution) -> PxResult<ParamValue> {
        if let Some(existing) = self.params.get(name) {
            return Ok(existing.clone());
        }
        let ctx = SampleContext {
            trial_number: self.number,
            dimension: self.params.len(),
            history: &self.history,
        };
        let value = normalize(self.sampler.lock().sample(&ctx, name, &distribution)?);
        self.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn suggest_categorical(&mut self, name: &str, choices: Vec<Value>) -> PxResult<ParamValue> {
        self.suggest(name, Distribution::Categorical { choices })
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> PxResult<i64> {
        let value = self.suggest(
            name,
            Distribution::Int {
                low,
                high,
                step: 1,
                log: false,
            },
        )?;
        Ok(value.as_i64().unwrap_or(low))
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> PxResult<f64> {
        let value = self.suggest(
            name,
            Distribution::Float {
                low,
                high,
                step: None,
                log,
            },
        )?;
        Ok(value.as_f64().unwrap_or(low))
    }

    pub fn set_user_attr(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.user_attrs.insert(key.into(), value.into());
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn user_attrs(&self) -> &UserAttrs {
        &self.user_attrs
    }
}
