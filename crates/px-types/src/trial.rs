//! Persisted trial and study records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{StoreError, StoreResult};
use crate::value::{Params, UserAttrs};

/// Whether a study maximizes or minimizes its objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StudyDirection {
    #[default]
    Maximize,
    Minimize,
}

impl StudyDirection {
    /// True when `candidate` beats `incumbent` under this direction.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }
}

impl fmt::Display for StudyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudyDirection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maximize" => Ok(Self::Maximize),
            "minimize" => Ok(Self::Minimize),
            other => Err(StoreError::Backend {
                message: format!("unknown study direction '{other}'"),
            }),
        }
    }
}

/// Lifecycle state of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Failed,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Pruned => "PRUNED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "PRUNED" => Ok(Self::Pruned),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::Backend {
                message: format!("unknown trial state '{other}'"),
            }),
        }
    }
}

/// Snapshot of a trial as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    /// Monotonic per study, assigned by the store at claim time.
    pub number: u64,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: Params,
    pub user_attrs: UserAttrs,
    /// Identity of the worker that claimed the trial.
    pub claimant: Option<String>,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_complete: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    /// A freshly claimed trial.
    pub fn claimed(number: u64, claimant: impl Into<String>) -> Self {
        Self {
            number,
            state: TrialState::Running,
            value: None,
            params: Params::new(),
            user_attrs: UserAttrs::new(),
            claimant: Some(claimant.into()),
            datetime_start: Some(Utc::now()),
            datetime_complete: None,
        }
    }

    /// Apply a terminal report. Enforces the single-report and single-claimant rules.
    pub fn apply_report(&mut self, study: &str, report: &TrialReport) -> StoreResult<()> {
        report.validate()?;
        if self.state.is_finished() {
            return Err(StoreError::TrialAlreadyFinished {
                study: study.to_string(),
                number: self.number,
                state: self.state.to_string(),
            });
        }
        if let Some(owner) = &self.claimant {
            if owner != &report.claimant {
                return Err(StoreError::NotClaimant {
                    number: self.number,
                    owner: owner.clone(),
                    claimant: report.claimant.clone(),
                });
            }
        }
        self.state = report.state;
        self.value = report.value;
        self.params = report.params.clone();
        self.user_attrs = report.user_attrs.clone();
        self.datetime_complete = Some(Utc::now());
        Ok(())
    }
}

/// The one terminal report a claimant sends for its trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub number: u64,
    pub claimant: String,
    pub state: TrialState,
    /// Present only for `Complete`.
    pub value: Option<f64>,
    pub params: Params,
    pub user_attrs: UserAttrs,
}

impl TrialReport {
    pub fn validate(&self) -> StoreResult<()> {
        match (self.state, self.value) {
            (TrialState::Running, _) => Err(StoreError::InvalidReport {
                message: format!("trial {} reported with non-terminal state", self.number),
            }),
            (TrialState::Complete, None) => Err(StoreError::InvalidReport {
                message: format!("trial {} reported complete without a value", self.number),
            }),
            (TrialState::Complete, Some(v)) if !v.is_finite() => Err(StoreError::InvalidReport {
                message: format!("trial {} reported non-finite value {v}", self.number),
            }),
            (TrialState::Pruned | TrialState::Failed, Some(_)) => {
                Err(StoreError::InvalidReport {
                    message: format!("trial {} carries a value but is {}", self.number, self.state),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Study metadata as listed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub name: String,
    pub direction: StudyDirection,
    pub sampler: String,
    pub n_trials: usize,
    pub created_at: DateTime<Utc>,
}
