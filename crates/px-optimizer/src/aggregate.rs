//! Selecting the best completed trial once every worker has exited.

use px_types::{FrozenTrial, Params, PxError, PxResult, StudyDirection, TrialState, UserAttrs};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::search::{normalize, rebuild_tree, SearchSpace};
use crate::version::StudyIdentity;

/// Final result document of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub study_name: String,
    pub study_version: Option<u32>,
    pub best_value: f64,
    /// Parameters recorded on the best trial.
    pub best_params: Params,
    /// Every declared parameter, with fixed values filled in.
    pub best_params_full: Params,
    /// `best_params_full` in the nesting of the search-space tree.
    pub best_params_grouped: Map<String, Value>,
    pub best_user_attrs: UserAttrs,
}

/// The best completed trial under `direction`. Ties keep the earliest.
pub fn best_trial(trials: &[FrozenTrial], direction: StudyDirection) -> Option<(&FrozenTrial, f64)> {
    let mut best: Option<(&FrozenTrial, f64)> = None;
    for trial in trials.iter().filter(|t| t.state == TrialState::Complete) {
        let Some(value) = trial.value else {
            continue;
        };
        let improves = match best {
            None => true,
            Some((_, incumbent)) => direction.improves(value, incumbent),
        };
        if improves {
            best = Some((trial, value));
        }
    }
    best
}

/// Build the result document from the study's reloaded trials.
pub fn aggregate(
    identity: &StudyIdentity,
    space: &SearchSpace,
    trials: &[FrozenTrial],
    direction: StudyDirection,
    failed_workers: usize,
) -> PxResult<BestResult> {
    let completed = trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .count();
    let Some((best, best_value)) = best_trial(trials, direction) else {
        return Err(PxError::Aggregation(format!(
            "no completed trials in study '{}' ({} trials recorded, {} failed worker(s))",
            identity.name,
            trials.len(),
            failed_workers
        )));
    };

    let best_params: Params = best
        .params
        .iter()
        .map(|(k, v)| (k.clone(), normalize(v.clone())))
        .collect();
    let best_params_full = space.resolve_all(&best_params)?;
    let best_params_grouped = rebuild_tree(space.tree(), &best_params_full);

    info!(
        study = %identity.name,
        trial = best.number,
        best_value,
        completed,
        total = trials.len(),
        "best trial selected"
    );
    Ok(BestResult {
        study_name: identity.name.clone(),
        study_version: identity.version,
        best_value,
        best_params,
        best_params_full,
        best_params_grouped,
        best_user_attrs: best.user_attrs.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_types::{ParamValue, SearchSpaceError};
    use serde_json::json;

    fn space() -> SearchSpace {
        SearchSpace::compile(
            json!({
                "model": {"lr": {"range": [0.001, 0.1], "log": true}, "layers": 4},
                "batch": [16, 32, 64]
            })
            .as_object()
            .unwrap(),
        )
        .unwrap()
    }

    fn trial(number: u64, state: TrialState, value: Option<f64>) -> FrozenTrial {
        let mut t = FrozenTrial::claimed(number, "w");
        t.state = state;
        t.value = value;
        t.params.insert("lr".into(), ParamValue::Float((number + 1) as f64 / 100.0));
        t.params.insert("batch".into(), ParamValue::Int(32));
        t.user_attrs.insert("score".into(), json!(value));
        t
    }

    fn identity() -> StudyIdentity {
        StudyIdentity {
            name: "demo_v1".into(),
            version: Some(1),
        }
    }

    #[test]
    fn picks_highest_score_and_fills_defaults() {
        let trials: Vec<_> = (0..5)
            .map(|n| trial(n, TrialState::Complete, Some((n + 1) as f64)))
            .collect();
        let best = aggregate(&identity(), &space(), &trials, StudyDirection::Maximize, 0).unwrap();

        assert_eq!(best.best_value, 5.0);
        assert_eq!(best.study_version, Some(1));
        assert!(!best.best_params.contains_key("layers"));
        assert_eq!(best.best_params_full["layers"], ParamValue::Int(4));
        assert_eq!(best.best_params_full["lr"], ParamValue::Float(0.05));
        assert_eq!(best.best_user_attrs["score"], json!(5.0));
        assert_eq!(
            Value::Object(best.best_params_grouped),
            json!({"model": {"lr": 0.05, "layers": 4}, "batch": 32})
        );
    }

    #[test]
    fn ignores_unfinished_and_failed_trials() {
        let trials = vec![
            trial(0, TrialState::Failed, None),
            trial(1, TrialState::Complete, Some(0.2)),
            trial(2, TrialState::Running, None),
            trial(3, TrialState::Pruned, None),
            trial(4, TrialState::Complete, Some(0.7)),
            trial(5, TrialState::Complete, Some(0.7)),
        ];
        let (best, value) = best_trial(&trials, StudyDirection::Maximize).unwrap();
        assert_eq!((best.number, value), (4, 0.7));
        let (best, _) = best_trial(&trials, StudyDirection::Minimize).unwrap();
        assert_eq!(best.number, 1);
    }

    #[test]
    fn no_completed_trials_is_an_error() {
        let trials = vec![trial(0, TrialState::Failed, None), trial(1, TrialState::Pruned, None)];
        let err = aggregate(&identity(), &space(), &trials, StudyDirection::Maximize, 3).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, PxError::Aggregation(_)));
        assert!(message.contains("2 trials recorded"));
        assert!(message.contains("3 failed worker(s)"));
    }

    #[test]
    fn missing_sampled_param_cannot_be_resolved() {
        let mut t = trial(0, TrialState::Complete, Some(1.0));
        t.params.shift_remove("lr");
        let err = aggregate(&identity(), &space(), &[t], StudyDirection::Maximize, 0).unwrap_err();
        assert!(matches!(
            err,
            PxError::SearchSpace(SearchSpaceError::MissingParameter { .. })
        ));
    }
}
