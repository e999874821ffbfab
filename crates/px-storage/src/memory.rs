use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use parking_lot::Mutex;
use px_types::{
    FrozenTrial, StoreError, StoreResult, StudyDirection, StudySummary, TrialReport, TrialStore,
};

#[derive(Debug)]
struct StudyRecord {
    summary: StudySummary,
    trials: Vec<FrozenTrial>,
}

/// Process-local trial store.
///
/// Every operation runs under one lock, so claims and reports are atomic
/// across threads. Nothing survives the process, which makes this store
/// suitable for tests and in-process worker pools only.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    studies: Mutex<HashMap<String, StudyRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::StudyNotFound {
        name: name.to_string(),
    }
}

impl TrialStore for InMemoryStore {
    fn create_or_load_study(
        &self,
        name: &str,
        direction: StudyDirection,
        sampler: &str,
    ) -> StoreResult<StudySummary> {
        let mut studies = self.studies.lock();
        let record = studies.entry(name.to_string()).or_insert_with(|| StudyRecord {
            summary: StudySummary {
                name: name.to_string(),
                direction,
                sampler: sampler.to_string(),
                n_trials: 0,
                created_at: Utc::now(),
            },
            trials: Vec::new(),
        });
        if record.summary.direction != direction {
            return Err(StoreError::DirectionMismatch {
                name: name.to_string(),
                existing: record.summary.direction.to_string(),
                requested: direction.to_string(),
            });
        }
        let mut summary = record.summary.clone();
        summary.n_trials = record.trials.len();
        Ok(summary)
    }

    fn load_study(&self, name: &str) -> StoreResult<StudySummary> {
        let studies = self.studies.lock();
        let record = studies.get(name).ok_or_else(|| not_found(name))?;
        let mut summary = record.summary.clone();
        summary.n_trials = record.trials.len();
        Ok(summary)
    }

    fn study_names(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.studies.lock().keys().cloned().collect())
    }

    fn trial_count(&self, study: &str) -> StoreResult<usize> {
        let studies = self.studies.lock();
        studies
            .get(study)
            .map(|record| record.trials.len())
            .ok_or_else(|| not_found(study))
    }

    fn claim_trial(&self, study: &str, claimant: &str) -> StoreResult<FrozenTrial> {
        let mut studies = self.studies.lock();
        let record = studies.get_mut(study).ok_or_else(|| not_found(study))?;
        let trial = FrozenTrial::claimed(record.trials.len() as u64, claimant);
        record.trials.push(trial.clone());
        Ok(trial)
    }

    fn report_trial(&self, study: &str, report: &TrialReport) -> StoreResult<()> {
        let mut studies = self.studies.lock();
        let record = studies.get_mut(study).ok_or_else(|| not_found(study))?;
        let trial = record
            .trials
            .get_mut(report.number as usize)
            .ok_or_else(|| StoreError::TrialNotFound {
                study: study.to_string(),
                number: report.number,
            })?;
        trial.apply_report(study, report)
    }

    fn trials(&self, study: &str) -> StoreResult<Vec<FrozenTrial>> {
        let studies = self.studies.lock();
        studies
            .get(study)
            .map(|record| record.trials.clone())
            .ok_or_else(|| not_found(study))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_types::{Params, TrialState, UserAttrs};
    use std::sync::Arc;

    fn complete(number: u64, claimant: &str, value: f64) -> TrialReport {
        TrialReport {
            number,
            claimant: claimant.into(),
            state: TrialState::Complete,
            value: Some(value),
            params: Params::new(),
            user_attrs: UserAttrs::new(),
        }
    }

    #[test]
    fn claims_are_numbered_monotonically() {
        let store = InMemoryStore::new();
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();
        let a = store.claim_trial("demo", "w0").unwrap();
        let b = store.claim_trial("demo", "w1").unwrap();
        assert_eq!((a.number, b.number), (0, 1));
        assert_eq!(store.trial_count("demo").unwrap(), 2);
    }

    #[test]
    fn create_or_load_is_idempotent() {
        let store = InMemoryStore::new();
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();
        store.claim_trial("demo", "w0").unwrap();
        let again = store
            .create_or_load_study("demo", StudyDirection::Maximize, "grid")
            .unwrap();
        assert_eq!(again.n_trials, 1);
        assert_eq!(again.sampler, "random");

        let err = store
            .create_or_load_study("demo", StudyDirection::Minimize, "random")
            .unwrap_err();
        assert!(matches!(err, StoreError::DirectionMismatch { .. }));
    }

    #[test]
    fn report_finishes_trial_once() {
        let store = InMemoryStore::new();
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();
        let trial = store.claim_trial("demo", "w0").unwrap();
        store
            .report_trial("demo", &complete(trial.number, "w0", 2.0))
            .unwrap();
        assert!(store
            .report_trial("demo", &complete(trial.number, "w0", 3.0))
            .is_err());

        let trials = store.trials("demo").unwrap();
        assert_eq!(trials[0].state, TrialState::Complete);
        assert_eq!(trials[0].value, Some(2.0));
    }

    #[test]
    fn unknown_study_and_trial() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.trial_count("missing"),
            Err(StoreError::StudyNotFound { .. })
        ));
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();
        assert!(matches!(
            store.report_trial("demo", &complete(9, "w0", 1.0)),
            Err(StoreError::TrialNotFound { number: 9, .. })
        ));
    }

    #[test]
    fn concurrent_claims_never_share_a_number() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_or_load_study("demo", StudyDirection::Maximize, "random")
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| store.claim_trial("demo", &format!("w{w}")).unwrap().number)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut numbers: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..100).collect::<Vec<u64>>());
    }
}
