//! The contract between the optimizer core and a shared trial store.

use std::collections::BTreeSet;

use crate::errors::StoreResult;
use crate::trial::{FrozenTrial, StudyDirection, StudySummary, TrialReport};

/// Shared, durable owner of studies and trials.
///
/// Implementations must make [`TrialStore::claim_trial`] and
/// [`TrialStore::report_trial`] atomic: two claimants never receive the same
/// trial number, and a trial accepts exactly one terminal report, from its
/// claimant. Everything else about durability and locking is up to the
/// backend.
pub trait TrialStore: Send + Sync {
    /// Create the study, or load it if one with the same name exists.
    fn create_or_load_study(
        &self,
        name: &str,
        direction: StudyDirection,
        sampler: &str,
    ) -> StoreResult<StudySummary>;

    /// Metadata for an existing study.
    fn load_study(&self, name: &str) -> StoreResult<StudySummary>;

    /// Names of every study in the store.
    fn study_names(&self) -> StoreResult<BTreeSet<String>>;

    /// Number of trials in the study, in any state.
    fn trial_count(&self, study: &str) -> StoreResult<usize>;

    /// Claim a new trial; the store assigns the next trial number.
    fn claim_trial(&self, study: &str, claimant: &str) -> StoreResult<FrozenTrial>;

    /// Record the single terminal outcome of a claimed trial.
    fn report_trial(&self, study: &str, report: &TrialReport) -> StoreResult<()>;

    /// All trials of the study, ordered by number.
    fn trials(&self, study: &str) -> StoreResult<Vec<FrozenTrial>>;
}
