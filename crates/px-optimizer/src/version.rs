//! Study identity: picking a collision-free `base_v{n}` name before any
//! worker starts.

use std::collections::BTreeSet;

use px_types::{config_error, PxResult, TrialStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Upper bound on version increments before giving up.
pub const MAX_VERSION_PROBES: u32 = 10_000;

/// Resolved study name and the version it encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyIdentity {
    pub name: String,
    pub version: Option<u32>,
}

/// `base` or `base_v{version}`.
pub fn format_study_name(base: &str, version: Option<u32>) -> String {
    match version {
        Some(v) => format!("{base}_v{v}"),
        None => base.to_string(),
    }
}

/// Pick the study identity for a run.
///
/// Continuing runs, unversioned runs and runs without a store keep the
/// requested identity. Otherwise the version is bumped past every name
/// already in the store.
pub fn resolve_study_name(
    store: Option<&dyn TrialStore>,
    base: &str,
    version: Option<u32>,
    continue_study: bool,
) -> PxResult<StudyIdentity> {
    let requested = StudyIdentity {
        name: format_study_name(base, version),
        version,
    };
    let (Some(store), Some(version)) = (store, version) else {
        return Ok(requested);
    };
    if continue_study {
        return Ok(requested);
    }
    let existing = match store.study_names() {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, study = %requested.name, "could not list studies; keeping requested version");
            return Ok(requested);
        }
    };
    let resolved = next_free_version(&existing, base, version)?;
    if resolved != version {
        info!(
            requested = version,
            resolved,
            "study version already in use; bumped"
        );
    }
    Ok(StudyIdentity {
        name: format_study_name(base, Some(resolved)),
        version: Some(resolved),
    })
}

/// Smallest version `>= version` whose name is not in `existing`.
pub fn next_free_version(existing: &BTreeSet<String>, base: &str, version: u32) -> PxResult<u32> {
    let prefix = format!("{base}_v");
    let related = existing
        .iter()
        .any(|name| name == base || name.starts_with(&prefix));
    if !related {
        return Ok(version);
    }
    let mut candidate = version;
    for _ in 0..MAX_VERSION_PROBES {
        if !existing.contains(&format_study_name(base, Some(candidate))) {
            return Ok(candidate);
        }
        candidate = candidate
            .checked_add(1)
            .ok_or_else(|| config_error!("study version overflow for '{}'", base))?;
    }
    Err(config_error!(
        "no free version for study '{}' after {} attempts starting at v{}",
        base,
        MAX_VERSION_PROBES,
        version
    ))
}
