//! Writing the result document.

use std::fs;
use std::path::Path;

use px_types::PxResult;
use tracing::info;

use crate::aggregate::BestResult;

/// Write `result` as pretty JSON, creating parent directories.
pub fn write_best_json(path: &Path, result: &BestResult) -> PxResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(result)?;
    body.push('\n');
    fs::write(path, body)?;
    info!(path = %path.display(), best_value = result.best_value, "wrote best result");
    Ok(())
}

/// Read a result document back.
pub fn read_best_json(path: &Path) -> PxResult<BestResult> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}
