use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use px_types::{
    backend_error, FrozenTrial, Params, StoreError, StoreResult, StudyDirection, StudySummary,
    TrialReport, TrialStore, UserAttrs,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS studies (
    study_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    direction TEXT NOT NULL,
    sampler TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trials (
    study_id INTEGER NOT NULL REFERENCES studies(study_id),
    number INTEGER NOT NULL,
    state TEXT NOT NULL,
    value REAL,
    params TEXT NOT NULL,
    user_attrs TEXT NOT NULL,
    claimant TEXT,
    datetime_start TEXT,
    datetime_complete TEXT,
    PRIMARY KEY (study_id, number)
);
"#;

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

type TrialRow = (
    i64,
    String,
    Option<f64>,
    String,
    String,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn decode_trial(row: TrialRow) -> StoreResult<FrozenTrial> {
    let (number, state, value, params, user_attrs, claimant, start, complete) = row;
    let params: Params = serde_json::from_str(&params)
        .map_err(|e| backend_error!("corrupt params for trial {number}: {e}"))?;
    let user_attrs: UserAttrs = serde_json::from_str(&user_attrs)
        .map_err(|e| backend_error!("corrupt user attrs for trial {number}: {e}"))?;
    Ok(FrozenTrial {
        number: number as u64,
        state: state.parse()?,
        value,
        params,
        user_attrs,
        claimant,
        datetime_start: start,
        datetime_complete: complete,
    })
}

const TRIAL_COLUMNS: &str =
    "number, state, value, params, user_attrs, claimant, datetime_start, datetime_complete";

fn read_trial_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrialRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

/// File-backed trial store shared by worker processes.
///
/// Every mutating operation runs inside an `IMMEDIATE` transaction, which
/// takes SQLite's write lock up front; concurrent claimants queue on the
/// busy timeout instead of racing for the next trial number.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| backend_error!("cannot create {}: {e}", parent.display()))?;
        }

        let conn = Connection::open(&path).map_err(backend)?;
        conn.busy_timeout(busy_timeout).map_err(backend)?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))
            .map_err(backend)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        debug!(path = %path.display(), journal_mode = %mode, "opened sqlite trial store");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn study_id(conn: &Connection, name: &str) -> StoreResult<i64> {
        conn.query_row(
            "SELECT study_id FROM studies WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::StudyNotFound {
            name: name.to_string(),
        })
    }

    fn summary(conn: &Connection, name: &str) -> StoreResult<Option<StudySummary>> {
        let row: Option<(i64, String, String, DateTime<Utc>)> = conn
            .query_row(
                "SELECT study_id, direction, sampler, created_at FROM studies WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(backend)?;

        let Some((study_id, direction, sampler, created_at)) = row else {
            return Ok(None);
        };
        let n_trials: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
                params![study_id],
                |row| row.get(0),
            )
            .map_err(backend)?;

        Ok(Some(StudySummary {
            name: name.to_string(),
            direction: direction.parse()?,
            sampler,
            n_trials: n_trials as usize,
            created_at,
        }))
    }
}

impl TrialStore for SqliteStore {
    fn create_or_load_study(
        &self,
        name: &str,
        direction: StudyDirection,
        sampler: &str,
    ) -> StoreResult<StudySummary> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        if let Some(existing) = Self::summary(&tx, name)? {
            if existing.direction != direction {
                return Err(StoreError::DirectionMismatch {
                    name: name.to_string(),
                    existing: existing.direction.to_string(),
                    requested: direction.to_string(),
                });
            }
            return Ok(existing);
        }

        tx.execute(
            "INSERT INTO studies (name, direction, sampler, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, direction.as_str(), sampler, Utc::now()],
        )
        .map_err(backend)?;
        let created = Self::summary(&tx, name)?.ok_or_else(|| StoreError::StudyNotFound {
            name: name.to_string(),
        })?;
        tx.commit().map_err(backend)?;
        Ok(created)
    }

    fn load_study(&self, name: &str) -> StoreResult<StudySummary> {
        let conn = self.conn.lock();
        Self::summary(&conn, name)?.ok_or_else(|| StoreError::StudyNotFound {
            name: name.to_string(),
        })
    }

    fn study_names(&self) -> StoreResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM studies")
            .map_err(backend)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend)?
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(backend)?;
        Ok(names)
    }

    fn trial_count(&self, study: &str) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let study_id = Self::study_id(&conn, study)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
                params![study_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count as usize)
    }

    fn claim_trial(&self, study: &str, claimant: &str) -> StoreResult<FrozenTrial> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;
        let study_id = Self::study_id(&tx, study)?;
        let number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
                params![study_id],
                |row| row.get(0),
            )
            .map_err(backend)?;

        let trial = FrozenTrial::claimed(number as u64, claimant);
        tx.execute(
            "INSERT INTO trials (study_id, number, state, value, params, user_attrs, claimant, datetime_start)
             VALUES (?1, ?2, ?3, NULL, '{}', '{}', ?4, ?5)",
            params![
                study_id,
                number,
                trial.state.as_str(),
                claimant,
                trial.datetime_start
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(trial)
    }

    fn report_trial(&self, study: &str, report: &TrialReport) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;
        let study_id = Self::study_id(&tx, study)?;

        let row = tx
            .query_row(
                &format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE study_id = ?1 AND number = ?2"),
                params![study_id, report.number as i64],
                read_trial_row,
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::TrialNotFound {
                study: study.to_string(),
                number: report.number,
            })?;
        let mut trial = decode_trial(row)?;
        trial.apply_report(study, report)?;

        let params_json = serde_json::to_string(&trial.params)
            .map_err(|e| backend_error!("cannot encode params: {e}"))?;
        let attrs_json = serde_json::to_string(&trial.user_attrs)
            .map_err(|e| backend_error!("cannot encode user attrs: {e}"))?;
        tx.execute(
            "UPDATE trials SET state = ?1, value = ?2, params = ?3, user_attrs = ?4, datetime_complete = ?5
             WHERE study_id = ?6 AND number = ?7",
            params![
                trial.state.as_str(),
                trial.value,
                params_json,
                attrs_json,
                trial.datetime_complete,
                study_id,
                report.number as i64
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(())
    }

    fn trials(&self, study: &str) -> StoreResult<Vec<FrozenTrial>> {
        let conn = self.conn.lock();
        let study_id = Self::study_id(&conn, study)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRIAL_COLUMNS} FROM trials WHERE study_id = ?1 ORDER BY number"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![study_id], read_trial_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(decode_trial).collect()
    }
}
