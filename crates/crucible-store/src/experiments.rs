use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::instrument;

use crucible_core::experiment::{Experiment, ExperimentStatus};
use crucible_core::ids::{ExperimentId, PlanId};

use crate::database::Database;
use crate::error::StoreError;

pub struct ExperimentRepo {
    db: Database,
}

impl ExperimentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn from_row(row: &Row<'_>) -> Result<Experiment, rusqlite::Error> {
        let environment: String = row.get("environment")?;
        let status: String = row.get("status")?;
        let start_time: Option<String> = row.get("start_time")?;
        let end_time: Option<String> = row.get("end_time")?;

        Ok(Experiment {
            id: ExperimentId::from_raw(row.get::<_, String>("id")?),
            plan_id: PlanId::from_raw(row.get::<_, String>("plan_id")?),
            status: status.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            current_step: row.get("current_step")?,
            current_environment: serde_json::from_str(&environment).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            start_time: parse_time(start_time),
            end_time: parse_time(end_time),
            result: row.get("result")?,
        })
    }

    #[instrument(skip(self, experiment), fields(id = %experiment.id))]
    pub fn insert(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let environment = serde_json::to_string(&experiment.current_environment)?;
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO experiments
                 (id, plan_id, status, current_step, environment, start_time, end_time, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    experiment.id.as_str(),
                    experiment.plan_id.as_str(),
                    experiment.status.to_string(),
                    experiment.current_step,
                    environment,
                    experiment.start_time.map(|t| t.to_rfc3339()),
                    experiment.end_time.map(|t| t.to_rfc3339()),
                    experiment.result,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// `Ok(None)` when the record does not exist (e.g. deleted mid-run).
    pub fn find(&self, id: &ExperimentId) -> Result<Option<Experiment>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM experiments WHERE id = ?1",
                params![id.as_str()],
                Self::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn list(&self) -> Result<Vec<Experiment>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM experiments ORDER BY created_at")?;
            let rows = stmt.query_map([], Self::from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    pub fn list_by_status(
        &self,
        status: ExperimentStatus,
    ) -> Result<Vec<Experiment>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM experiments WHERE status = ?1 ORDER BY created_at")?;
            let rows = stmt.query_map(params![status.to_string()], Self::from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    /// Persist the full mutable state of a run.
    #[instrument(skip(self, experiment), fields(id = %experiment.id, status = %experiment.status))]
    pub fn update(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let environment = serde_json::to_string(&experiment.current_environment)?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE experiments
                 SET status = ?2, current_step = ?3, environment = ?4,
                     start_time = ?5, end_time = ?6, result = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    experiment.id.as_str(),
                    experiment.status.to_string(),
                    experiment.current_step,
                    environment,
                    experiment.start_time.map(|t| t.to_rfc3339()),
                    experiment.end_time.map(|t| t.to_rfc3339()),
                    experiment.result,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "experiment {}",
                    experiment.id
                )));
            }
            Ok(())
        })
    }

    /// Persist mid-run progress (step counter and environment) WITHOUT
    /// touching status. External control commands write status
    /// concurrently with a running loop; a full-record update here would
    /// silently undo a PAUSE/STOP issued while a step was in flight.
    pub fn update_progress(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let environment = serde_json::to_string(&experiment.current_environment)?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE experiments
                 SET current_step = ?2, environment = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    experiment.id.as_str(),
                    experiment.current_step,
                    environment,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "experiment {}",
                    experiment.id
                )));
            }
            Ok(())
        })
    }

    /// Write only the status; used by external control commands.
    pub fn update_status(
        &self,
        id: &ExperimentId,
        status: ExperimentStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE experiments SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), status.to_string(), Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("experiment {id}")));
            }
            Ok(())
        })
    }

    /// Delete an ended experiment. Refuses while the status is non-terminal.
    pub fn delete(&self, id: &ExperimentId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM experiments WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(status) = status else {
                return Err(StoreError::NotFound(format!("experiment {id}")));
            };
            let status: ExperimentStatus = status
                .parse()
                .map_err(StoreError::Database)?;
            if !status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "experiment {id} is {status}; only ended experiments can be deleted"
                )));
            }

            let _ = conn.execute("DELETE FROM experiments WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}
