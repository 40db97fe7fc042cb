use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crucible_core::ids::PlanId;
use crucible_core::plan::Plan;

use crate::database::Database;
use crate::error::StoreError;

/// Plans are stored as whole documents: roles, goals, and scripts are
/// embedded subdocuments with no independent identity.
pub struct PlanRepo {
    db: Database,
}

impl PlanRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, plan), fields(id = %plan.id, name = %plan.name))]
    pub fn insert(&self, plan: &Plan) -> Result<(), StoreError> {
        let document = serde_json::to_string(plan)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO plans (id, name, document, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![plan.id.as_str(), plan.name, document, now],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!(
                        "plan name already exists: {}",
                        plan.name
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn find(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        let document: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT document FROM plans WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        document
            .map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Plan>, StoreError> {
        let document: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT document FROM plans WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        document
            .map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }

    pub fn list(&self) -> Result<Vec<Plan>, StoreError> {
        let documents: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT document FROM plans ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })?;
        documents
            .iter()
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .collect()
    }

    pub fn update(&self, plan: &Plan) -> Result<(), StoreError> {
        let document = serde_json::to_string(plan)?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE plans SET name = ?2, document = ?3, updated_at = ?4 WHERE id = ?1",
                params![plan.id.as_str(), plan.name, document, Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("plan {}", plan.id)));
            }
            Ok(())
        })
    }

    pub fn delete(&self, id: &PlanId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM plans WHERE id = ?1", params![id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("plan {id}")));
            }
            Ok(())
        })
    }
}
