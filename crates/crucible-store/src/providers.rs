use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::instrument;

use crucible_core::ids::ProviderId;
use crucible_core::provider::{ProviderKind, ProviderRecord};

use crate::database::Database;
use crate::error::StoreError;

pub struct ProviderRepo {
    db: Database,
}

impl ProviderRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn from_row(row: &Row<'_>) -> Result<ProviderRecord, rusqlite::Error> {
        let kind: String = row.get("kind")?;
        let kind: ProviderKind = kind.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("{e}").into(),
            )
        })?;
        Ok(ProviderRecord {
            id: ProviderId::from_raw(row.get::<_, String>("id")?),
            name: row.get("name")?,
            kind,
            base_url: row.get("base_url")?,
            api_key: row.get("api_key")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
        })
    }

    #[instrument(skip(self, provider), fields(name = %provider.name, kind = %provider.kind))]
    pub fn insert(&self, provider: &ProviderRecord) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO providers (id, name, kind, base_url, api_key, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    provider.id.as_str(),
                    provider.name,
                    provider.kind.to_string(),
                    provider.base_url,
                    provider.api_key,
                    i64::from(provider.enabled),
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!(
                        "provider name already exists: {}",
                        provider.name
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn find(&self, id: &ProviderId) -> Result<Option<ProviderRecord>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM providers WHERE id = ?1",
                params![id.as_str()],
                Self::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<ProviderRecord>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM providers WHERE name = ?1",
                params![name],
                Self::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn list(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM providers ORDER BY name")?;
            let rows = stmt.query_map([], Self::from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    pub fn delete(&self, id: &ProviderId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM providers WHERE id = ?1", params![id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("provider {id}")));
            }
            Ok(())
        })
    }
}
