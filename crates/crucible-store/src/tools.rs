use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::instrument;

use crucible_core::ids::ToolId;
use crucible_core::tool::{is_valid_tool_name, ToolRecord};

use crate::database::Database;
use crate::error::StoreError;

pub struct ToolRepo {
    db: Database,
}

impl ToolRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn from_row(row: &Row<'_>) -> Result<ToolRecord, rusqlite::Error> {
        let parameters: String = row.get("parameters")?;
        let ends_turn: Option<i64> = row.get("ends_turn")?;
        Ok(ToolRecord {
            id: ToolId::from_raw(row.get::<_, String>("id")?),
            namespace: row.get("namespace")?,
            name: row.get("name")?,
            description: row.get("description")?,
            parameters: serde_json::from_str(&parameters).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            code: row.get("code")?,
            ends_turn: ends_turn.map(|v| v != 0),
        })
    }

    #[instrument(skip(self, tool), fields(namespace = %tool.namespace, name = %tool.name))]
    pub fn insert(&self, tool: &ToolRecord) -> Result<(), StoreError> {
        if !is_valid_tool_name(&tool.name) {
            return Err(StoreError::Conflict(format!(
                "\"{}\" isn't a valid tool name: use only alphanumeric characters and underscores",
                tool.name
            )));
        }
        let parameters = serde_json::to_string(&tool.parameters)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO tools
                 (id, namespace, name, description, parameters, code, ends_turn, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    tool.id.as_str(),
                    tool.namespace,
                    tool.name,
                    tool.description,
                    parameters,
                    tool.code,
                    tool.ends_turn.map(i64::from),
                    now,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!(
                        "tool already exists: {}/{}",
                        tool.namespace, tool.name
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn find(&self, id: &ToolId) -> Result<Option<ToolRecord>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tools WHERE id = ?1",
                params![id.as_str()],
                Self::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Resolve a tool by bare name (first match across namespaces), as the
    /// tool-call loop does when the model names a tool.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ToolRecord>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tools WHERE name = ?1 ORDER BY namespace LIMIT 1",
                params![name],
                Self::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Resolve a list of ids, preserving the requested order and skipping
    /// dangling references.
    pub fn find_many(&self, ids: &[ToolId]) -> Result<Vec<ToolRecord>, StoreError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.find(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn list(&self) -> Result<Vec<ToolRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tools ORDER BY namespace, name")?;
            let rows = stmt.query_map([], Self::from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
    }

    pub fn delete(&self, id: &ToolId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM tools WHERE id = ?1", params![id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("tool {id}")));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_tool(namespace: &str, name: &str) -> ToolRecord {
        ToolRecord {
            id: ToolId::new(),
            namespace: namespace.into(),
            name: name.into(),
            description: "test tool".into(),
            parameters: json!({"type": "object", "properties": {}}),
            code: "print('{}')".into(),
            ends_turn: None,
        }
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let db = Database::in_memory().unwrap();
        let repo = ToolRepo::new(db);
        let tool = make_tool("default", "update_env");
        repo.insert(&tool).unwrap();

        assert_eq!(repo.find(&tool.id).unwrap().unwrap(), tool);
        assert_eq!(repo.find_by_name("update_env").unwrap().unwrap(), tool);
    }

    #[test]
    fn namespace_name_pair_is_unique() {
        let db = Database::in_memory().unwrap();
        let repo = ToolRepo::new(db);
        repo.insert(&make_tool("default", "search")).unwrap();

        let err = repo.insert(&make_tool("default", "search")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same name, different namespace is fine
        repo.insert(&make_tool("market", "search")).unwrap();
    }

    #[test]
    fn invalid_name_rejected() {
        let db = Database::in_memory().unwrap();
        let repo = ToolRepo::new(db);
        let err = repo.insert(&make_tool("default", "bad-name")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn ends_turn_tri_state_roundtrip() {
        let db = Database::in_memory().unwrap();
        let repo = ToolRepo::new(db);

        let mut chained = make_tool("default", "chain_tool");
        chained.ends_turn = Some(false);
        repo.insert(&chained).unwrap();

        let mut terminal = make_tool("default", "terminal_tool");
        terminal.ends_turn = Some(true);
        repo.insert(&terminal).unwrap();

        let legacy = make_tool("default", "legacy_tool");
        repo.insert(&legacy).unwrap();

        assert_eq!(repo.find(&chained.id).unwrap().unwrap().ends_turn, Some(false));
        assert_eq!(repo.find(&terminal.id).unwrap().unwrap().ends_turn, Some(true));
        assert_eq!(repo.find(&legacy.id).unwrap().unwrap().ends_turn, None);
    }

    #[test]
    fn find_many_preserves_order_and_skips_dangling() {
        let db = Database::in_memory().unwrap();
        let repo = ToolRepo::new(db);
        let a = make_tool("default", "a_tool");
        let b = make_tool("default", "b_tool");
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();

        let found = repo
            .find_many(&[b.id.clone(), ToolId::new(), a.id.clone()])
            .unwrap();
        let names: Vec<&str> = found.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b_tool", "a_tool"]);
    }
}
