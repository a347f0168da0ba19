//! Source-of-record tables — tenant-scoped dynamic tabular stores.
//!
//! Tables carry ordered column definitions; rows are opaque key/value maps
//! restricted to the defined columns. Access for agents is governed by a per
//! `(agent, table)` grant checked at the tool boundary; no grant row means no
//! access. Table names are unique case-insensitively within a tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::vault::parse_store_time;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorTable {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub columns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorRow {
    pub id: Uuid,
    pub table_id: Uuid,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Read/write grant for one `(agent, table)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SorPermission {
    pub can_read: bool,
    pub can_write: bool,
}

/// Source-of-record operations.
pub struct SourceOfRecord {
    store: Arc<Store>,
}

impl SourceOfRecord {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create_table(&self, team_id: &Uuid, name: &str, columns: &[String]) -> Result<SorTable> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("table name must not be empty"));
        }
        if columns.is_empty() {
            return Err(EngineError::invalid("a table needs at least one column"));
        }
        {
            let mut seen = std::collections::HashSet::new();
            for column in columns {
                if column.trim().is_empty() {
                    return Err(EngineError::invalid("column names must not be empty"));
                }
                if !seen.insert(column.to_lowercase()) {
                    return Err(EngineError::invalid(format!("duplicate column '{column}'")));
                }
            }
        }
        if self.find_table(team_id, name)?.is_some() {
            return Err(EngineError::Conflict {
                message: format!("table '{name}' already exists"),
            });
        }

        let id = Uuid::new_v4();
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sor_tables (id, team_id, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.to_string(), team_id.to_string(), name],
            )?;
            for (position, column) in columns.iter().enumerate() {
                tx.execute(
                    "INSERT INTO sor_columns (table_id, position, name) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id.to_string(), position as i64, column.trim()],
                )?;
            }
            Ok(())
        })?;
        self.get_table(team_id, &id)
    }

    pub fn get_table(&self, team_id: &Uuid, id: &Uuid) -> Result<SorTable> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT name, created_at FROM sor_tables WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let created: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, parse_store_time(&created)))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let (name, created_at) = found.ok_or_else(|| EngineError::not_found("table"))?;

        let columns = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM sor_columns WHERE table_id = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map([id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;

        Ok(SorTable {
            id: *id,
            team_id: *team_id,
            name,
            columns,
            created_at,
        })
    }

    /// Case-insensitive name lookup within a tenant.
    pub fn find_table(&self, team_id: &Uuid, name: &str) -> Result<Option<SorTable>> {
        let id: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM sor_tables WHERE team_id = ?1 AND lower(name) = lower(?2)",
                rusqlite::params![team_id.to_string(), name.trim()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => Ok(Some(self.get_table(team_id, &id)?)),
            None => Ok(None),
        }
    }

    pub fn list_tables(&self, team_id: &Uuid) -> Result<Vec<SorTable>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM sor_tables WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get_table(team_id, &id))
            .collect()
    }

    pub fn delete_table(&self, team_id: &Uuid, id: &Uuid) -> Result<()> {
        let deleted = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sor_tables WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
            )
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("table"));
        }
        Ok(())
    }

    /// Insert a row, keeping only keys that match defined columns.
    pub fn insert_row(
        &self,
        team_id: &Uuid,
        table_id: &Uuid,
        data: Map<String, Value>,
    ) -> Result<SorRow> {
        let table = self.get_table(team_id, table_id)?;
        let data = restrict_to_columns(data, &table.columns);
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&data)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sor_rows (id, table_id, team_id, data) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.to_string(),
                    table_id.to_string(),
                    team_id.to_string(),
                    payload
                ],
            )?;
            Ok(())
        })?;
        Ok(SorRow {
            id,
            table_id: *table_id,
            data,
            created_at: Utc::now(),
        })
    }

    pub fn list_rows(&self, team_id: &Uuid, table_id: &Uuid, limit: usize) -> Result<Vec<SorRow>> {
        self.get_table(team_id, table_id)?;
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, data, created_at FROM sor_rows
                 WHERE table_id = ?1 ORDER BY created_at, id LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![table_id.to_string(), limit as i64],
                |row| {
                    let id: String = row.get(0)?;
                    let payload: String = row.get(1)?;
                    let created: String = row.get(2)?;
                    Ok(SorRow {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        table_id: *table_id,
                        data: serde_json::from_str(&payload).unwrap_or_default(),
                        created_at: parse_store_time(&created),
                    })
                },
            )?;
            rows.collect()
        })
    }

    pub fn update_row(
        &self,
        team_id: &Uuid,
        table_id: &Uuid,
        row_id: &Uuid,
        data: Map<String, Value>,
    ) -> Result<SorRow> {
        let table = self.get_table(team_id, table_id)?;
        let data = restrict_to_columns(data, &table.columns);
        let payload = serde_json::to_string(&data)?;
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE sor_rows SET data = ?3 WHERE id = ?1 AND table_id = ?2",
                rusqlite::params![row_id.to_string(), table_id.to_string(), payload],
            )
        })?;
        if updated == 0 {
            return Err(EngineError::not_found("row"));
        }
        Ok(SorRow {
            id: *row_id,
            table_id: *table_id,
            data,
            created_at: Utc::now(),
        })
    }

    pub fn delete_row(&self, team_id: &Uuid, table_id: &Uuid, row_id: &Uuid) -> Result<()> {
        self.get_table(team_id, table_id)?;
        let deleted = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sor_rows WHERE id = ?1 AND table_id = ?2",
                rusqlite::params![row_id.to_string(), table_id.to_string()],
            )
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("row"));
        }
        Ok(())
    }

    /// Grant or update an agent's access to a table.
    pub fn set_permission(
        &self,
        team_id: &Uuid,
        agent_id: &Uuid,
        table_id: &Uuid,
        permission: SorPermission,
    ) -> Result<()> {
        self.get_table(team_id, table_id)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sor_permissions (agent_id, table_id, can_read, can_write)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agent_id, table_id)
                 DO UPDATE SET can_read = excluded.can_read, can_write = excluded.can_write",
                rusqlite::params![
                    agent_id.to_string(),
                    table_id.to_string(),
                    permission.can_read as i64,
                    permission.can_write as i64
                ],
            )?;
            Ok(())
        })
    }

    /// The grant for `(agent, table)`. Absent rows default to no access.
    pub fn permission(&self, agent_id: &Uuid, table_id: &Uuid) -> Result<SorPermission> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT can_read, can_write FROM sor_permissions
                 WHERE agent_id = ?1 AND table_id = ?2",
                rusqlite::params![agent_id.to_string(), table_id.to_string()],
                |row| {
                    Ok(SorPermission {
                        can_read: row.get::<_, i64>(0)? != 0,
                        can_write: row.get::<_, i64>(1)? != 0,
                    })
                },
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(SorPermission::default()),
                other => Err(other),
            })
        })
    }
}

fn restrict_to_columns(data: Map<String, Value>, columns: &[String]) -> Map<String, Value> {
    data.into_iter()
        .filter(|(key, _)| columns.iter().any(|c| c.eq_ignore_ascii_case(key)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (SourceOfRecord, Uuid) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();
        (SourceOfRecord::new(store), team)
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_table_with_ordered_columns() {
        let (sor, team) = setup();
        let table = sor
            .create_table(&team, "Leads", &columns(&["name", "email", "stage"]))
            .unwrap();
        assert_eq!(table.columns, vec!["name", "email", "stage"]);
    }

    #[test]
    fn test_table_name_case_insensitive_unique() {
        let (sor, team) = setup();
        sor.create_table(&team, "Leads", &columns(&["name"])).unwrap();
        assert!(sor.create_table(&team, "leads", &columns(&["name"])).is_err());

        let found = sor.find_table(&team, "LEADS").unwrap().unwrap();
        assert_eq!(found.name, "Leads");
    }

    #[test]
    fn test_same_name_across_tenants() {
        let (sor, team_a) = setup();
        let team_b = Uuid::new_v4();
        // Second tenant with the same table name is fine.
        // (team row needed for the FK)
        sor.store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't2')", [
                    team_b.to_string()
                ])
            })
            .unwrap();
        sor.create_table(&team_a, "leads", &columns(&["name"])).unwrap();
        sor.create_table(&team_b, "leads", &columns(&["name"])).unwrap();
        assert!(sor.find_table(&team_a, "leads").unwrap().is_some());
        assert!(sor.find_table(&team_b, "leads").unwrap().is_some());
    }

    #[test]
    fn test_rejects_bad_column_sets() {
        let (sor, team) = setup();
        assert!(sor.create_table(&team, "t", &[]).is_err());
        assert!(sor.create_table(&team, "t", &columns(&["a", "A"])).is_err());
        assert!(sor.create_table(&team, "t", &columns(&["a", " "])).is_err());
    }

    #[test]
    fn test_row_data_restricted_to_columns() {
        let (sor, team) = setup();
        let table = sor
            .create_table(&team, "leads", &columns(&["name", "email"]))
            .unwrap();

        let mut data = Map::new();
        data.insert("name".into(), json!("Ada"));
        data.insert("email".into(), json!("ada@example.com"));
        data.insert("sneaky".into(), json!("dropped"));

        let row = sor.insert_row(&team, &table.id, data).unwrap();
        assert_eq!(row.data.len(), 2);
        assert!(!row.data.contains_key("sneaky"));

        let rows = sor.list_rows(&team, &table.id, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["name"], json!("Ada"));
    }

    #[test]
    fn test_update_and_delete_row() {
        let (sor, team) = setup();
        let table = sor.create_table(&team, "leads", &columns(&["name"])).unwrap();
        let mut data = Map::new();
        data.insert("name".into(), json!("Ada"));
        let row = sor.insert_row(&team, &table.id, data).unwrap();

        let mut patch = Map::new();
        patch.insert("name".into(), json!("Grace"));
        let updated = sor.update_row(&team, &table.id, &row.id, patch).unwrap();
        assert_eq!(updated.data["name"], json!("Grace"));

        sor.delete_row(&team, &table.id, &row.id).unwrap();
        assert!(sor.list_rows(&team, &table.id, 10).unwrap().is_empty());
        assert!(sor.delete_row(&team, &table.id, &row.id).is_err());
    }

    #[test]
    fn test_permissions_default_deny() {
        let (sor, team) = setup();
        let table = sor.create_table(&team, "leads", &columns(&["name"])).unwrap();
        let agent = Uuid::new_v4();

        let permission = sor.permission(&agent, &table.id).unwrap();
        assert!(!permission.can_read);
        assert!(!permission.can_write);

        sor.set_permission(&team, &agent, &table.id, SorPermission {
            can_read: true,
            can_write: false,
        })
        .unwrap();
        let permission = sor.permission(&agent, &table.id).unwrap();
        assert!(permission.can_read);
        assert!(!permission.can_write);

        // Upsert path.
        sor.set_permission(&team, &agent, &table.id, SorPermission {
            can_read: true,
            can_write: true,
        })
        .unwrap();
        assert!(sor.permission(&agent, &table.id).unwrap().can_write);
    }

    #[test]
    fn test_cross_tenant_table_not_found() {
        let (sor, team) = setup();
        let table = sor.create_table(&team, "leads", &columns(&["name"])).unwrap();
        let err = sor.get_table(&Uuid::new_v4(), &table.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(sor.list_rows(&Uuid::new_v4(), &table.id, 10).is_err());
    }
}
