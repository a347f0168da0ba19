//! Source-of-record tools.
//!
//! Reads require `can_read`, writes require `can_write`, checked per
//! `(agent, table)` at this boundary on every call. Creating a table grants
//! the creating agent both.

use agentry_core::error::ToolError;
use agentry_core::sor::{SorPermission, SorTable};
use agentry_core::types::RiskLevel;
use async_trait::async_trait;
use std::sync::Arc;

use crate::registry::{Tool, engine_to_tool, required_str};
use crate::{ToolContext, ToolServices};

const ROW_LIMIT: usize = 50;

fn find_table(
    services: &ToolServices,
    ctx: &ToolContext,
    name: &str,
    tool: &str,
) -> Result<SorTable, ToolError> {
    services
        .sor
        .find_table(&ctx.team_id, name)
        .map_err(|e| engine_to_tool(tool, e))?
        .ok_or_else(|| ToolError::ExecutionFailed {
            name: tool.to_string(),
            message: format!("table '{name}' not found"),
        })
}

pub struct SorCreateTableTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SorCreateTableTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SorCreateTableTool {
    fn name(&self) -> &str {
        "sor_create_table"
    }

    fn description(&self) -> &str {
        "Create a source-of-record table with named columns. You get read and write access to it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "columns": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["name", "columns"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let name = required_str(&args, "name", self.name())?;
        let columns: Vec<String> = args
            .get("columns")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let table = self
            .services
            .sor
            .create_table(&self.ctx.team_id, name, &columns)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        self.services
            .sor
            .set_permission(&self.ctx.team_id, &self.ctx.agent_id, &table.id, SorPermission {
                can_read: true,
                can_write: true,
            })
            .map_err(|e| engine_to_tool(self.name(), e))?;

        Ok(format!(
            "Created table '{}' with columns [{}]",
            table.name,
            table.columns.join(", ")
        ))
    }
}

pub struct SorListTablesTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SorListTablesTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SorListTablesTool {
    fn name(&self) -> &str {
        "sor_list_tables"
    }

    fn description(&self) -> &str {
        "List the team's source-of-record tables and your access to each."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
        let tables = self
            .services
            .sor
            .list_tables(&self.ctx.team_id)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        if tables.is_empty() {
            return Ok("No tables exist yet.".into());
        }
        let mut lines = Vec::new();
        for table in tables {
            let permission = self
                .services
                .sor
                .permission(&self.ctx.agent_id, &table.id)
                .map_err(|e| engine_to_tool(self.name(), e))?;
            let access = match (permission.can_read, permission.can_write) {
                (true, true) => "read/write",
                (true, false) => "read-only",
                (false, true) => "write-only",
                (false, false) => "no access",
            };
            lines.push(format!(
                "{} [{}] columns: {}",
                table.name,
                access,
                table.columns.join(", ")
            ));
        }
        Ok(lines.join("\n"))
    }
}

pub struct SorReadTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SorReadTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SorReadTool {
    fn name(&self) -> &str {
        "sor_read"
    }

    fn description(&self) -> &str {
        "Read rows from a source-of-record table you have read access to."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "table": {"type": "string", "description": "Table name (case-insensitive)"},
                "limit": {"type": "integer"}
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let table_name = required_str(&args, "table", self.name())?;
        let table = find_table(&self.services, &self.ctx, table_name, self.name())?;

        let permission = self
            .services
            .sor
            .permission(&self.ctx.agent_id, &table.id)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        if !permission.can_read {
            return Err(ToolError::PermissionDenied {
                name: self.name().into(),
                reason: format!("no read access to '{}'", table.name),
            });
        }

        let limit = args
            .get("limit")
            .and_then(|l| l.as_u64())
            .map(|l| l.clamp(1, 200) as usize)
            .unwrap_or(ROW_LIMIT);
        let rows = self
            .services
            .sor
            .list_rows(&self.ctx.team_id, &table.id, limit)
            .map_err(|e| engine_to_tool(self.name(), e))?;

        let payload = serde_json::json!({
            "table": table.name,
            "columns": table.columns,
            "rows": rows.iter().map(|r| &r.data).collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&payload).map_err(|e| ToolError::ExecutionFailed {
            name: self.name().into(),
            message: e.to_string(),
        })
    }
}

pub struct SorWriteTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SorWriteTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SorWriteTool {
    fn name(&self) -> &str {
        "sor_write"
    }

    fn description(&self) -> &str {
        "Insert a row into a source-of-record table you have write access to."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "table": {"type": "string", "description": "Table name (case-insensitive)"},
                "data": {"type": "object", "description": "Column name to value mapping"}
            },
            "required": ["table", "data"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let table_name = required_str(&args, "table", self.name())?;
        let data = args
            .get("data")
            .and_then(|d| d.as_object())
            .cloned()
            .ok_or_else(|| ToolError::InvalidArguments {
                name: self.name().into(),
                reason: "'data' must be an object".into(),
            })?;

        let table = find_table(&self.services, &self.ctx, table_name, self.name())?;
        let permission = self
            .services
            .sor
            .permission(&self.ctx.agent_id, &table.id)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        if !permission.can_write {
            return Err(ToolError::PermissionDenied {
                name: self.name().into(),
                reason: format!("no write access to '{}'", table.name),
            });
        }

        let row = self
            .services
            .sor
            .insert_row(&self.ctx.team_id, &table.id, data)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        Ok(format!("Inserted row {} into '{}'", row.id, table.name))
    }
}
