//! Task board tools.

use agentry_core::error::ToolError;
use agentry_core::tasks::{NewTask, TaskPatch, TaskPriority, TaskStatus};
use agentry_core::types::RiskLevel;
use async_trait::async_trait;
use std::sync::Arc;

use crate::registry::{Tool, engine_to_tool, required_str, required_uuid};
use crate::{ToolContext, ToolServices};

pub struct CreateTaskTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl CreateTaskTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a task on the team board. Defaults to backlog status and medium priority."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "priority": {"type": "string", "enum": ["low", "medium", "high", "urgent"]},
                "assign_to_me": {"type": "boolean", "description": "Assign the new task to yourself"}
            },
            "required": ["title"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let title = required_str(&args, "title", self.name())?;
        let priority = args
            .get("priority")
            .and_then(|p| p.as_str())
            .map(|p| {
                p.parse::<TaskPriority>()
                    .map_err(|reason| ToolError::InvalidArguments {
                        name: self.name().into(),
                        reason,
                    })
            })
            .transpose()?;
        let assign_to_me = args
            .get("assign_to_me")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let task = self
            .services
            .tasks
            .create(&self.ctx.team_id, NewTask {
                title: title.into(),
                description: args
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .into(),
                priority,
                assigned_agent_id: assign_to_me.then_some(self.ctx.agent_id),
                ..NewTask::default()
            })
            .map_err(|e| engine_to_tool(self.name(), e))?;

        Ok(format!("Created task {} \"{}\"", task.id, task.title))
    }
}

pub struct ListTasksTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl ListTasksTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List the team's tasks, optionally filtered by status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["backlog", "todo", "in_progress", "review", "done"]
                }
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let status = args
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| {
                s.parse::<TaskStatus>()
                    .map_err(|reason| ToolError::InvalidArguments {
                        name: self.name().into(),
                        reason,
                    })
            })
            .transpose()?;

        let tasks = self
            .services
            .tasks
            .list(&self.ctx.team_id, status)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        if tasks.is_empty() {
            return Ok("No tasks found.".into());
        }

        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                let assigned = t
                    .assigned_agent_id
                    .map(|a| {
                        if a == self.ctx.agent_id {
                            " (assigned to you)".to_string()
                        } else {
                            format!(" (assigned to {a})")
                        }
                    })
                    .unwrap_or_default();
                format!("{} [{}/{}] {}{}", t.id, t.status, t.priority, t.title, assigned)
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

pub struct UpdateTaskTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl UpdateTaskTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for UpdateTaskTool {
    fn name(&self) -> &str {
        "update_task"
    }

    fn description(&self) -> &str {
        "Update a task's status, priority, title, or description."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string"},
                "status": {
                    "type": "string",
                    "enum": ["backlog", "todo", "in_progress", "review", "done"]
                },
                "priority": {"type": "string", "enum": ["low", "medium", "high", "urgent"]},
                "title": {"type": "string"},
                "description": {"type": "string"}
            },
            "required": ["task_id"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let task_id = required_uuid(&args, "task_id", self.name())?;
        let status = args
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| {
                s.parse::<TaskStatus>()
                    .map_err(|reason| ToolError::InvalidArguments {
                        name: self.name().into(),
                        reason,
                    })
            })
            .transpose()?;
        let priority = args
            .get("priority")
            .and_then(|p| p.as_str())
            .map(|p| {
                p.parse::<TaskPriority>()
                    .map_err(|reason| ToolError::InvalidArguments {
                        name: self.name().into(),
                        reason,
                    })
            })
            .transpose()?;

        let task = self
            .services
            .tasks
            .update(&self.ctx.team_id, &task_id, TaskPatch {
                title: args.get("title").and_then(|t| t.as_str()).map(String::from),
                description: args
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(String::from),
                status,
                priority,
                ..TaskPatch::default()
            })
            .map_err(|e| engine_to_tool(self.name(), e))?;
        Ok(format!("Task {} is now [{}/{}]", task.id, task.status, task.priority))
    }
}

pub struct DeleteTaskTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl DeleteTaskTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a task from the board."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"task_id": {"type": "string"}},
            "required": ["task_id"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let task_id = required_uuid(&args, "task_id", self.name())?;
        self.services
            .tasks
            .delete(&self.ctx.team_id, &task_id)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        Ok(format!("Deleted task {task_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::services;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_list_update_delete() {
        let (services, ctx, _) = services();

        let created = CreateTaskTool::new(&services, ctx)
            .execute(json!({"title": "write weekly report", "priority": "high", "assign_to_me": true}))
            .await
            .unwrap();
        assert!(created.contains("write weekly report"));

        let listed = ListTasksTool::new(&services, ctx)
            .execute(json!({}))
            .await
            .unwrap();
        assert!(listed.contains("write weekly report"));
        assert!(listed.contains("(assigned to you)"));

        let task_id = listed.split_whitespace().next().unwrap().to_string();
        let updated = UpdateTaskTool::new(&services, ctx)
            .execute(json!({"task_id": task_id, "status": "done"}))
            .await
            .unwrap();
        assert!(updated.contains("[done/high]"));

        let deleted = DeleteTaskTool::new(&services, ctx)
            .execute(json!({"task_id": task_id}))
            .await
            .unwrap();
        assert!(deleted.starts_with("Deleted"));

        let empty = ListTasksTool::new(&services, ctx)
            .execute(json!({}))
            .await
            .unwrap();
        assert_eq!(empty, "No tasks found.");
    }

    #[tokio::test]
    async fn test_cross_tenant_update_says_not_found() {
        let (services, ctx, store) = services();
        // A task in some other tenant.
        let other_team = uuid::Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 'other')", [
                    other_team.to_string()
                ])
            })
            .unwrap();
        let foreign = services
            .tasks
            .create(&other_team, NewTask {
                title: "foreign".into(),
                ..NewTask::default()
            })
            .unwrap();

        let err = UpdateTaskTool::new(&services, ctx)
            .execute(json!({"task_id": foreign.id.to_string(), "status": "done"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_invalid_priority_rejected() {
        let (services, ctx, _) = services();
        let err = CreateTaskTool::new(&services, ctx)
            .execute(json!({"title": "x", "priority": "urgent!!"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
