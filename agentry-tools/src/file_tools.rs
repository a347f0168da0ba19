//! Workspace file tools.

use agentry_core::error::ToolError;
use agentry_core::types::RiskLevel;
use async_trait::async_trait;
use std::sync::Arc;

use crate::registry::{Tool, engine_to_tool, required_str};
use crate::{ToolContext, ToolServices};

pub struct ListFilesTool {
    services: Arc<ToolServices>,
}

impl ListFilesTool {
    pub fn new(services: &Arc<ToolServices>) -> Self {
        Self {
            services: Arc::clone(services),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in the shared workspace, optionally under a subdirectory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prefix": {"type": "string", "description": "Subdirectory to list"}
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let prefix = args.get("prefix").and_then(|p| p.as_str());
        let entries = self
            .services
            .workspace
            .list(prefix)
            .map_err(|e| engine_to_tool(self.name(), e))?;
        if entries.is_empty() {
            return Ok("The workspace is empty.".into());
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|f| {
                if f.is_dir {
                    format!("{}/", f.path)
                } else {
                    format!("{} ({} bytes)", f.path, f.size)
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

pub struct ReadFileTool {
    services: Arc<ToolServices>,
}

impl ReadFileTool {
    pub fn new(services: &Arc<ToolServices>) -> Self {
        Self {
            services: Arc::clone(services),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the shared workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        self.services
            .workspace
            .read(path)
            .map_err(|e| engine_to_tool(self.name(), e))
    }
}

pub struct WriteFileTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl WriteFileTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file in the shared workspace. Takes a 30-second cooperative lock on the path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let content = args
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ToolError::InvalidArguments {
                name: self.name().into(),
                reason: "'content' is required".into(),
            })?;

        self.services
            .workspace
            .write(&self.ctx.agent_id, path, content)
            .map_err(|e| match e.kind() {
                // Lock conflicts carry their retry hint through verbatim.
                agentry_core::ErrorKind::Conflict => ToolError::ExecutionFailed {
                    name: self.name().into(),
                    message: e.to_string(),
                },
                _ => engine_to_tool(self.name(), e),
            })?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }
}
