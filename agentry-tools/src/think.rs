//! The think scratchpad tool.

use agentry_core::error::ToolError;
use async_trait::async_trait;

use crate::registry::{Tool, required_str};

/// Lets the model reason in a recorded step without side effects. Useful as
/// the first call of a heartbeat.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record a private reasoning step. Has no side effects; use it to plan before acting."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "thought": {"type": "string", "description": "The reasoning step"}
            },
            "required": ["thought"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let thought = required_str(&args, "thought", "think")?;
        tracing::debug!(chars = thought.len(), "Thought recorded");
        Ok("Thought recorded.".into())
    }
}
