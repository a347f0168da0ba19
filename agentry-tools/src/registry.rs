//! Tool trait and registration into the runtime's tool set.
//!
//! Tools are values: a schema, a risk posture, and an async handler. Each
//! tool instance is constructed for one `(team, agent)` pair and re-verifies
//! ownership and permissions inside its handler. Execution is wrapped with a
//! per-tool timeout before it reaches the runtime.

use agentry_core::error::ToolError;
use agentry_core::runtime::{RuntimeTool, ToolSet};
use agentry_core::types::{RiskLevel, ToolDefinition};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Trait all first-class tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// The risk level of this tool.
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    /// Whether every call must pass the human approval gate.
    fn requires_approval(&self) -> bool {
        false
    }

    /// Maximum execution time before timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError>;
}

/// Register a tool into a runtime tool set, wrapping execution with its
/// timeout.
pub fn register(set: &mut ToolSet, tool: Arc<dyn Tool>) {
    let definition = ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    };
    let risk_level = tool.risk_level();
    let requires_approval = tool.requires_approval();
    debug!(tool = %definition.name, %risk_level, "Registering tool");

    set.register(RuntimeTool {
        definition,
        risk_level,
        requires_approval,
        handler: Box::new(move |args| {
            let tool = Arc::clone(&tool);
            Box::pin(async move {
                let timeout = tool.timeout();
                match tokio::time::timeout(timeout, tool.execute(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        name: tool.name().to_string(),
                        timeout_secs: timeout.as_secs(),
                    }),
                }
            })
        }),
    });
}

/// Map an engine error onto the tool error surface without leaking
/// cross-tenant existence.
pub(crate) fn engine_to_tool(name: &str, e: agentry_core::EngineError) -> ToolError {
    use agentry_core::ErrorKind;
    match e.kind() {
        ErrorKind::Forbidden => ToolError::PermissionDenied {
            name: name.to_string(),
            reason: e.to_string(),
        },
        ErrorKind::NotFound => ToolError::ExecutionFailed {
            name: name.to_string(),
            message: "not found".to_string(),
        },
        _ => ToolError::ExecutionFailed {
            name: name.to_string(),
            message: e.to_string(),
        },
    }
}

/// Extract a required string argument.
pub(crate) fn required_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
    tool: &str,
) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("'{key}' is required"),
        })
}

/// Extract a required UUID argument.
pub(crate) fn required_uuid(
    args: &serde_json::Value,
    key: &str,
    tool: &str,
) -> Result<uuid::Uuid, ToolError> {
    let raw = required_str(args, key, tool)?;
    uuid::Uuid::parse_str(raw).map_err(|_| ToolError::InvalidArguments {
        name: tool.to_string(),
        reason: format!("'{key}' must be a uuid"),
    })
}
