//! Explicit approval requests.

use agentry_core::error::ToolError;
use agentry_core::types::RiskLevel;
use async_trait::async_trait;
use std::sync::Arc;

use crate::registry::{Tool, engine_to_tool, required_str};
use crate::{ToolContext, ToolServices};

/// Lets an agent queue an action for human review before attempting it.
/// The runtime also intercepts high-risk calls on its own; this tool is the
/// agent-initiated path.
pub struct RequestApprovalTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl RequestApprovalTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for RequestApprovalTool {
    fn name(&self) -> &str {
        "request_approval"
    }

    fn description(&self) -> &str {
        "Ask a human to approve an action before you take it. Describe the action precisely; \
         the same description must be used when retrying after approval."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action_type": {"type": "string", "description": "Short action identifier"},
                "detail": {"type": "string", "description": "What exactly will happen"},
                "risk_level": {"type": "string", "enum": ["low", "medium", "high", "critical"]}
            },
            "required": ["action_type", "detail"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let action_type = required_str(&args, "action_type", self.name())?;
        let detail = required_str(&args, "detail", self.name())?;
        let risk_level = args
            .get("risk_level")
            .and_then(|r| r.as_str())
            .map(|r| {
                r.parse::<RiskLevel>()
                    .map_err(|reason| ToolError::InvalidArguments {
                        name: self.name().into(),
                        reason,
                    })
            })
            .transpose()?
            .unwrap_or(RiskLevel::Medium);

        let approval = self
            .services
            .approvals
            .open(
                &self.ctx.team_id,
                &self.ctx.agent_id,
                action_type,
                detail,
                risk_level,
            )
            .map_err(|e| engine_to_tool(self.name(), e))?;

        Ok(format!(
            "Approval {} opened ({}, {}). It is pending human review; do not take the action \
             until it is approved.",
            approval.id, approval.action_type, approval.risk_level
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::activity::ApprovalStatus;
    use crate::tests::services;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_opens_pending_approval() {
        let (services, ctx, _) = services();
        let result = RequestApprovalTool::new(&services, ctx)
            .execute(json!({
                "action_type": "publish_report",
                "detail": "post Q3 numbers to the public site",
                "risk_level": "high"
            }))
            .await
            .unwrap();
        assert!(result.contains("pending human review"));

        let pending = services
            .approvals
            .list(&ctx.team_id, Some(ApprovalStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, "publish_report");
        assert_eq!(pending[0].risk_level, RiskLevel::High);
        assert_eq!(pending[0].agent_id, ctx.agent_id);
    }

    #[tokio::test]
    async fn test_default_risk_is_medium() {
        let (services, ctx, _) = services();
        RequestApprovalTool::new(&services, ctx)
            .execute(json!({"action_type": "x", "detail": "y"}))
            .await
            .unwrap();
        let pending = services.approvals.list(&ctx.team_id, None).unwrap();
        assert_eq!(pending[0].risk_level, RiskLevel::Medium);
    }
}
