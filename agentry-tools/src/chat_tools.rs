//! Chat tools.

use agentry_core::chat::SenderKind;
use agentry_core::error::ToolError;
use async_trait::async_trait;
use std::sync::Arc;

use crate::registry::{Tool, engine_to_tool, required_str, required_uuid};
use crate::{ToolContext, ToolServices};

/// Post a message into a team channel as the agent. Mentions in the message
/// body fire their usual side effects (agent wake, user notification).
pub struct SendMessageTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SendMessageTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a chat channel. Mention agents as @[Name](agent:<id>) to wake them, \
         users as @[Name](user:<id>) to notify them."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel_id": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["channel_id", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let channel_id = required_uuid(&args, "channel_id", self.name())?;
        let content = required_str(&args, "content", self.name())?;

        let message = self
            .services
            .chat
            .post_message(
                &self.ctx.team_id,
                &channel_id,
                SenderKind::Agent,
                &self.ctx.agent_id.to_string(),
                content,
            )
            .map_err(|e| engine_to_tool(self.name(), e))?;

        // Mention side effects run inline here; the tool call already sits
        // off the human request path.
        self.services
            .chat
            .handle_mentions(&self.services.notifications, &message);

        Ok(format!("Message {} sent", message.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::services;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_message_and_user_mention() {
        let (services, ctx, _) = services();
        let channel = services.chat.create_group(&ctx.team_id, "general").unwrap();
        let user = uuid::Uuid::new_v4();

        let result = SendMessageTool::new(&services, ctx)
            .execute(json!({
                "channel_id": channel.id.to_string(),
                "content": format!("status update for @[Ana](user:{user})")
            }))
            .await
            .unwrap();
        assert!(result.starts_with("Message"));

        let messages = services
            .chat
            .messages(&ctx.team_id, &channel.id, None, 10)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_kind, SenderKind::Agent);

        let notes = services.notifications.list(&user, false).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "mention");
    }

    #[tokio::test]
    async fn test_send_to_foreign_channel_not_found() {
        let (services, ctx, store) = services();
        let other_team = uuid::Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 'other')", [
                    other_team.to_string()
                ])
            })
            .unwrap();
        let foreign = services.chat.create_group(&other_team, "private").unwrap();

        let err = SendMessageTool::new(&services, ctx)
            .execute(json!({
                "channel_id": foreign.id.to_string(),
                "content": "hello?"
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
