//! Knowledge base tools.

use agentry_core::error::ToolError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::registry::{Tool, engine_to_tool, required_str};
use crate::{ToolContext, ToolServices};

const DEFAULT_TOP_K: usize = 5;

/// Hybrid search over the team's ingested documents.
pub struct SearchKbTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl SearchKbTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for SearchKbTool {
    fn name(&self) -> &str {
        "search_kb"
    }

    fn description(&self) -> &str {
        "Search the team knowledge base. Returns the most relevant document passages."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "description": "How many passages to return"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let query = required_str(&args, "query", self.name())?;
        let top_k = args
            .get("top_k")
            .and_then(|k| k.as_u64())
            .map(|k| k.clamp(1, 20) as usize)
            .unwrap_or(DEFAULT_TOP_K);

        let hits = self
            .services
            .kb
            .search(
                &self.ctx.team_id,
                query,
                top_k,
                None,
                self.services.embed_config.as_ref(),
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| engine_to_tool(self.name(), e))?;

        if hits.is_empty() {
            return Ok("No matching passages found.".into());
        }
        let rendered: Vec<String> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[{}] (doc {})\n{}", i + 1, hit.document_id, hit.content))
            .collect();
        Ok(rendered.join("\n\n"))
    }
}

/// Store a durable memory note.
pub struct AddMemoryTool {
    services: Arc<ToolServices>,
    ctx: ToolContext,
}

impl AddMemoryTool {
    pub fn new(services: &Arc<ToolServices>, ctx: ToolContext) -> Self {
        Self {
            services: Arc::clone(services),
            ctx,
        }
    }
}

#[async_trait]
impl Tool for AddMemoryTool {
    fn name(&self) -> &str {
        "add_memory"
    }

    fn description(&self) -> &str {
        "Store a short free-text note in the team memory. Use for durable facts worth recalling later."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"content": {"type": "string"}},
            "required": ["content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let content = required_str(&args, "content", self.name())?;
        let memory = self
            .services
            .kb
            .add_memory(
                &self.ctx.team_id,
                &self.ctx.agent_id,
                content,
                self.services.embed_config.as_ref(),
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| engine_to_tool(self.name(), e))?;
        Ok(format!("Memory {} stored", memory.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::services;
    use serde_json::json;

    #[tokio::test]
    async fn test_search_after_ingest() {
        let (services, ctx, _) = services();
        let doc = services
            .kb
            .create_document(&ctx.team_id, "pricing.txt")
            .unwrap();
        services
            .kb
            .process(
                &ctx.team_id,
                &doc.id,
                b"The new pricing tier launches in March.\n\nSupport hours stay unchanged.",
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let result = SearchKbTool::new(&services, ctx)
            .execute(json!({"query": "pricing tier"}))
            .await
            .unwrap();
        assert!(result.contains("pricing tier launches"));

        let miss = SearchKbTool::new(&services, ctx)
            .execute(json!({"query": "zebra migration"}))
            .await
            .unwrap();
        assert_eq!(miss, "No matching passages found.");
    }

    #[tokio::test]
    async fn test_add_memory() {
        let (services, ctx, _) = services();
        let result = AddMemoryTool::new(&services, ctx)
            .execute(json!({"content": "Standup moved to 9:30"}))
            .await
            .unwrap();
        assert!(result.starts_with("Memory"));

        let found = services
            .kb
            .search_memories(&ctx.team_id, "standup", 5, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, ctx.agent_id);
    }
}
