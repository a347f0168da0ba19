//! The agent runtime — an iterated reason/act loop.
//!
//! Each invocation seeds a message log with the system prompt and the user
//! message, then alternates model calls and tool executions until the model
//! answers without tool calls, the iteration budget runs out, credits are
//! exhausted, or the provider fails unrecoverably. Credits are deducted
//! before every model call and refunded on provider failure under the same
//! correlation id. High-risk tool calls are intercepted into the approval
//! queue instead of executing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityLog, Approvals, ApprovalStatus, event};
use crate::agents::Agent;
use crate::credits::Credits;
use crate::error::{EngineError, ModelError, Result, ToolError};
use crate::models::{ChatClient, ModelConfig};
use crate::types::{ChatMessage, Completion, RiskLevel, TokenUsage, ToolDefinition, truncate_utf8};

/// Message appended when the iteration budget is exhausted.
pub const STEP_BUDGET_ANSWER: &str = "I hit my step budget.";

/// Tool results are truncated to 8 KB before entering the log.
const TOOL_RESULT_MAX_BYTES: usize = 8 * 1024;

/// Argument summaries in the activity log are kept short.
const ARGS_SUMMARY_MAX_BYTES: usize = 200;

/// Provider retries per model call.
const MODEL_MAX_RETRIES: usize = 2;

/// Recognized runtime options.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub max_iterations: usize,
    /// Disable credit accounting (free-template agents, trusted internal
    /// invocations).
    pub skip_credits: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            skip_credits: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The model answered without tool calls.
    Completed,
    /// `max_iterations` model calls were spent.
    StepBudget,
}

/// The result of one completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_answer: String,
    pub iterations: usize,
    pub total_usage: TokenUsage,
    pub termination: Termination,
}

/// A tool handler: raw JSON arguments in, result text out.
pub type ToolHandler = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool registered for one run: schema, risk posture, and handler. The
/// handler captures the tenant context and requesting agent when the set is
/// built; permission checks happen again inside the handler, never here.
pub struct RuntimeTool {
    pub definition: ToolDefinition,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub handler: ToolHandler,
}

/// The effective tool set for one run.
#[derive(Default)]
pub struct ToolSet {
    tools: HashMap<String, RuntimeTool>,
    order: Vec<String>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RuntimeTool) {
        let name = tool.definition.name.clone();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeTool> {
        self.tools.get(name)
    }

    /// Definitions in registration order, for the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The model call seam. The wire client implements it with retry; tests
/// substitute scripted completions.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(
        &self,
        config: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, ModelError>;
}

#[async_trait]
impl ModelBackend for ChatClient {
    async fn complete(
        &self,
        config: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, ModelError> {
        self.chat_completion_with_retry(config, messages, tools, cancel, MODEL_MAX_RETRIES)
            .await
    }
}

/// The runtime. One instance serves every agent; per-invocation state lives
/// on the stack of [`AgentRuntime::run`].
pub struct AgentRuntime {
    backend: Arc<dyn ModelBackend>,
    credits: Arc<Credits>,
    activity: Arc<ActivityLog>,
    approvals: Arc<Approvals>,
}

impl AgentRuntime {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        credits: Arc<Credits>,
        activity: Arc<ActivityLog>,
        approvals: Arc<Approvals>,
    ) -> Self {
        Self {
            backend,
            credits,
            activity,
            approvals,
        }
    }

    /// Run the loop for one invocation.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        user_message: &str,
        model_config: &ModelConfig,
        system_prompt: &str,
        tools: &ToolSet,
        config: RuntimeConfig,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut log = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_message),
        ];
        let definitions = tools.definitions();
        let mut total_usage = TokenUsage::default();

        info!(agent_id = %agent.id, model = %model_config.model, "Runtime invocation started");

        for iteration in 1..=config.max_iterations {
            if cancel.is_cancelled() {
                return Err(EngineError::Model(ModelError::Request {
                    message: "invocation cancelled".into(),
                    retryable: false,
                }));
            }

            let completion = self
                .call_model(agent, team_id, model_config, &log, &definitions, &config, cancel)
                .await?;
            total_usage.input_tokens += completion.usage.input_tokens;
            total_usage.output_tokens += completion.usage.output_tokens;

            if completion.is_final() {
                debug!(agent_id = %agent.id, iteration, "Final answer produced");
                return Ok(RunOutcome {
                    final_answer: completion.content,
                    iterations: iteration,
                    total_usage,
                    termination: Termination::Completed,
                });
            }

            log.push(ChatMessage::assistant_with_calls(
                completion.content.clone(),
                completion.tool_calls.clone(),
            ));

            for call in &completion.tool_calls {
                let result_text = self
                    .handle_tool_call(agent, team_id, tools, &call.name, &call.arguments)
                    .await;
                let truncated = truncate_utf8(&result_text, TOOL_RESULT_MAX_BYTES);
                log.push(ChatMessage::tool_result(call.id.clone(), truncated));
            }
        }

        warn!(agent_id = %agent.id, max = config.max_iterations, "Step budget exhausted");
        Ok(RunOutcome {
            final_answer: STEP_BUDGET_ANSWER.into(),
            iterations: config.max_iterations,
            total_usage,
            termination: Termination::StepBudget,
        })
    }

    /// One budgeted model call: deduct, call, refund on failure.
    #[allow(clippy::too_many_arguments)]
    async fn call_model(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        model_config: &ModelConfig,
        log: &[ChatMessage],
        definitions: &[ToolDefinition],
        config: &RuntimeConfig,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let cost = model_config.cost_per_use;
        let charging = !config.skip_credits && cost > 0;
        let correlation = Uuid::new_v4();

        if charging {
            match self
                .credits
                .try_deduct(team_id, cost, &format!("model:{}", model_config.model), &correlation)
            {
                Ok(()) => {}
                Err(e @ EngineError::InsufficientCredits { .. }) => {
                    let _ = self.activity.record(
                        team_id,
                        Some(&agent.id),
                        event::CREDITS_EXHAUSTED,
                        &format!("model {} needs {cost} credits", model_config.model),
                    );
                    return Err(e);
                }
                Err(other) => return Err(other),
            }
        }

        let tools = (!definitions.is_empty()).then_some(definitions);
        match self
            .backend
            .complete(model_config, log, tools, cancel)
            .await
        {
            Ok(completion) => Ok(completion),
            Err(e) => {
                if charging {
                    // Net-zero pair under the shared correlation id.
                    if let Err(refund_err) =
                        self.credits
                            .refund(team_id, cost, "provider failure", &correlation)
                    {
                        warn!(error = %refund_err, "Credit refund failed");
                    }
                }
                Err(EngineError::Model(e))
            }
        }
    }

    /// Validate, gate, and execute a single tool call, producing the
    /// tool-result text fed back to the model. Failures become error text,
    /// never aborts.
    async fn handle_tool_call(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        tools: &ToolSet,
        name: &str,
        arguments: &Value,
    ) -> String {
        let Some(tool) = tools.get(name) else {
            debug!(tool = name, "Unknown tool requested");
            return format!("Error: unknown tool '{name}'");
        };

        if let Err(reason) = validate_arguments(&tool.definition.parameters, arguments) {
            return format!("Error: invalid arguments for '{name}': {reason}");
        }

        let gated = tool.requires_approval || high_risk(name, arguments).is_some();
        if gated {
            let risk = high_risk(name, arguments).unwrap_or(tool.risk_level.max(RiskLevel::High));
            let detail = canonical_args(arguments);
            match self.approval_state(agent, team_id, name, &detail, risk) {
                GateDecision::Execute => {}
                GateDecision::Pending => {
                    return format!(
                        "Action '{name}' is awaiting human review. Do not retry it this turn; \
                         continue with other work or finish."
                    );
                }
                GateDecision::Rejected => {
                    return format!("Error: action '{name}' was rejected by a reviewer.");
                }
                GateDecision::Failed(message) => {
                    return format!("Error: approval check failed: {message}");
                }
            }
        }

        let result = (tool.handler)(arguments.clone()).await;

        let summary = truncate_utf8(&canonical_args(arguments), ARGS_SUMMARY_MAX_BYTES).to_string();
        let _ = self.activity.record(
            team_id,
            Some(&agent.id),
            event::TOOL_EXECUTED,
            &format!("{name} {summary}"),
        );

        match result {
            Ok(output) => output,
            Err(e) => format!("Error: {e}"),
        }
    }

    fn approval_state(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        name: &str,
        detail: &str,
        risk: RiskLevel,
    ) -> GateDecision {
        match self.approvals.latest_for_action(&agent.id, name, detail) {
            Ok(Some(approval)) => match approval.status {
                ApprovalStatus::Approved => GateDecision::Execute,
                ApprovalStatus::Pending => GateDecision::Pending,
                ApprovalStatus::Rejected => GateDecision::Rejected,
            },
            Ok(None) => {
                match self
                    .approvals
                    .open(team_id, &agent.id, name, detail, risk)
                {
                    Ok(approval) => {
                        let _ = self.activity.record(
                            team_id,
                            Some(&agent.id),
                            event::APPROVAL_REQUESTED,
                            &format!("{name} ({})", approval.risk_level),
                        );
                        GateDecision::Pending
                    }
                    Err(e) => GateDecision::Failed(e.to_string()),
                }
            }
            Err(e) => GateDecision::Failed(e.to_string()),
        }
    }
}

enum GateDecision {
    Execute,
    Pending,
    Rejected,
    Failed(String),
}

/// Canonical serialization of tool arguments, used as the approval's action
/// detail so an identical re-submission matches its earlier decision.
fn canonical_args(arguments: &Value) -> String {
    serde_json::to_string(arguments).unwrap_or_else(|_| "{}".into())
}

/// Argument predicates that force the approval gate regardless of how the
/// tool was registered.
fn high_risk(name: &str, arguments: &Value) -> Option<RiskLevel> {
    if name.starts_with("send_external") || name.ends_with("_external_send") {
        return Some(RiskLevel::High);
    }
    // Writes that try to step outside the workspace.
    if let Some(path) = arguments.get("path").and_then(|p| p.as_str()) {
        if path.contains("..") || path.starts_with('/') {
            return Some(RiskLevel::High);
        }
    }
    None
}

/// Shallow JSON-schema validation: the argument payload must be an object,
/// required keys must be present, and declared primitive types must match.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    let Some(args) = arguments.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !args.contains_key(key) {
                return Err(format!("missing required field '{key}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, spec) in properties {
            let Some(value) = args.get(key) else {
                continue;
            };
            let Some(expected) = spec.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("field '{key}' must be a {expected}"));
            }
        }
    }
    Ok(())
}
