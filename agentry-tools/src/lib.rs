//! # Agentry Tools
//!
//! The first-class tool set agents use during runtime loops: the task board,
//! chat, workspace files, knowledge-base search and memories, source-of-record
//! tables, approvals, and the think scratchpad. Tools are built per
//! `(team, agent)` pair so every handler re-verifies ownership and
//! permissions against its own tenant context.

pub mod approval_tool;
pub mod chat_tools;
pub mod file_tools;
pub mod kb_tools;
pub mod registry;
pub mod sor_tools;
pub mod task_tools;
pub mod think;

use agentry_core::activity::Approvals;
use agentry_core::chat::{Chat, Notifications};
use agentry_core::kb::KnowledgeBase;
use agentry_core::models::ModelConfig;
use agentry_core::runtime::{RuntimeTool, ToolSet};
use agentry_core::skills::SkillLibrary;
use agentry_core::sor::SourceOfRecord;
use agentry_core::tasks::Tasks;
use agentry_core::types::RiskLevel;
use agentry_core::workspace::Workspace;
use std::sync::Arc;
use uuid::Uuid;

pub use registry::{Tool, register};

/// Everything the tool set touches. Built once at engine startup.
pub struct ToolServices {
    pub tasks: Arc<Tasks>,
    pub chat: Arc<Chat>,
    pub notifications: Arc<Notifications>,
    pub workspace: Arc<Workspace>,
    pub kb: Arc<KnowledgeBase>,
    pub sor: Arc<SourceOfRecord>,
    pub approvals: Arc<Approvals>,
    pub skills: Arc<SkillLibrary>,
    /// Embedding configuration for `search_kb` / `add_memory`; lexical-only
    /// when absent.
    pub embed_config: Option<ModelConfig>,
}

/// The tenant context a tool set is built for.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub team_id: Uuid,
    pub agent_id: Uuid,
}

/// Build the effective tool set for one agent: the core tools plus the
/// schemas declared by the agent's installed skills.
pub fn agent_toolset(services: &Arc<ToolServices>, ctx: ToolContext) -> ToolSet {
    let mut set = ToolSet::new();

    register(&mut set, Arc::new(think::ThinkTool));
    register(&mut set, Arc::new(task_tools::CreateTaskTool::new(services, ctx)));
    register(&mut set, Arc::new(task_tools::ListTasksTool::new(services, ctx)));
    register(&mut set, Arc::new(task_tools::UpdateTaskTool::new(services, ctx)));
    register(&mut set, Arc::new(task_tools::DeleteTaskTool::new(services, ctx)));
    register(&mut set, Arc::new(chat_tools::SendMessageTool::new(services, ctx)));
    register(&mut set, Arc::new(file_tools::ListFilesTool::new(services)));
    register(&mut set, Arc::new(file_tools::ReadFileTool::new(services)));
    register(&mut set, Arc::new(file_tools::WriteFileTool::new(services, ctx)));
    register(&mut set, Arc::new(kb_tools::SearchKbTool::new(services, ctx)));
    register(&mut set, Arc::new(kb_tools::AddMemoryTool::new(services, ctx)));
    register(&mut set, Arc::new(sor_tools::SorCreateTableTool::new(services, ctx)));
    register(&mut set, Arc::new(sor_tools::SorListTablesTool::new(services, ctx)));
    register(&mut set, Arc::new(sor_tools::SorReadTool::new(services, ctx)));
    register(&mut set, Arc::new(sor_tools::SorWriteTool::new(services, ctx)));
    register(&mut set, Arc::new(approval_tool::RequestApprovalTool::new(services, ctx)));

    add_skill_tools(&mut set, services, ctx);
    set
}

/// Skill-declared tools are schema-only: calling one hands the skill's
/// instruction body back to the model, which then carries the steps out
/// with the core tools.
fn add_skill_tools(set: &mut ToolSet, services: &Arc<ToolServices>, ctx: ToolContext) {
    let installed = match services.skills.agent_skills(&ctx.agent_id) {
        Ok(installed) => installed,
        Err(e) => {
            tracing::warn!(agent_id = %ctx.agent_id, error = %e, "Skill lookup failed");
            return;
        }
    };
    for skill_name in installed {
        let Some(skill) = services.skills.get(&skill_name) else {
            continue;
        };
        for definition in &skill.tools {
            let body = skill.body.clone();
            let name = definition.name.clone();
            set.register(RuntimeTool {
                definition: definition.clone(),
                risk_level: RiskLevel::Low,
                requires_approval: false,
                handler: Box::new(move |_args| {
                    let body = body.clone();
                    let name = name.clone();
                    Box::pin(async move {
                        Ok(format!(
                            "Follow these instructions to complete '{name}':\n\n{body}"
                        ))
                    })
                }),
            });
        }
    }
}
