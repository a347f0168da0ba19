//! Engine assembly — constructs every subsystem in dependency order and
//! exposes the composite operations the HTTP handlers call.
//!
//! The construction order matters: chat is built before the scheduler, which
//! registers itself as chat's mention trigger once it exists; the scheduler's
//! proactive runs and the meeting orchestrator's turns both come back through
//! the seams implemented here.

use agentry_core::activity::{ActivityLog, Approvals, event};
use agentry_core::agents::{Agent, Agents};
use agentry_core::chat::{Chat, Notifications, ScheduleTrigger, SenderKind};
use agentry_core::config::EngineConfig;
use agentry_core::credits::Credits;
use agentry_core::error::Result;
use agentry_core::identity::JwtVerifier;
use agentry_core::kb::KnowledgeBase;
use agentry_core::meetings::{
    MeetingAgent, MeetingSpec, Meetings, TranscriptEntry, TurnStream,
};
use agentry_core::models::{ChatClient, ModelConfig, ModelRouter, PROVIDERS, StreamDelta};
use agentry_core::runtime::{AgentRuntime, ModelBackend, RuntimeConfig};
use agentry_core::scheduler::{HeartbeatRunner, Scheduler};
use agentry_core::skills::SkillLibrary;
use agentry_core::sor::SourceOfRecord;
use agentry_core::store::Store;
use agentry_core::stt::RemoteTranscriber;
use agentry_core::tasks::{Goals, MeasurableGoals, Tasks};
use agentry_core::tenancy::{TeamContext, Tenancy};
use agentry_core::types::ChatMessage;
use agentry_core::vault::{CredentialStore, Vault};
use agentry_core::workspace::Workspace;
use agentry_tools::{ToolContext, ToolServices, agent_toolset};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// The assembled engine.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub verifier: Arc<JwtVerifier>,
    pub tenancy: Arc<Tenancy>,
    pub vault: Arc<Vault>,
    pub router: Arc<ModelRouter>,
    pub agents: Arc<Agents>,
    pub tasks: Arc<Tasks>,
    pub goals: Arc<Goals>,
    pub measurable_goals: Arc<MeasurableGoals>,
    pub chat: Arc<Chat>,
    pub notifications: Arc<Notifications>,
    pub credits: Arc<Credits>,
    pub activity: Arc<ActivityLog>,
    pub approvals: Arc<Approvals>,
    pub workspace: Arc<Workspace>,
    pub kb: Arc<KnowledgeBase>,
    pub sor: Arc<SourceOfRecord>,
    pub skills: Arc<SkillLibrary>,
    pub runtime: Arc<AgentRuntime>,
    pub scheduler: Arc<Scheduler>,
    pub meetings: Arc<Meetings>,
    pub transcriber: Arc<RemoteTranscriber>,
    pub tool_services: Arc<ToolServices>,
    chat_client: ChatClient,
}

impl Engine {
    /// Build the engine from configuration. Components are constructed in
    /// dependency order; cyclic edges (chat -> scheduler) are wired last
    /// through narrow interfaces.
    pub fn build(config: EngineConfig) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(&config.database_path())?);
        let verifier = Arc::new(JwtVerifier::new(config.auth.clone()));
        let tenancy = Arc::new(Tenancy::new(Arc::clone(&store)));
        let vault = Arc::new(Vault::new(config.vault.key_bytes()?));
        let router = Arc::new(ModelRouter::new(&config.models, None));

        let agents = Arc::new(Agents::new(Arc::clone(&store)));
        let tasks = Arc::new(Tasks::new(Arc::clone(&store)));
        let goals = Arc::new(Goals::new(Arc::clone(&store)));
        let measurable_goals = Arc::new(MeasurableGoals::new(Arc::clone(&store)));
        let chat = Arc::new(Chat::new(Arc::clone(&store)));
        let notifications = Arc::new(Notifications::new(Arc::clone(&store)));
        let credits = Arc::new(Credits::new(Arc::clone(&store)));
        let activity = Arc::new(ActivityLog::new(Arc::clone(&store)));
        let approvals = Arc::new(Approvals::new(Arc::clone(&store)));
        let workspace = Arc::new(Workspace::open(&config.workspace_root)?);
        let kb = Arc::new(KnowledgeBase::new(Arc::clone(&store)));
        let sor = Arc::new(SourceOfRecord::new(Arc::clone(&store)));
        let skills = Arc::new(SkillLibrary::load(Arc::clone(&store), &config.skills_dir));
        let transcriber = Arc::new(RemoteTranscriber::new(&config.transcription));

        let chat_client = ChatClient::new();
        let runtime = Arc::new(AgentRuntime::new(
            Arc::new(chat_client.clone()) as Arc<dyn ModelBackend>,
            Arc::clone(&credits),
            Arc::clone(&activity),
            Arc::clone(&approvals),
        ));

        let tool_services = Arc::new(ToolServices {
            tasks: Arc::clone(&tasks),
            chat: Arc::clone(&chat),
            notifications: Arc::clone(&notifications),
            workspace: Arc::clone(&workspace),
            kb: Arc::clone(&kb),
            sor: Arc::clone(&sor),
            approvals: Arc::clone(&approvals),
            skills: Arc::clone(&skills),
            embed_config: None,
        });

        let engine = Arc::new_cyclic(|weak: &std::sync::Weak<Engine>| {
            let runner: Arc<dyn HeartbeatRunner> = Arc::new(EngineHeartbeat {
                engine: weak.clone(),
            });
            let scheduler = Scheduler::new(
                Arc::clone(&store),
                Arc::clone(&agents),
                Arc::clone(&credits),
                Arc::clone(&activity),
                Arc::clone(&chat),
                Arc::clone(&router),
                runner,
                config.hosted,
            );
            let streams: Arc<dyn TurnStream> = Arc::new(EngineTurns {
                engine: weak.clone(),
            });
            let meetings = Arc::new(Meetings::new(streams));

            Engine {
                config,
                store,
                verifier,
                tenancy,
                vault,
                router,
                agents,
                tasks,
                goals,
                measurable_goals,
                chat: Arc::clone(&chat),
                notifications,
                credits,
                activity,
                approvals,
                workspace,
                kb,
                sor,
                skills,
                runtime,
                scheduler,
                meetings,
                transcriber,
                tool_services,
                chat_client,
            }
        });

        // Close the chat -> scheduler cycle through the narrow trigger.
        engine
            .chat
            .set_trigger(Arc::new(Arc::clone(&engine.scheduler)) as Arc<dyn ScheduleTrigger>);

        Ok(engine)
    }

    /// Register timers for every running agent. Called once at startup.
    pub fn start_scheduler(&self) -> Result<usize> {
        self.scheduler.start()
    }

    /// Cancel timers and outstanding work ahead of store shutdown.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        info!("Engine shut down");
    }

    /// The tenant's stored provider keys, decrypted for model resolution.
    pub fn tenant_provider_keys(&self, team_id: &Uuid) -> HashMap<String, String> {
        let creds = CredentialStore::new(&self.store, &self.vault);
        let mut keys = HashMap::new();
        for provider in PROVIDERS {
            if let Ok(key) = creds.get(team_id, provider.id) {
                keys.insert(provider.id.to_string(), key);
            }
        }
        keys
    }

    /// Resolve a logical model id for a tenant.
    pub fn resolve_model(&self, team_id: &Uuid, logical_id: &str) -> Result<ModelConfig> {
        let keys = self.tenant_provider_keys(team_id);
        self.router.resolve(logical_id, &keys)
    }

    /// The tenant's embedding configuration, if any provider is usable.
    pub fn embed_config(&self, team_id: &Uuid) -> Option<ModelConfig> {
        self.resolve_model(team_id, "embedding").ok()
    }

    /// Tool services with the tenant's embedding configuration attached.
    fn tool_services_for(&self, team_id: &Uuid) -> Arc<ToolServices> {
        Arc::new(ToolServices {
            tasks: Arc::clone(&self.tool_services.tasks),
            chat: Arc::clone(&self.tool_services.chat),
            notifications: Arc::clone(&self.tool_services.notifications),
            workspace: Arc::clone(&self.tool_services.workspace),
            kb: Arc::clone(&self.tool_services.kb),
            sor: Arc::clone(&self.tool_services.sor),
            approvals: Arc::clone(&self.tool_services.approvals),
            skills: Arc::clone(&self.tool_services.skills),
            embed_config: self.embed_config(team_id),
        })
    }

    /// Run one chat turn against an agent: persist the user message in the
    /// agent's DM channel, run the loop, persist and return the answer.
    pub async fn chat_with_agent(
        &self,
        ctx: &TeamContext,
        agent_id: &Uuid,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let agent = self.agents.get(&ctx.team_id, agent_id)?;
        let model_config = self.resolve_model(&ctx.team_id, &agent.model_id)?;

        let dm = self.chat.dm_channel(&ctx.team_id, agent_id)?;
        let posted = self.chat.post_message(
            &ctx.team_id,
            &dm.id,
            SenderKind::User,
            &ctx.user_id.to_string(),
            message,
        )?;
        self.chat.handle_mentions(&self.notifications, &posted);

        let services = self.tool_services_for(&ctx.team_id);
        let tools = agent_toolset(&services, ToolContext {
            team_id: ctx.team_id,
            agent_id: *agent_id,
        });
        let runtime_config = RuntimeConfig {
            skip_credits: self.agents.is_free_template(&agent),
            ..RuntimeConfig::default()
        };

        let outcome = self
            .runtime
            .run(
                &agent,
                &ctx.team_id,
                message,
                &model_config,
                &agent.system_prompt,
                &tools,
                runtime_config,
                cancel,
            )
            .await?;

        self.chat.post_message(
            &ctx.team_id,
            &dm.id,
            SenderKind::Agent,
            &agent_id.to_string(),
            &outcome.final_answer,
        )?;
        Ok(outcome.final_answer)
    }

    /// Create a document and run ingestion as a supervised background task.
    /// The document row records the terminal state either way.
    pub fn ingest_document(
        self: &Arc<Self>,
        ctx: &TeamContext,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<agentry_core::kb::Document> {
        let document = self.kb.create_document(&ctx.team_id, filename)?;
        let engine = Arc::clone(self);
        let team_id = ctx.team_id;
        let doc_id = document.id;

        tokio::spawn(async move {
            let embed = engine.embed_config(&team_id);
            let summary = engine.resolve_model(&team_id, "cheap").ok();
            let cancel = CancellationToken::new();
            match engine
                .kb
                .process(&team_id, &doc_id, &bytes, embed.as_ref(), summary.as_ref(), &cancel)
                .await
            {
                Ok(done) => {
                    let event_type = match done.status {
                        agentry_core::kb::DocStatus::Ready => event::DOCUMENT_INGESTED,
                        _ => event::DOCUMENT_FAILED,
                    };
                    let _ = engine
                        .activity
                        .record(&team_id, None, event_type, &done.filename);
                }
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "Ingestion task failed");
                }
            }
        });
        Ok(document)
    }

    /// Start a meet-and-greet meeting from agent ids.
    pub fn start_meeting(
        &self,
        ctx: &TeamContext,
        title: &str,
        agent_ids: &[Uuid],
        advisor_id: &Uuid,
        company_name: Option<String>,
    ) -> Result<Arc<agentry_core::Meeting>> {
        let advisor = self.meeting_agent(&ctx.team_id, advisor_id)?;
        let participants = agent_ids
            .iter()
            .filter(|id| *id != advisor_id)
            .map(|id| self.meeting_agent(&ctx.team_id, id))
            .collect::<Result<Vec<_>>>()?;

        self.meetings.start(MeetingSpec::meet_and_greet(
            ctx.team_id,
            title.to_string(),
            participants,
            advisor,
            company_name,
        ))
    }

    fn meeting_agent(&self, team_id: &Uuid, agent_id: &Uuid) -> Result<MeetingAgent> {
        let agent = self.agents.get(team_id, agent_id)?;
        Ok(MeetingAgent {
            id: agent.id,
            name: agent.name,
            system_prompt: agent.system_prompt,
        })
    }
}

/// Heartbeat seam: resolves the agent's model and tool set, then runs the
/// proactive loop with credits gated by the template.
struct EngineHeartbeat {
    engine: std::sync::Weak<Engine>,
}

#[async_trait]
impl HeartbeatRunner for EngineHeartbeat {
    async fn run_heartbeat(
        &self,
        agent: &Agent,
        team_id: &Uuid,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(agentry_core::EngineError::internal("engine shut down"));
        };
        let model_config = engine.resolve_model(team_id, &agent.model_id)?;
        let services = engine.tool_services_for(team_id);
        let tools = agent_toolset(&services, ToolContext {
            team_id: *team_id,
            agent_id: agent.id,
        });
        let runtime_config = RuntimeConfig {
            skip_credits: engine.agents.is_free_template(agent),
            ..RuntimeConfig::default()
        };

        let outcome = engine
            .runtime
            .run(
                agent,
                team_id,
                prompt,
                &model_config,
                &agent.system_prompt,
                &tools,
                runtime_config,
                cancel,
            )
            .await?;
        Ok(outcome.final_answer)
    }
}

/// Meeting turn seam: renders the transcript into a chat request and streams
/// the configured model.
struct EngineTurns {
    engine: std::sync::Weak<Engine>,
}

#[async_trait]
impl TurnStream for EngineTurns {
    async fn stream_turn(
        &self,
        spec: &MeetingSpec,
        agent: &MeetingAgent,
        transcript: &[TranscriptEntry],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamDelta>> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(agentry_core::EngineError::internal("engine shut down"));
        };
        let model_config = engine.resolve_model(&spec.team_id, "standard")?;
        let messages = render_turn_messages(spec, agent, transcript);
        engine
            .chat_client
            .stream_completion(&model_config, &messages, cancel)
            .await
            .map_err(agentry_core::EngineError::Model)
    }
}

/// Frame the meeting for one speaker: persona plus the transcript so far.
fn render_turn_messages(
    spec: &MeetingSpec,
    agent: &MeetingAgent,
    transcript: &[TranscriptEntry],
) -> Vec<ChatMessage> {
    let company = spec
        .company_name
        .as_deref()
        .map(|name| format!(" at {name}"))
        .unwrap_or_default();
    let mut messages = vec![ChatMessage::system(format!(
        "{}\n\nYou are speaking in a live \"{}\" meeting{company} titled \"{}\". \
         Keep your turn short and conversational; respond to what was said before you.",
        agent.system_prompt, spec.meeting_type, spec.title
    ))];

    if transcript.is_empty() {
        messages.push(ChatMessage::user(
            "The meeting is starting. Open it and set the frame.",
        ));
        return messages;
    }

    let rendered: Vec<String> = transcript
        .iter()
        .map(|entry| match &entry.speaker {
            agentry_core::meetings::Speaker::Agent { name, .. } => {
                format!("{name}: {}", entry.text)
            }
            agentry_core::meetings::Speaker::Human => format!("Human: {}", entry.text),
        })
        .collect();
    messages.push(ChatMessage::user(format!(
        "Transcript so far:\n{}\n\nIt is your turn, {}.",
        rendered.join("\n"),
        agent.name
    )));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Arc<Engine> {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().join("data"),
            workspace_root: dir.path().join("workspace"),
            skills_dir: dir.path().join("skills"),
            ..EngineConfig::default()
        };
        std::mem::forget(dir);
        Engine::build(config).unwrap()
    }

    #[tokio::test]
    async fn test_engine_builds_and_wires_trigger() {
        let engine = test_engine();
        // The scheduler trigger is wired: a mention wake against an unknown
        // agent is refused, not dropped for lack of wiring.
        let scheduler = Arc::clone(&engine.scheduler);
        assert!(
            scheduler
                .trigger_now(&Uuid::new_v4(), &Uuid::new_v4())
                .is_err()
        );
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_resolve_model_uses_tenant_keys() {
        let engine = test_engine();
        let user = Uuid::new_v4();
        let team = engine.tenancy.create_team("acme", &user).unwrap();

        // Without keys, "standard" falls to the key-less ollama candidate.
        let config = engine.resolve_model(&team.id, "standard").unwrap();
        assert_eq!(config.provider_id, "ollama");

        // A stored openai key switches the resolution.
        let creds = CredentialStore::new(&engine.store, &engine.vault);
        creds.put(&team.id, "openai", "api_key", "sk-test").unwrap();
        let config = engine.resolve_model(&team.id, "standard").unwrap();
        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        engine.shutdown();
    }

    #[test]
    fn test_render_turn_messages_opening_and_reply() {
        let advisor = MeetingAgent {
            id: Uuid::new_v4(),
            name: "Advisor".into(),
            system_prompt: "You are the advisor.".into(),
        };
        let spec = MeetingSpec::meet_and_greet(
            Uuid::new_v4(),
            "kickoff".into(),
            vec![],
            advisor.clone(),
            Some("Acme".into()),
        );

        let opening = render_turn_messages(&spec, &advisor, &[]);
        assert_eq!(opening.len(), 2);
        assert!(opening[0].content.contains("at Acme"));
        assert!(opening[1].content.contains("starting"));

        let transcript = vec![TranscriptEntry {
            speaker: agentry_core::meetings::Speaker::Agent {
                id: advisor.id,
                name: "Advisor".into(),
            },
            text: "Welcome everyone.".into(),
        }];
        let reply = render_turn_messages(&spec, &advisor, &transcript);
        assert!(reply[1].content.contains("Advisor: Welcome everyone."));
        assert!(reply[1].content.contains("your turn"));
    }
}
