//! Agent records — configuration, lifecycle, and templates.
//!
//! An agent is a configured persona bound to one tenant: a model id, a
//! system prompt, a heartbeat period with active hours, and optional skills.
//! `running` agents are scheduled; `stopped` agents have no timer. Deletion
//! is restricted to team admins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::tenancy::{Role, TeamContext};
use crate::vault::parse_store_time;

pub const HEARTBEAT_MIN_SECS: u32 = 60;
pub const HEARTBEAT_MAX_SECS: u32 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Stopped => "stopped",
            AgentStatus::Running => "running",
            AgentStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(AgentStatus::Stopped),
            "running" => Ok(AgentStatus::Running),
            "error" => Ok(AgentStatus::Error),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub department: Option<String>,
    /// Logical model id resolved by the model router.
    pub model_id: String,
    pub fallback_endpoint: Option<String>,
    pub fallback_model: Option<String>,
    pub system_prompt: String,
    pub proactive: bool,
    pub heartbeat_seconds: u32,
    pub active_hours_start: u8,
    pub active_hours_end: u8,
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Whether the current hour falls inside `[start, end)`. `start == end`
    /// means always active; `start > end` wraps midnight.
    pub fn is_active_at_hour(&self, hour: u8) -> bool {
        let (start, end) = (self.active_hours_start, self.active_hours_end);
        if start == end {
            return true;
        }
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

/// A built-in agent template.
#[derive(Debug, Clone, Serialize)]
pub struct AgentTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub system_prompt: &'static str,
    pub model_id: &'static str,
    /// Free-template agents run with credit accounting disabled.
    pub free: bool,
}

/// The built-in template catalog.
pub const TEMPLATES: &[AgentTemplate] = &[
    AgentTemplate {
        id: "assistant",
        name: "General Assistant",
        system_prompt: "You are a helpful team assistant. Use the task board and chat to coordinate with your team, and keep your answers short and concrete.",
        model_id: "standard",
        free: true,
    },
    AgentTemplate {
        id: "researcher",
        name: "Researcher",
        system_prompt: "You are a research agent. Search the knowledge base before answering, cite the documents you used, and store durable findings as memories.",
        model_id: "standard",
        free: false,
    },
    AgentTemplate {
        id: "project-manager",
        name: "Project Manager",
        system_prompt: "You are a project manager. Keep the task board healthy: triage new work, chase blocked tasks, and post a short status to the team channel when things change.",
        model_id: "fast",
        free: false,
    },
];

/// Look up a template by id.
pub fn template(id: &str) -> Option<&'static AgentTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Fields accepted when creating an agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub proactive: bool,
    #[serde(default)]
    pub heartbeat_seconds: Option<u32>,
    #[serde(default)]
    pub active_hours_start: Option<u8>,
    #[serde(default)]
    pub active_hours_end: Option<u8>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub department: Option<Option<String>>,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub proactive: Option<bool>,
    pub heartbeat_seconds: Option<u32>,
    pub active_hours_start: Option<u8>,
    pub active_hours_end: Option<u8>,
}

/// Agent storage operations.
pub struct Agents {
    store: Arc<Store>,
}

impl Agents {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, team_id: &Uuid, new: NewAgent) -> Result<Agent> {
        if new.name.trim().is_empty() {
            return Err(EngineError::invalid("agent name must not be empty"));
        }
        let tpl = new.template_id.as_deref().and_then(template);
        if new.template_id.is_some() && tpl.is_none() {
            return Err(EngineError::invalid("unknown agent template"));
        }

        let heartbeat = new.heartbeat_seconds.unwrap_or(3600);
        validate_heartbeat(heartbeat)?;
        let start = new.active_hours_start.unwrap_or(0);
        let end = new.active_hours_end.unwrap_or(0);
        validate_hour(start)?;
        validate_hour(end)?;

        let model_id = new
            .model_id
            .or_else(|| tpl.map(|t| t.model_id.to_string()))
            .unwrap_or_else(|| "standard".into());
        let system_prompt = new
            .system_prompt
            .or_else(|| tpl.map(|t| t.system_prompt.to_string()))
            .unwrap_or_default();

        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (id, team_id, name, department, model_id, fallback_endpoint,
                                     fallback_model, system_prompt, proactive, heartbeat_seconds,
                                     active_hours_start, active_hours_end, template_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    new.name.trim(),
                    new.department,
                    model_id,
                    new.fallback_endpoint,
                    new.fallback_model,
                    system_prompt,
                    new.proactive as i64,
                    heartbeat,
                    start,
                    end,
                    new.template_id,
                ],
            )?;
            Ok(())
        })?;
        info!(agent_id = %id, team_id = %team_id, "Agent created");
        self.get(team_id, &id)
    }

    pub fn get(&self, team_id: &Uuid, id: &Uuid) -> Result<Agent> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT name, status, department, model_id, fallback_endpoint, fallback_model,
                        system_prompt, proactive, heartbeat_seconds, active_hours_start,
                        active_hours_end, template_id, created_at
                 FROM agents WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let status: String = row.get(1)?;
                    let created: String = row.get(12)?;
                    Ok(Agent {
                        id: *id,
                        team_id: *team_id,
                        name: row.get(0)?,
                        status: status.parse().unwrap_or(AgentStatus::Stopped),
                        department: row.get(2)?,
                        model_id: row.get(3)?,
                        fallback_endpoint: row.get(4)?,
                        fallback_model: row.get(5)?,
                        system_prompt: row.get(6)?,
                        proactive: row.get::<_, i64>(7)? != 0,
                        heartbeat_seconds: row.get::<_, i64>(8)? as u32,
                        active_hours_start: row.get::<_, i64>(9)? as u8,
                        active_hours_end: row.get::<_, i64>(10)? as u8,
                        template_id: row.get(11)?,
                        created_at: parse_store_time(&created),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| EngineError::not_found("agent"))
    }

    pub fn list(&self, team_id: &Uuid) -> Result<Vec<Agent>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM agents WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get(team_id, &id))
            .collect()
    }

    /// All `running` agents across tenants. Used by the scheduler at start.
    pub fn list_running(&self) -> Result<Vec<Agent>> {
        let pairs: Vec<(String, String)> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, team_id FROM agents WHERE status = 'running' ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        pairs
            .iter()
            .filter_map(|(id, team)| {
                Some((Uuid::parse_str(id).ok()?, Uuid::parse_str(team).ok()?))
            })
            .map(|(id, team)| self.get(&team, &id))
            .collect()
    }

    pub fn update(&self, team_id: &Uuid, id: &Uuid, patch: AgentPatch) -> Result<Agent> {
        let current = self.get(team_id, id)?;

        let heartbeat = patch.heartbeat_seconds.unwrap_or(current.heartbeat_seconds);
        validate_heartbeat(heartbeat)?;
        let start = patch.active_hours_start.unwrap_or(current.active_hours_start);
        let end = patch.active_hours_end.unwrap_or(current.active_hours_end);
        validate_hour(start)?;
        validate_hour(end)?;

        let name = patch.name.unwrap_or(current.name);
        if name.trim().is_empty() {
            return Err(EngineError::invalid("agent name must not be empty"));
        }

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET name = ?3, department = ?4, model_id = ?5, system_prompt = ?6,
                        proactive = ?7, heartbeat_seconds = ?8, active_hours_start = ?9,
                        active_hours_end = ?10, updated_at = datetime('now')
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    name.trim(),
                    patch.department.unwrap_or(current.department),
                    patch.model_id.unwrap_or(current.model_id),
                    patch.system_prompt.unwrap_or(current.system_prompt),
                    patch.proactive.unwrap_or(current.proactive) as i64,
                    heartbeat,
                    start,
                    end,
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, id)
    }

    /// Delete an agent. Admin only.
    pub fn delete(&self, ctx: &TeamContext, id: &Uuid) -> Result<()> {
        ctx.require_role(Role::Admin)?;
        let deleted = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM agents WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), ctx.team_id.to_string()],
            )
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("agent"));
        }
        info!(agent_id = %id, "Agent deleted");
        Ok(())
    }

    pub fn set_status(&self, team_id: &Uuid, id: &Uuid, status: AgentStatus) -> Result<Agent> {
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET status = ?3, updated_at = datetime('now')
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string(), status.to_string()],
            )
        })?;
        if updated == 0 {
            return Err(EngineError::not_found("agent"));
        }
        self.get(team_id, id)
    }

    /// Whether the agent was created from a free template. Free-template
    /// agents run the loop with credit accounting disabled.
    pub fn is_free_template(&self, agent: &Agent) -> bool {
        agent
            .template_id
            .as_deref()
            .and_then(template)
            .map(|t| t.free)
            .unwrap_or(false)
    }
}

fn validate_heartbeat(secs: u32) -> Result<()> {
    if !(HEARTBEAT_MIN_SECS..=HEARTBEAT_MAX_SECS).contains(&secs) {
        return Err(EngineError::invalid(format!(
            "heartbeat_seconds must be between {HEARTBEAT_MIN_SECS} and {HEARTBEAT_MAX_SECS}"
        )));
    }
    Ok(())
}

fn validate_hour(hour: u8) -> Result<()> {
    if hour > 23 {
        return Err(EngineError::invalid("active hours must be between 0 and 23"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::Tenancy;

    fn setup() -> (Agents, Tenancy, Uuid, Uuid) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tenancy = Tenancy::new(Arc::clone(&store));
        let user = Uuid::new_v4();
        let team = tenancy.create_team("acme", &user).unwrap();
        (Agents::new(store), tenancy, team.id, user)
    }

    #[test]
    fn test_create_with_defaults() {
        let (agents, _, team, _) = setup();
        let agent = agents
            .create(&team, NewAgent {
                name: "scout".into(),
                ..NewAgent::default()
            })
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert_eq!(agent.model_id, "standard");
        assert_eq!(agent.heartbeat_seconds, 3600);
        assert!(!agent.proactive);
    }

    #[test]
    fn test_create_from_template() {
        let (agents, _, team, _) = setup();
        let agent = agents
            .create(&team, NewAgent {
                name: "pm".into(),
                template_id: Some("project-manager".into()),
                ..NewAgent::default()
            })
            .unwrap();
        assert_eq!(agent.model_id, "fast");
        assert!(agent.system_prompt.contains("project manager"));
        assert!(!agents.is_free_template(&agent));

        let free = agents
            .create(&team, NewAgent {
                name: "helper".into(),
                template_id: Some("assistant".into()),
                ..NewAgent::default()
            })
            .unwrap();
        assert!(agents.is_free_template(&free));
    }

    #[test]
    fn test_unknown_template_rejected() {
        let (agents, _, team, _) = setup();
        assert!(
            agents
                .create(&team, NewAgent {
                    name: "x".into(),
                    template_id: Some("nonexistent".into()),
                    ..NewAgent::default()
                })
                .is_err()
        );
    }

    #[test]
    fn test_heartbeat_bounds() {
        let (agents, _, team, _) = setup();
        for bad in [0u32, 59, 86_401] {
            assert!(
                agents
                    .create(&team, NewAgent {
                        name: "x".into(),
                        heartbeat_seconds: Some(bad),
                        ..NewAgent::default()
                    })
                    .is_err(),
                "accepted heartbeat {bad}"
            );
        }
        assert!(
            agents
                .create(&team, NewAgent {
                    name: "x".into(),
                    heartbeat_seconds: Some(60),
                    ..NewAgent::default()
                })
                .is_ok()
        );
    }

    #[test]
    fn test_active_hours_window() {
        let (agents, _, team, _) = setup();
        let mut agent = agents
            .create(&team, NewAgent {
                name: "x".into(),
                active_hours_start: Some(9),
                active_hours_end: Some(17),
                ..NewAgent::default()
            })
            .unwrap();
        assert!(agent.is_active_at_hour(9));
        assert!(agent.is_active_at_hour(16));
        assert!(!agent.is_active_at_hour(17));
        assert!(!agent.is_active_at_hour(3));

        // Wrapping window: 22 -> 6.
        agent.active_hours_start = 22;
        agent.active_hours_end = 6;
        assert!(agent.is_active_at_hour(23));
        assert!(agent.is_active_at_hour(3));
        assert!(!agent.is_active_at_hour(12));

        // Equal bounds: always active.
        agent.active_hours_start = 0;
        agent.active_hours_end = 0;
        for hour in 0..24 {
            assert!(agent.is_active_at_hour(hour));
        }
    }

    #[test]
    fn test_lifecycle_and_list_running() {
        let (agents, _, team, _) = setup();
        let a = agents
            .create(&team, NewAgent {
                name: "a".into(),
                ..NewAgent::default()
            })
            .unwrap();
        agents
            .create(&team, NewAgent {
                name: "b".into(),
                ..NewAgent::default()
            })
            .unwrap();

        agents.set_status(&team, &a.id, AgentStatus::Running).unwrap();
        let running = agents.list_running().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[test]
    fn test_delete_requires_admin() {
        let (agents, tenancy, team, admin_user) = setup();
        let member = Uuid::new_v4();
        let admin_ctx = tenancy.bind(&admin_user, &team).unwrap();
        tenancy
            .upsert_member(&admin_ctx, &member, crate::tenancy::Role::Member)
            .unwrap();
        let member_ctx = tenancy.bind(&member, &team).unwrap();

        let agent = agents
            .create(&team, NewAgent {
                name: "x".into(),
                ..NewAgent::default()
            })
            .unwrap();

        let err = agents.delete(&member_ctx, &agent.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
        assert!(agents.delete(&admin_ctx, &agent.id).is_ok());
    }

    #[test]
    fn test_cross_tenant_agent_not_found() {
        let (agents, _, team, _) = setup();
        let agent = agents
            .create(&team, NewAgent {
                name: "x".into(),
                ..NewAgent::default()
            })
            .unwrap();
        let err = agents.get(&Uuid::new_v4(), &agent.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
