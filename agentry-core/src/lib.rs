//! # Agentry Core
//!
//! Core engine for the Agentry orchestration service: tenancy and identity,
//! the agent runtime loop, the heartbeat scheduler, chat and mentions, the
//! knowledge base, the credential vault, source-of-record tables, and the
//! real-time meeting orchestrator.

pub mod activity;
pub mod agents;
pub mod chat;
pub mod config;
pub mod credits;
pub mod error;
pub mod identity;
pub mod kb;
pub mod meetings;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod skills;
pub mod sor;
pub mod store;
pub mod stt;
pub mod tasks;
pub mod tenancy;
pub mod types;
pub mod vault;
pub mod workspace;

// Re-export commonly used types at the crate root.
pub use activity::{ActivityLog, Approval, ApprovalStatus, Approvals};
pub use agents::{Agent, AgentStatus, Agents};
pub use chat::{Chat, Notifications, ScheduleTrigger};
pub use config::EngineConfig;
pub use credits::Credits;
pub use error::{EngineError, ErrorKind, Result};
pub use identity::JwtVerifier;
pub use kb::KnowledgeBase;
pub use meetings::{Meeting, MeetingEvent, Meetings};
pub use models::{ChatClient, EmbeddingClient, ModelConfig, ModelRouter};
pub use runtime::{AgentRuntime, RuntimeConfig, RuntimeTool, ToolSet};
pub use scheduler::Scheduler;
pub use skills::SkillLibrary;
pub use sor::SourceOfRecord;
pub use store::Store;
pub use tasks::{Goals, MeasurableGoals, Tasks};
pub use tenancy::{Role, TeamContext, Tenancy};
pub use types::Identity;
pub use vault::{CredentialStore, Vault};
pub use workspace::Workspace;
