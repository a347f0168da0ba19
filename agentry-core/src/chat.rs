//! Chat channels, messages, and mention processing.
//!
//! DM and task-thread channels are singletons per `(tenant, target)` and are
//! created lazily on first access; group channels are the only deletable
//! kind. Message ids are monotonic and pagination cursors on them. Mention
//! processing runs off the send path: agents get woken through the narrow
//! [`ScheduleTrigger`] interface, users get a `mention` notification, file
//! mentions are display-only.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::vault::parse_store_time;

/// The scheduler surface chat needs. Chat is constructed before the
/// scheduler, which registers itself here once built.
pub trait ScheduleTrigger: Send + Sync {
    /// Fire one heartbeat immediately. Refuses cross-tenant and non-running
    /// targets.
    fn trigger_now(&self, agent_id: &Uuid, team_id: &Uuid) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Dm,
    Group,
    TaskThread,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelType::Dm => "dm",
            ChannelType::Group => "group",
            ChannelType::TaskThread => "task_thread",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dm" => Ok(ChannelType::Dm),
            "group" => Ok(ChannelType::Group),
            "task_thread" => Ok(ChannelType::TaskThread),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
    System,
}

impl std::fmt::Display for SenderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SenderKind::User => "user",
            SenderKind::Agent => "agent",
            SenderKind::System => "system",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRow {
    pub id: i64,
    pub channel_id: Uuid,
    pub team_id: Uuid,
    pub sender_kind: SenderKind,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MentionKind {
    Agent,
    User,
    File,
}

/// One parsed mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub display: String,
    pub kind: MentionKind,
    pub target: Uuid,
}

/// Extract mentions of the form `@[display](kind:uuid)`. Duplicate
/// `(kind, target)` pairs are collapsed so each fires once.
pub fn parse_mentions(text: &str) -> Vec<Mention> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"@\[([^\]]+)\]\((agent|user|file):([0-9a-fA-F-]{36})\)")
            .expect("mention pattern is valid")
    });

    let mut seen = std::collections::HashSet::new();
    let mut mentions = Vec::new();
    for caps in re.captures_iter(text) {
        let kind = match &caps[2] {
            "agent" => MentionKind::Agent,
            "user" => MentionKind::User,
            _ => MentionKind::File,
        };
        let Ok(target) = Uuid::parse_str(&caps[3]) else {
            continue;
        };
        if seen.insert((kind, target)) {
            mentions.push(Mention {
                display: caps[1].to_string(),
                kind,
                target,
            });
        }
    }
    mentions
}

/// Chat operations over the store.
pub struct Chat {
    store: Arc<Store>,
    trigger: OnceLock<Arc<dyn ScheduleTrigger>>,
}

impl Chat {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            trigger: OnceLock::new(),
        }
    }

    /// Wire the scheduler in after construction. Later calls are ignored.
    pub fn set_trigger(&self, trigger: Arc<dyn ScheduleTrigger>) {
        let _ = self.trigger.set(trigger);
    }

    /// The singleton DM channel with an agent, created on first access.
    pub fn dm_channel(&self, team_id: &Uuid, agent_id: &Uuid) -> Result<Channel> {
        self.singleton_channel(team_id, &format!("dm:{agent_id}"), ChannelType::Dm)
    }

    /// The singleton discussion thread of a task, created on first access.
    pub fn task_thread(&self, team_id: &Uuid, task_id: &Uuid) -> Result<Channel> {
        self.singleton_channel(team_id, &format!("task:{task_id}"), ChannelType::TaskThread)
    }

    fn singleton_channel(
        &self,
        team_id: &Uuid,
        name: &str,
        channel_type: ChannelType,
    ) -> Result<Channel> {
        if let Some(existing) = self.channel_by_name(team_id, name)? {
            return Ok(existing);
        }
        let id = Uuid::new_v4();
        // Another worker may have created it between the lookup and the
        // insert; the unique index makes the insert a no-op in that case.
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_channels (id, team_id, name, channel_type)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (team_id, name) DO NOTHING",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    name,
                    channel_type.to_string()
                ],
            )?;
            Ok(())
        })?;
        self.channel_by_name(team_id, name)?
            .ok_or_else(|| EngineError::internal("channel vanished after upsert"))
    }

    pub fn create_group(&self, team_id: &Uuid, name: &str) -> Result<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("channel name must not be empty"));
        }
        if name.starts_with("dm:") || name.starts_with("task:") {
            return Err(EngineError::invalid("reserved channel name prefix"));
        }
        if self.channel_by_name(team_id, name)?.is_some() {
            return Err(EngineError::Conflict {
                message: format!("channel '{name}' already exists"),
            });
        }
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_channels (id, team_id, name, channel_type)
                 VALUES (?1, ?2, ?3, 'group')",
                rusqlite::params![id.to_string(), team_id.to_string(), name],
            )?;
            Ok(())
        })?;
        self.get_channel(team_id, &id)
    }

    /// Delete a channel. Singleton DM / task-thread channels are permanent.
    pub fn delete_channel(&self, team_id: &Uuid, id: &Uuid) -> Result<()> {
        let channel = self.get_channel(team_id, id)?;
        if channel.channel_type != ChannelType::Group {
            return Err(EngineError::invalid("only group channels can be deleted"));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chat_channels WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_channel(&self, team_id: &Uuid, id: &Uuid) -> Result<Channel> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT name, channel_type, created_at FROM chat_channels
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let channel_type: String = row.get(1)?;
                    let created: String = row.get(2)?;
                    Ok(Channel {
                        id: *id,
                        team_id: *team_id,
                        name: row.get(0)?,
                        channel_type: channel_type.parse().unwrap_or(ChannelType::Group),
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
        found.ok_or_else(|| EngineError::not_found("channel"))
    }

    fn channel_by_name(&self, team_id: &Uuid, name: &str) -> Result<Option<Channel>> {
        let id: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM chat_channels WHERE team_id = ?1 AND name = ?2",
                rusqlite::params![team_id.to_string(), name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => Ok(Some(self.get_channel(team_id, &id)?)),
            None => Ok(None),
        }
    }

    pub fn list_channels(&self, team_id: &Uuid) -> Result<Vec<Channel>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM chat_channels WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get_channel(team_id, &id))
            .collect()
    }

    /// Append a message to a channel.
    pub fn post_message(
        &self,
        team_id: &Uuid,
        channel_id: &Uuid,
        sender_kind: SenderKind,
        sender_id: &str,
        content: &str,
    ) -> Result<ChatMessageRow> {
        // Ownership re-check: the channel must belong to the caller's team.
        self.get_channel(team_id, channel_id)?;
        let id: i64 = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (channel_id, team_id, sender_kind, sender_id, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    channel_id.to_string(),
                    team_id.to_string(),
                    sender_kind.to_string(),
                    sender_id,
                    content
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(ChatMessageRow {
            id,
            channel_id: *channel_id,
            team_id: *team_id,
            sender_kind,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Process the mentions in a freshly posted message. Runs off the send
    /// path; failures are logged, recorded where observable (notification
    /// rows), and never propagate to the sender.
    pub fn handle_mentions(&self, notifications: &Notifications, message: &ChatMessageRow) {
        for mention in parse_mentions(&message.content) {
            match mention.kind {
                MentionKind::Agent => {
                    let Some(trigger) = self.trigger.get() else {
                        debug!("Mention trigger not wired yet; skipping agent wake");
                        continue;
                    };
                    if let Err(e) = trigger.trigger_now(&mention.target, &message.team_id) {
                        debug!(agent_id = %mention.target, error = %e, "Mention wake refused");
                    }
                }
                MentionKind::User => {
                    let result = notifications.create(
                        &mention.target,
                        &message.team_id,
                        "mention",
                        &format!("You were mentioned by {}", message.sender_id),
                        Some(&message.channel_id),
                    );
                    if let Err(e) = result {
                        warn!(user_id = %mention.target, error = %e, "Mention notification failed");
                    }
                }
                MentionKind::File => {} // display-only
            }
        }
    }

    /// Page backwards through a channel: messages with `id < before`,
    /// newest-first internally, returned oldest-first for display.
    pub fn messages(
        &self,
        team_id: &Uuid,
        channel_id: &Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessageRow>> {
        self.get_channel(team_id, channel_id)?;
        let mut rows: Vec<ChatMessageRow> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, sender_kind, sender_id, content, created_at
                 FROM chat_messages
                 WHERE channel_id = ?1 AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(
                rusqlite::params![channel_id.to_string(), before, limit as i64],
                |row| {
                    let kind: String = row.get(1)?;
                    let created: String = row.get(4)?;
                    Ok(ChatMessageRow {
                        id: row.get(0)?,
                        channel_id: *channel_id,
                        team_id: *team_id,
                        sender_kind: match kind.as_str() {
                            "agent" => SenderKind::Agent,
                            "system" => SenderKind::System,
                            _ => SenderKind::User,
                        },
                        sender_id: row.get(2)?,
                        content: row.get(3)?,
                        created_at: parse_store_time(&created),
                    })
                },
            )?;
            mapped.collect()
        })?;
        rows.reverse();
        Ok(rows)
    }
}

/// A user notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub kind: String,
    pub body: String,
    pub channel_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Notification storage. Listed per user across tenants, so it is exempt
/// from team binding.
pub struct Notifications {
    store: Arc<Store>,
}

impl Notifications {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        user_id: &Uuid,
        team_id: &Uuid,
        kind: &str,
        body: &str,
        channel_id: Option<&Uuid>,
    ) -> Result<Notification> {
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, team_id, kind, body, channel_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    user_id.to_string(),
                    team_id.to_string(),
                    kind,
                    body,
                    channel_id.map(Uuid::to_string)
                ],
            )?;
            Ok(())
        })?;
        Ok(Notification {
            id,
            user_id: *user_id,
            team_id: *team_id,
            kind: kind.to_string(),
            body: body.to_string(),
            channel_id: channel_id.copied(),
            read: false,
            created_at: Utc::now(),
        })
    }

    /// Notifications for one user, newest first.
    pub fn list(&self, user_id: &Uuid, unread_only: bool) -> Result<Vec<Notification>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, team_id, kind, body, channel_id, read, created_at
                 FROM notifications
                 WHERE user_id = ?1 AND (?2 = 0 OR read = 0)
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id.to_string(), unread_only as i64],
                |row| {
                    let id: String = row.get(0)?;
                    let team: String = row.get(1)?;
                    let channel: Option<String> = row.get(4)?;
                    let created: String = row.get(6)?;
                    Ok(Notification {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        user_id: *user_id,
                        team_id: Uuid::parse_str(&team).unwrap_or_default(),
                        kind: row.get(2)?,
                        body: row.get(3)?,
                        channel_id: channel.and_then(|c| Uuid::parse_str(&c).ok()),
                        read: row.get::<_, i64>(5)? != 0,
                        created_at: parse_store_time(&created),
                    })
                },
            )?;
            rows.collect()
        })
    }

    pub fn mark_read(&self, user_id: &Uuid, id: &Uuid) -> Result<()> {
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id.to_string(), user_id.to_string()],
            )
        })?;
        if updated == 0 {
            return Err(EngineError::not_found("notification"));
        }
        Ok(())
    }
}
