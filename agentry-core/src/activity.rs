//! Activity log and approval queue.
//!
//! The activity log is an append-only audit of engine events. Approvals hold
//! high-risk actions in `pending` until a human resolves them; the state
//! machine is `pending -> approved | rejected`, both terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::types::RiskLevel;
use crate::vault::parse_store_time;

/// Well-known event types. Free-form strings are allowed; these are the ones
/// the engine itself emits.
pub mod event {
    pub const TOOL_EXECUTED: &str = "tool_executed";
    pub const HEARTBEAT_PROACTIVE: &str = "heartbeat_proactive";
    pub const HEARTBEAT_SKIPPED: &str = "heartbeat_skipped";
    pub const CREDITS_EXHAUSTED: &str = "credits_exhausted";
    pub const APPROVAL_REQUESTED: &str = "approval_requested";
    pub const APPROVAL_RESOLVED: &str = "approval_resolved";
    pub const DOCUMENT_INGESTED: &str = "document_ingested";
    pub const DOCUMENT_FAILED: &str = "document_failed";
}

/// One recorded activity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub team_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub event_type: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only activity log.
pub struct ActivityLog {
    store: Arc<Store>,
}

impl ActivityLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append one event. Never fails the caller's operation on logging
    /// problems beyond surfacing the store error.
    pub fn record(
        &self,
        team_id: &Uuid,
        agent_id: Option<&Uuid>,
        event_type: &str,
        detail: &str,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_log (team_id, agent_id, event_type, detail)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    team_id.to_string(),
                    agent_id.map(Uuid::to_string),
                    event_type,
                    detail
                ],
            )?;
            Ok(())
        })
    }

    /// Recent events for a team, newest first, optionally filtered by agent.
    pub fn recent(
        &self,
        team_id: &Uuid,
        agent_id: Option<&Uuid>,
        limit: usize,
    ) -> Result<Vec<ActivityEvent>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, agent_id, event_type, detail, created_at
                 FROM activity_log
                 WHERE team_id = ?1 AND (?2 IS NULL OR agent_id = ?2)
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![
                    team_id.to_string(),
                    agent_id.map(Uuid::to_string),
                    limit as i64
                ],
                |row| {
                    let agent: Option<String> = row.get(1)?;
                    let created: String = row.get(4)?;
                    Ok(ActivityEvent {
                        id: row.get(0)?,
                        team_id: *team_id,
                        agent_id: agent.and_then(|a| Uuid::parse_str(&a).ok()),
                        event_type: row.get(2)?,
                        detail: row.get(3)?,
                        created_at: parse_store_time(&created),
                    })
                },
            )?;
            rows.collect()
        })
    }
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A queued approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub team_id: Uuid,
    pub agent_id: Uuid,
    pub action_type: String,
    pub action_detail: String,
    pub risk_level: RiskLevel,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Approval queue operations.
pub struct Approvals {
    store: Arc<Store>,
}

impl Approvals {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open a new `pending` approval.
    pub fn open(
        &self,
        team_id: &Uuid,
        agent_id: &Uuid,
        action_type: &str,
        action_detail: &str,
        risk_level: RiskLevel,
    ) -> Result<Approval> {
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approvals (id, team_id, agent_id, action_type, action_detail, risk_level)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    agent_id.to_string(),
                    action_type,
                    action_detail,
                    risk_level.to_string()
                ],
            )?;
            Ok(())
        })?;
        info!(approval_id = %id, agent_id = %agent_id, action_type, %risk_level, "Approval opened");
        self.get(team_id, &id)
    }

    /// Fetch one approval, tenant-scoped.
    pub fn get(&self, team_id: &Uuid, id: &Uuid) -> Result<Approval> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_id, action_type, action_detail, risk_level, status, created_at, resolved_at
                 FROM approvals WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let agent: String = row.get(0)?;
                    let risk: String = row.get(3)?;
                    let status: String = row.get(4)?;
                    let created: String = row.get(5)?;
                    let resolved: Option<String> = row.get(6)?;
                    Ok(Approval {
                        id: *id,
                        team_id: *team_id,
                        agent_id: Uuid::parse_str(&agent).unwrap_or_default(),
                        action_type: row.get(1)?,
                        action_detail: row.get(2)?,
                        risk_level: risk.parse().unwrap_or(RiskLevel::High),
                        status: status.parse().unwrap_or(ApprovalStatus::Pending),
                        created_at: parse_store_time(&created),
                        resolved_at: resolved.as_deref().map(parse_store_time),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| EngineError::not_found("approval"))
    }

    /// Resolve a pending approval. Resolving a terminal approval is a
    /// conflict.
    pub fn resolve(&self, team_id: &Uuid, id: &Uuid, approve: bool) -> Result<Approval> {
        let next = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE approvals SET status = ?3, resolved_at = datetime('now')
                 WHERE id = ?1 AND team_id = ?2 AND status = 'pending'",
                rusqlite::params![id.to_string(), team_id.to_string(), next.to_string()],
            )
        })?;
        if updated == 0 {
            // Either unknown/foreign (NotFound) or already resolved (Conflict).
            let existing = self.get(team_id, id)?;
            return Err(EngineError::Conflict {
                message: format!("approval already {}", existing.status),
            });
        }
        info!(approval_id = %id, approved = approve, "Approval resolved");
        self.get(team_id, id)
    }

    /// List approvals for a team, optionally by status, newest first.
    pub fn list(&self, team_id: &Uuid, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM approvals
                 WHERE team_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![team_id.to_string(), status.map(|s| s.to_string())],
                |row| row.get(0),
            )?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get(team_id, &id))
            .collect()
    }

    /// The most recent approval matching this exact action, if any. The
    /// runtime uses this to decide between executing (approved), waiting
    /// (pending), refusing (rejected), and opening a fresh request (none).
    pub fn latest_for_action(
        &self,
        agent_id: &Uuid,
        action_type: &str,
        action_detail: &str,
    ) -> Result<Option<Approval>> {
        let found: Option<(String, String)> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, team_id FROM approvals
                 WHERE agent_id = ?1 AND action_type = ?2 AND action_detail = ?3
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                rusqlite::params![agent_id.to_string(), action_type, action_detail],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        match found {
            Some((id, team)) => {
                let id = Uuid::parse_str(&id).map_err(|_| EngineError::internal("corrupt id"))?;
                let team =
                    Uuid::parse_str(&team).map_err(|_| EngineError::internal("corrupt id"))?;
                Ok(Some(self.get(&team, &id)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ActivityLog, Approvals, Uuid, Uuid) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();
        let agent = Uuid::new_v4();
        (
            ActivityLog::new(Arc::clone(&store)),
            Approvals::new(store),
            team,
            agent,
        )
    }

    #[test]
    fn test_activity_record_and_recent() {
        let (log, _, team, agent) = setup();
        log.record(&team, Some(&agent), event::TOOL_EXECUTED, "write_file")
            .unwrap();
        log.record(&team, None, event::DOCUMENT_INGESTED, "report.pdf")
            .unwrap();

        let all = log.recent(&team, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, event::DOCUMENT_INGESTED);

        let for_agent = log.recent(&team, Some(&agent), 10).unwrap();
        assert_eq!(for_agent.len(), 1);
        assert_eq!(for_agent[0].detail, "write_file");
    }

    #[test]
    fn test_activity_tenant_filtered() {
        let (log, _, team, _) = setup();
        log.record(&team, None, "x", "y").unwrap();
        let other = log.recent(&Uuid::new_v4(), None, 10).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_approval_lifecycle() {
        let (_, approvals, team, agent) = setup();
        let approval = approvals
            .open(&team, &agent, "send_external_email", "{\"to\":\"x\"}", RiskLevel::High)
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert!(approval.resolved_at.is_none());

        let resolved = approvals.resolve(&team, &approval.id, true).unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(resolved.resolved_at.is_some());
    }

    #[test]
    fn test_approval_terminal_states_are_final() {
        let (_, approvals, team, agent) = setup();
        let approval = approvals
            .open(&team, &agent, "delete_table", "{}", RiskLevel::Critical)
            .unwrap();
        approvals.resolve(&team, &approval.id, false).unwrap();

        // Re-resolving in either direction conflicts.
        assert!(approvals.resolve(&team, &approval.id, true).is_err());
        assert!(approvals.resolve(&team, &approval.id, false).is_err());
    }

    #[test]
    fn test_approval_cross_tenant_not_found() {
        let (_, approvals, team, agent) = setup();
        let approval = approvals
            .open(&team, &agent, "x", "{}", RiskLevel::Medium)
            .unwrap();
        let err = approvals.get(&Uuid::new_v4(), &approval.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_latest_for_action_tracks_resubmission() {
        let (_, approvals, team, agent) = setup();
        assert!(
            approvals
                .latest_for_action(&agent, "send", "{}")
                .unwrap()
                .is_none()
        );

        let first = approvals
            .open(&team, &agent, "send", "{}", RiskLevel::High)
            .unwrap();
        let latest = approvals
            .latest_for_action(&agent, "send", "{}")
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, first.id);
        assert_eq!(latest.status, ApprovalStatus::Pending);

        approvals.resolve(&team, &first.id, false).unwrap();
        let latest = approvals
            .latest_for_action(&agent, "send", "{}")
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, ApprovalStatus::Rejected);

        // A different action detail is a different decision.
        assert!(
            approvals
                .latest_for_action(&agent, "send", "{\"to\":\"b\"}")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_list_filter_by_status() {
        let (_, approvals, team, agent) = setup();
        let a = approvals
            .open(&team, &agent, "a", "{}", RiskLevel::Low)
            .unwrap();
        approvals
            .open(&team, &agent, "b", "{}", RiskLevel::Low)
            .unwrap();
        approvals.resolve(&team, &a.id, true).unwrap();

        let pending = approvals
            .list(&team, Some(ApprovalStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, "b");

        let all = approvals.list(&team, None).unwrap();
        assert_eq!(all.len(), 2);
    }
}
