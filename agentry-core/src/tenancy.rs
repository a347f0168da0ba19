//! Tenant (team) management — membership, roles, context binding, and
//! ownership verification.
//!
//! Every domain operation runs against a [`TeamContext`] bound from the
//! caller's identity and the requested team. Ownership failures surface as
//! `NotFound`, never `Forbidden`, so existence does not leak across tenants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AuthError, EngineError, Result};
use crate::store::Store;
use crate::vault::parse_store_time;

/// Membership role, ordered `viewer < member < admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer = 0,
    Member = 1,
    Admin = 2,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Member => write!(f, "member"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A tenant workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A membership row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMembership {
    pub team: Team,
    pub role: Role,
}

/// Billing subscription attached to a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub plan: String,
    pub active: bool,
    pub renews_at: Option<DateTime<Utc>>,
}

/// The resolved caller context for one request: identity, team, role, and
/// the team's subscription when present.
#[derive(Debug, Clone)]
pub struct TeamContext {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub subscription: Option<Subscription>,
}

impl TeamContext {
    /// Check the caller holds at least `threshold`.
    pub fn require_role(&self, threshold: Role) -> Result<()> {
        if self.role >= threshold {
            Ok(())
        } else {
            Err(EngineError::Auth(AuthError::RoleRequired {
                required: threshold.to_string(),
            }))
        }
    }
}

/// Team-management operations over the store.
pub struct Tenancy {
    store: Arc<Store>,
}

impl Tenancy {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a team with `creator` as its first admin.
    pub fn create_team(&self, name: &str, creator: &Uuid) -> Result<Team> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("team name must not be empty"));
        }
        let id = Uuid::new_v4();
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO teams (id, name) VALUES (?1, ?2)",
                rusqlite::params![id.to_string(), name],
            )?;
            tx.execute(
                "INSERT INTO team_members (team_id, user_id, role) VALUES (?1, ?2, 'admin')",
                rusqlite::params![id.to_string(), creator.to_string()],
            )?;
            Ok(())
        })?;
        info!(team_id = %id, "Team created");
        Ok(Team {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
        })
    }

    /// All teams the user belongs to, with their role in each.
    pub fn list_teams(&self, user_id: &Uuid) -> Result<Vec<TeamMembership>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT t.id, t.name, t.created_at, m.role
                 FROM teams t JOIN team_members m ON m.team_id = t.id
                 WHERE m.user_id = ?1 ORDER BY t.created_at",
            )?;
            let rows = stmt.query_map([user_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let created: String = row.get(2)?;
                let role: String = row.get(3)?;
                Ok(TeamMembership {
                    team: Team {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        name: row.get(1)?,
                        created_at: parse_store_time(&created),
                    },
                    role: role.parse().unwrap_or(Role::Viewer),
                })
            })?;
            rows.collect()
        })
    }

    /// Delete a team. Admin only.
    pub fn delete_team(&self, ctx: &TeamContext) -> Result<()> {
        ctx.require_role(Role::Admin)?;
        let deleted = self.store.with_conn(|conn| {
            conn.execute("DELETE FROM teams WHERE id = ?1", [ctx.team_id.to_string()])
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("team"));
        }
        info!(team_id = %ctx.team_id, "Team deleted");
        Ok(())
    }

    /// Add or update a member. Admin only.
    pub fn upsert_member(&self, ctx: &TeamContext, user_id: &Uuid, role: Role) -> Result<()> {
        ctx.require_role(Role::Admin)?;
        // Demoting the last admin would leave the team ungoverned.
        if role < Role::Admin && self.is_last_admin(&ctx.team_id, user_id)? {
            return Err(EngineError::invalid("a team must keep at least one admin"));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_members (team_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT (team_id, user_id) DO UPDATE SET role = excluded.role",
                rusqlite::params![ctx.team_id.to_string(), user_id.to_string(), role.to_string()],
            )?;
            Ok(())
        })
    }

    /// Remove a member. Admin only; the last admin cannot be removed.
    pub fn remove_member(&self, ctx: &TeamContext, user_id: &Uuid) -> Result<()> {
        ctx.require_role(Role::Admin)?;
        if self.is_last_admin(&ctx.team_id, user_id)? {
            return Err(EngineError::invalid("a team must keep at least one admin"));
        }
        let removed = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM team_members WHERE team_id = ?1 AND user_id = ?2",
                rusqlite::params![ctx.team_id.to_string(), user_id.to_string()],
            )
        })?;
        if removed == 0 {
            return Err(EngineError::not_found("member"));
        }
        Ok(())
    }

    fn is_last_admin(&self, team_id: &Uuid, user_id: &Uuid) -> Result<bool> {
        self.store.with_conn(|conn| {
            let is_admin: bool = conn
                .prepare_cached(
                    "SELECT 1 FROM team_members
                     WHERE team_id = ?1 AND user_id = ?2 AND role = 'admin'",
                )?
                .exists(rusqlite::params![team_id.to_string(), user_id.to_string()])?;
            if !is_admin {
                return Ok(false);
            }
            let admins: i64 = conn.query_row(
                "SELECT COUNT(*) FROM team_members WHERE team_id = ?1 AND role = 'admin'",
                [team_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(admins <= 1)
        })
    }

    /// Bind a caller to a team: validate membership and attach the
    /// subscription when one exists.
    pub fn bind(&self, user_id: &Uuid, team_id: &Uuid) -> Result<TeamContext> {
        let role: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM team_members WHERE team_id = ?1 AND user_id = ?2",
                rusqlite::params![team_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let role: Role = role
            .ok_or(EngineError::Auth(AuthError::NotMember))?
            .parse()
            .map_err(|_| EngineError::internal("corrupt role value"))?;

        let subscription = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT plan, active, renews_at FROM subscriptions WHERE team_id = ?1",
                [team_id.to_string()],
                |row| {
                    let renews: Option<String> = row.get(2)?;
                    Ok(Subscription {
                        plan: row.get(0)?,
                        active: row.get::<_, i64>(1)? != 0,
                        renews_at: renews.as_deref().map(parse_store_time),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;

        Ok(TeamContext {
            team_id: *team_id,
            user_id: *user_id,
            role,
            subscription,
        })
    }

    /// Verify the entity belongs to the context's team, surfacing misses as
    /// `NotFound` for `entity`.
    pub fn verify_ownership(
        &self,
        ctx: &TeamContext,
        table: &'static str,
        entity: &'static str,
        id: &Uuid,
    ) -> Result<()> {
        if self.store.owned_by_team(table, id, &ctx.team_id)? {
            Ok(())
        } else {
            Err(EngineError::not_found(entity))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Store>, Tenancy) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tenancy = Tenancy::new(Arc::clone(&store));
        (store, tenancy)
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Viewer < Role::Member);
        assert!(Role::Member < Role::Admin);
    }

    #[test]
    fn test_create_team_makes_creator_admin() {
        let (_, tenancy) = setup();
        let creator = Uuid::new_v4();
        let team = tenancy.create_team("acme", &creator).unwrap();

        let ctx = tenancy.bind(&creator, &team.id).unwrap();
        assert_eq!(ctx.role, Role::Admin);
        assert!(ctx.subscription.is_none());
    }

    #[test]
    fn test_create_team_rejects_empty_name() {
        let (_, tenancy) = setup();
        assert!(tenancy.create_team("   ", &Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_bind_non_member_fails() {
        let (_, tenancy) = setup();
        let team = tenancy.create_team("acme", &Uuid::new_v4()).unwrap();
        let outsider = Uuid::new_v4();
        let err = tenancy.bind(&outsider, &team.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
    }

    #[test]
    fn test_require_role_monotonic() {
        let (_, tenancy) = setup();
        let creator = Uuid::new_v4();
        let member = Uuid::new_v4();
        let team = tenancy.create_team("acme", &creator).unwrap();
        let admin_ctx = tenancy.bind(&creator, &team.id).unwrap();
        tenancy
            .upsert_member(&admin_ctx, &member, Role::Member)
            .unwrap();
        let member_ctx = tenancy.bind(&member, &team.id).unwrap();

        // Anything permitted for member is permitted for admin.
        assert!(member_ctx.require_role(Role::Member).is_ok());
        assert!(admin_ctx.require_role(Role::Member).is_ok());
        assert!(member_ctx.require_role(Role::Admin).is_err());
        assert!(admin_ctx.require_role(Role::Admin).is_ok());
    }

    #[test]
    fn test_last_admin_cannot_be_removed_or_demoted() {
        let (_, tenancy) = setup();
        let creator = Uuid::new_v4();
        let team = tenancy.create_team("acme", &creator).unwrap();
        let ctx = tenancy.bind(&creator, &team.id).unwrap();

        assert!(tenancy.remove_member(&ctx, &creator).is_err());
        assert!(tenancy.upsert_member(&ctx, &creator, Role::Member).is_err());

        // A second admin unblocks both operations.
        let other = Uuid::new_v4();
        tenancy.upsert_member(&ctx, &other, Role::Admin).unwrap();
        assert!(tenancy.upsert_member(&ctx, &creator, Role::Member).is_ok());
    }

    #[test]
    fn test_member_cannot_manage_team() {
        let (_, tenancy) = setup();
        let creator = Uuid::new_v4();
        let member = Uuid::new_v4();
        let team = tenancy.create_team("acme", &creator).unwrap();
        let admin_ctx = tenancy.bind(&creator, &team.id).unwrap();
        tenancy
            .upsert_member(&admin_ctx, &member, Role::Member)
            .unwrap();
        let member_ctx = tenancy.bind(&member, &team.id).unwrap();

        assert!(
            tenancy
                .upsert_member(&member_ctx, &Uuid::new_v4(), Role::Member)
                .is_err()
        );
        assert!(tenancy.delete_team(&member_ctx).is_err());
    }

    #[test]
    fn test_verify_ownership_cross_tenant_is_not_found() {
        let (store, tenancy) = setup();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let team_a = tenancy.create_team("a", &user_a).unwrap();
        let team_b = tenancy.create_team("b", &user_b).unwrap();

        let agent = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO agents (id, team_id, name, model_id) VALUES (?1, ?2, 'x', 'fast')",
                    [agent.to_string(), team_a.id.to_string()],
                )
            })
            .unwrap();

        let ctx_a = tenancy.bind(&user_a, &team_a.id).unwrap();
        let ctx_b = tenancy.bind(&user_b, &team_b.id).unwrap();

        assert!(
            tenancy
                .verify_ownership(&ctx_a, "agents", "agent", &agent)
                .is_ok()
        );
        let err = tenancy
            .verify_ownership(&ctx_b, "agents", "agent", &agent)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert_eq!(err.to_string(), "agent not found");
    }

    #[test]
    fn test_list_teams() {
        let (_, tenancy) = setup();
        let user = Uuid::new_v4();
        tenancy.create_team("one", &user).unwrap();
        tenancy.create_team("two", &user).unwrap();
        let memberships = tenancy.list_teams(&user).unwrap();
        assert_eq!(memberships.len(), 2);
        assert!(memberships.iter().all(|m| m.role == Role::Admin));
    }

    #[test]
    fn test_subscription_attached_on_bind() {
        let (store, tenancy) = setup();
        let user = Uuid::new_v4();
        let team = tenancy.create_team("acme", &user).unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO subscriptions (team_id, plan, active) VALUES (?1, 'pro', 1)",
                    [team.id.to_string()],
                )
            })
            .unwrap();

        let ctx = tenancy.bind(&user, &team.id).unwrap();
        let sub = ctx.subscription.unwrap();
        assert_eq!(sub.plan, "pro");
        assert!(sub.active);
    }
}
