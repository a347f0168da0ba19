//! Approvals, activity, credits, credentials, providers, and skills.

use agentry_core::activity::ApprovalStatus;
use agentry_core::models::PROVIDERS;
use agentry_core::vault::CredentialStore;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

#[derive(Deserialize)]
pub struct ApprovalsQuery {
    pub status: Option<ApprovalStatus>,
}

pub async fn list_approvals(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Query(query): Query<ApprovalsQuery>,
) -> ApiResult<Json<Value>> {
    let approvals = engine.approvals.list(&bound.ctx.team_id, query.status)?;
    Ok(Json(json!(approvals)))
}

pub async fn approve(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    bound.ctx.require_role(agentry_core::Role::Member)?;
    let approval = engine.approvals.resolve(&bound.ctx.team_id, &id, true)?;
    Ok(Json(json!(approval)))
}

pub async fn reject(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    bound.ctx.require_role(agentry_core::Role::Member)?;
    let approval = engine.approvals.resolve(&bound.ctx.team_id, &id, false)?;
    Ok(Json(json!(approval)))
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub agent_id: Option<Uuid>,
    pub limit: Option<usize>,
}

pub async fn activity(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let events = engine
        .activity
        .recent(&bound.ctx.team_id, query.agent_id.as_ref(), limit)?;
    Ok(Json(json!(events)))
}

pub async fn credits(State(engine): State<Arc<Engine>>, bound: Bound) -> ApiResult<Json<Value>> {
    let balance = engine.credits.balance(&bound.ctx.team_id)?;
    let ledger = engine.credits.ledger(&bound.ctx.team_id, 100)?;
    Ok(Json(json!({"balance": balance, "ledger": ledger})))
}

pub async fn list_credentials(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
) -> ApiResult<Json<Value>> {
    let creds = CredentialStore::new(&engine.store, &engine.vault);
    let listed = creds.list(&bound.ctx.team_id)?;
    Ok(Json(json!(listed)))
}

#[derive(Deserialize)]
pub struct PutCredentialBody {
    pub value: String,
    #[serde(default = "default_cred_type")]
    pub cred_type: String,
}

fn default_cred_type() -> String {
    "api_key".into()
}

pub async fn put_credential(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(service): Path<String>,
    Json(body): Json<PutCredentialBody>,
) -> ApiResult<StatusCode> {
    bound.ctx.require_role(agentry_core::Role::Admin)?;
    let creds = CredentialStore::new(&engine.store, &engine.vault);
    creds.put(&bound.ctx.team_id, &service, &body.cred_type, &body.value)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_credential(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(service): Path<String>,
) -> ApiResult<StatusCode> {
    bound.ctx.require_role(agentry_core::Role::Admin)?;
    let creds = CredentialStore::new(&engine.store, &engine.vault);
    creds.delete(&bound.ctx.team_id, &service)?;
    Ok(StatusCode::NO_CONTENT)
}

/// The provider catalog with per-tenant usability flags. Keys themselves
/// never appear here.
pub async fn providers(State(engine): State<Arc<Engine>>, bound: Bound) -> ApiResult<Json<Value>> {
    let keys = engine.tenant_provider_keys(&bound.ctx.team_id);
    let listed: Vec<Value> = PROVIDERS
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "requires_key": p.requires_key,
                "enabled": p.enabled,
                "usable": !p.requires_key || keys.contains_key(p.id),
            })
        })
        .collect();
    Ok(Json(json!(listed)))
}

pub async fn list_skills(State(engine): State<Arc<Engine>>, _bound: Bound) -> ApiResult<Json<Value>> {
    let skills: Vec<Value> = engine
        .skills
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "description": s.description,
                "version": s.version,
                "tags": s.tags,
                "tools": s.tools,
            })
        })
        .collect();
    Ok(Json(json!(skills)))
}
