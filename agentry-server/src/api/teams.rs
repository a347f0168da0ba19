//! Team management and notifications. These routes operate across tenants
//! for one user, so they authenticate without the team-binding header.

use agentry_core::tenancy::Role;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::{Caller, bind_path_team};
use crate::engine::Engine;

pub async fn list(State(engine): State<Arc<Engine>>, Caller(identity): Caller) -> ApiResult<Json<Value>> {
    let memberships = engine.tenancy.list_teams(&identity.user_id)?;
    Ok(Json(json!(memberships)))
}

#[derive(Deserialize)]
pub struct CreateTeamBody {
    pub name: String,
}

pub async fn create(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Json(body): Json<CreateTeamBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let team = engine.tenancy.create_team(&body.name, &identity.user_id)?;
    Ok((StatusCode::CREATED, Json(json!(team))))
}

pub async fn delete(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Path(team_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let ctx = bind_path_team(&engine, &identity, &team_id)?;
    engine.tenancy.delete_team(&ctx)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MemberBody {
    pub user_id: Uuid,
    pub role: Role,
}

pub async fn upsert_member(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Path(team_id): Path<Uuid>,
    Json(body): Json<MemberBody>,
) -> ApiResult<StatusCode> {
    let ctx = bind_path_team(&engine, &identity, &team_id)?;
    engine.tenancy.upsert_member(&ctx, &body.user_id, body.role)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Path((team_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let ctx = bind_path_team(&engine, &identity, &team_id)?;
    engine.tenancy.remove_member(&ctx, &user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub unread: bool,
}

pub async fn notifications(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<Json<Value>> {
    let notes = engine
        .notifications
        .list(&identity.user_id, query.unread)?;
    Ok(Json(json!(notes)))
}

pub async fn mark_notification_read(
    State(engine): State<Arc<Engine>>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.notifications.mark_read(&identity.user_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}
