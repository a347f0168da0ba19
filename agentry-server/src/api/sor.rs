//! Source-of-record routes.

use agentry_core::sor::SorPermission;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

pub async fn list_tables(State(engine): State<Arc<Engine>>, bound: Bound) -> ApiResult<Json<Value>> {
    let tables = engine.sor.list_tables(&bound.ctx.team_id)?;
    Ok(Json(json!(tables)))
}

#[derive(Deserialize)]
pub struct CreateTableBody {
    pub name: String,
    pub columns: Vec<String>,
}

pub async fn create_table(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<CreateTableBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let table = engine
        .sor
        .create_table(&bound.ctx.team_id, &body.name, &body.columns)?;
    Ok((StatusCode::CREATED, Json(json!(table))))
}

pub async fn get_table(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let table = engine.sor.get_table(&bound.ctx.team_id, &id)?;
    Ok(Json(json!(table)))
}

pub async fn delete_table(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.sor.delete_table(&bound.ctx.team_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RowsQuery {
    pub limit: Option<usize>,
}

pub async fn list_rows(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Query(query): Query<RowsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let rows = engine.sor.list_rows(&bound.ctx.team_id, &id, limit)?;
    Ok(Json(json!(rows)))
}

pub async fn insert_row(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let row = engine.sor.insert_row(&bound.ctx.team_id, &id, data)?;
    Ok((StatusCode::CREATED, Json(json!(row))))
}

pub async fn update_row(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path((id, row_id)): Path<(Uuid, Uuid)>,
    Json(data): Json<Map<String, Value>>,
) -> ApiResult<Json<Value>> {
    let row = engine
        .sor
        .update_row(&bound.ctx.team_id, &id, &row_id, data)?;
    Ok(Json(json!(row)))
}

pub async fn delete_row(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path((id, row_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    engine.sor.delete_row(&bound.ctx.team_id, &id, &row_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PermissionBody {
    pub agent_id: Uuid,
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_write: bool,
}

pub async fn set_permission(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<PermissionBody>,
) -> ApiResult<StatusCode> {
    engine.agents.get(&bound.ctx.team_id, &body.agent_id)?;
    engine.sor.set_permission(
        &bound.ctx.team_id,
        &body.agent_id,
        &id,
        SorPermission {
            can_read: body.can_read,
            can_write: body.can_write,
        },
    )?;
    Ok(StatusCode::NO_CONTENT)
}
