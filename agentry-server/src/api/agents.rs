//! Agent routes: CRUD, lifecycle, skills, and chat.

use agentry_core::agents::{AgentPatch, AgentStatus, NewAgent};
use agentry_core::error::EngineError;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

pub async fn list(State(engine): State<Arc<Engine>>, bound: Bound) -> ApiResult<Json<Value>> {
    let agents = engine.agents.list(&bound.ctx.team_id)?;
    Ok(Json(json!(agents)))
}

pub async fn create(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(new): Json<NewAgent>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let agent = engine.agents.create(&bound.ctx.team_id, new)?;
    Ok((StatusCode::CREATED, Json(json!(agent))))
}

pub async fn get(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let agent = engine.agents.get(&bound.ctx.team_id, &id)?;
    Ok(Json(json!(agent)))
}

pub async fn patch(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(patch): Json<AgentPatch>,
) -> ApiResult<Json<Value>> {
    let agent = engine.agents.update(&bound.ctx.team_id, &id, patch)?;
    // A changed heartbeat takes effect on the next (re)schedule.
    if agent.status == AgentStatus::Running {
        engine.scheduler.unschedule(&id);
        engine.scheduler.schedule(&agent);
    }
    Ok(Json(json!(agent)))
}

pub async fn delete(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.agents.delete(&bound.ctx, &id)?;
    engine.scheduler.unschedule(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let agent = engine
        .agents
        .set_status(&bound.ctx.team_id, &id, AgentStatus::Running)?;
    engine.scheduler.schedule(&agent);
    Ok(Json(json!(agent)))
}

pub async fn stop(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let agent = engine
        .agents
        .set_status(&bound.ctx.team_id, &id, AgentStatus::Stopped)?;
    engine.scheduler.unschedule(&id);
    Ok(Json(json!(agent)))
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
}

pub async fn chat(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<Value>> {
    if body.message.trim().is_empty() {
        return Err(EngineError::invalid("message must not be empty").into());
    }
    // Dropping the request cancels the in-flight model call via this token.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response = engine
        .chat_with_agent(&bound.ctx, &id, &body.message, &cancel)
        .await?;
    Ok(Json(json!({"response": response})))
}

pub async fn list_skills(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    engine.agents.get(&bound.ctx.team_id, &id)?;
    let installed = engine.skills.agent_skills(&id)?;
    Ok(Json(json!(installed)))
}

#[derive(Deserialize)]
pub struct InstallSkillBody {
    pub skill: String,
}

pub async fn install_skill(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<InstallSkillBody>,
) -> ApiResult<StatusCode> {
    engine.agents.get(&bound.ctx.team_id, &id)?;
    engine.skills.install(&id, &body.skill)?;
    Ok(StatusCode::CREATED)
}

pub async fn uninstall_skill(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path((id, skill)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    engine.agents.get(&bound.ctx.team_id, &id)?;
    engine.skills.uninstall(&id, &skill)?;
    Ok(StatusCode::NO_CONTENT)
}
