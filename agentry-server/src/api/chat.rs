//! Chat channel and message routes.

use agentry_core::chat::SenderKind;
use agentry_core::error::EngineError;
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

pub async fn list_channels(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
) -> ApiResult<Json<Value>> {
    let channels = engine.chat.list_channels(&bound.ctx.team_id)?;
    Ok(Json(json!(channels)))
}

#[derive(Deserialize)]
pub struct CreateChannelBody {
    pub name: String,
}

pub async fn create_channel(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<CreateChannelBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let channel = engine.chat.create_group(&bound.ctx.team_id, &body.name)?;
    Ok((StatusCode::CREATED, Json(json!(channel))))
}

pub async fn delete_channel(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.chat.delete_channel(&bound.ctx.team_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// The singleton DM channel with an agent, created on first access.
pub async fn agent_dm(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(agent_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    engine.agents.get(&bound.ctx.team_id, &agent_id)?;
    let channel = engine.chat.dm_channel(&bound.ctx.team_id, &agent_id)?;
    Ok(Json(json!(channel)))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn list_messages(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let messages = engine
        .chat
        .messages(&bound.ctx.team_id, &id, query.before, limit)?;
    Ok(Json(json!(messages)))
}

#[derive(Deserialize)]
pub struct PostMessageBody {
    pub content: String,
}

pub async fn post_message(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.content.trim().is_empty() {
        return Err(EngineError::invalid("message must not be empty").into());
    }
    let message = engine.chat.post_message(
        &bound.ctx.team_id,
        &id,
        SenderKind::User,
        &bound.identity.user_id.to_string(),
        &body.content,
    )?;

    // Mention side effects run off the request's critical path, but their
    // outcome is still recorded (notification rows, trigger logs).
    let engine_bg = Arc::clone(&engine);
    let message_bg = message.clone();
    tokio::spawn(async move {
        engine_bg
            .chat
            .handle_mentions(&engine_bg.notifications, &message_bg);
    });

    Ok((StatusCode::CREATED, Json(json!(message))))
}
