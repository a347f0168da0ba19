//! Knowledge base routes: document upload, listing, search, and memories.

use agentry_core::error::EngineError;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

pub async fn list_documents(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
) -> ApiResult<Json<Value>> {
    let documents = engine.kb.list_documents(&bound.ctx.team_id)?;
    Ok(Json(json!(documents)))
}

#[derive(Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

/// Upload a document body; ingestion continues in the background and the
/// row transitions to `ready` or `failed`.
pub async fn upload_document(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.is_empty() {
        return Err(EngineError::invalid("document body must not be empty").into());
    }
    let document = engine.ingest_document(&bound.ctx, &query.filename, body.to_vec())?;
    Ok((StatusCode::CREATED, Json(json!(document))))
}

pub async fn get_document(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let document = engine.kb.get_document(&bound.ctx.team_id, &id)?;
    Ok(Json(json!(document)))
}

pub async fn delete_document(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.kb.delete_document(&bound.ctx.team_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub top_k: Option<usize>,
    pub document_ids: Option<Vec<Uuid>>,
}

pub async fn search(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<Value>> {
    let top_k = body.top_k.unwrap_or(5).clamp(1, 50);
    let embed = engine.embed_config(&bound.ctx.team_id);
    let hits = engine
        .kb
        .search(
            &bound.ctx.team_id,
            &body.query,
            top_k,
            body.document_ids.as_deref(),
            embed.as_ref(),
            &CancellationToken::new(),
        )
        .await?;
    Ok(Json(json!(hits)))
}

#[derive(Deserialize)]
pub struct MemorySearchBody {
    pub query: String,
    pub top_k: Option<usize>,
}

pub async fn search_memories(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<MemorySearchBody>,
) -> ApiResult<Json<Value>> {
    let top_k = body.top_k.unwrap_or(5).clamp(1, 50);
    let embed = engine.embed_config(&bound.ctx.team_id);
    let memories = engine
        .kb
        .search_memories(
            &bound.ctx.team_id,
            &body.query,
            top_k,
            embed.as_ref(),
            &CancellationToken::new(),
        )
        .await?;
    Ok(Json(json!(memories)))
}
