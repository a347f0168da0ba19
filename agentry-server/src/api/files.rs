//! Workspace file routes.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

#[derive(Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

pub async fn list(
    State(engine): State<Arc<Engine>>,
    _bound: Bound,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let entries = engine.workspace.list(query.prefix.as_deref())?;
    Ok(Json(json!(entries)))
}

#[derive(Deserialize)]
pub struct ContentQuery {
    pub path: String,
}

pub async fn read(
    State(engine): State<Arc<Engine>>,
    _bound: Bound,
    Query(query): Query<ContentQuery>,
) -> ApiResult<Json<Value>> {
    let content = engine.workspace.read(&query.path)?;
    Ok(Json(json!({"path": query.path, "content": content})))
}

#[derive(Deserialize)]
pub struct WriteBody {
    pub path: String,
    pub content: String,
}

pub async fn write(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<WriteBody>,
) -> ApiResult<StatusCode> {
    // Human writes hold the cooperative lock under the user's id, so agents
    // see the same "locked by" contention rules.
    engine
        .workspace
        .write(&bound.identity.user_id, &body.path, &body.content)?;
    Ok(StatusCode::NO_CONTENT)
}
