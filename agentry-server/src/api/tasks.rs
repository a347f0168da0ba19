//! Task board, goal, and measurable-goal routes.

use agentry_core::tasks::{NewTask, TaskPatch, TaskStatus};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

#[derive(Deserialize)]
pub struct TasksQuery {
    pub status: Option<TaskStatus>,
}

pub async fn list(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = engine.tasks.list(&bound.ctx.team_id, query.status)?;
    Ok(Json(json!(tasks)))
}

pub async fn create(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(new): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let task = engine.tasks.create(&bound.ctx.team_id, new)?;
    Ok((StatusCode::CREATED, Json(json!(task))))
}

pub async fn get(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let task = engine.tasks.get(&bound.ctx.team_id, &id)?;
    let blocked = engine.tasks.is_blocked(&bound.ctx.team_id, &id)?;
    let mut value = json!(task);
    value["blocked"] = json!(blocked);
    Ok(Json(value))
}

pub async fn patch(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Json<Value>> {
    let task = engine.tasks.update(&bound.ctx.team_id, &id, patch)?;
    Ok(Json(json!(task)))
}

pub async fn delete(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    engine.tasks.delete(&bound.ctx.team_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct DependencyBody {
    pub depends_on: Uuid,
}

pub async fn add_dependency(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<DependencyBody>,
) -> ApiResult<StatusCode> {
    engine
        .tasks
        .add_dependency(&bound.ctx.team_id, &id, &body.depends_on)?;
    Ok(StatusCode::CREATED)
}

pub async fn remove_dependency(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path((id, dep)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    engine
        .tasks
        .remove_dependency(&bound.ctx.team_id, &id, &dep)?;
    Ok(StatusCode::NO_CONTENT)
}

/// The task's singleton discussion thread, created on first access.
pub async fn thread(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    engine.tasks.get(&bound.ctx.team_id, &id)?;
    let channel = engine.chat.task_thread(&bound.ctx.team_id, &id)?;
    Ok(Json(json!(channel)))
}

#[derive(Deserialize)]
pub struct CreateGoalBody {
    pub title: String,
    pub target_date: Option<DateTime<Utc>>,
}

pub async fn list_goals(State(engine): State<Arc<Engine>>, bound: Bound) -> ApiResult<Json<Value>> {
    let goals = engine.goals.list(&bound.ctx.team_id)?;
    Ok(Json(json!(goals)))
}

pub async fn create_goal(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<CreateGoalBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let goal = engine
        .goals
        .create(&bound.ctx.team_id, &body.title, body.target_date)?;
    Ok((StatusCode::CREATED, Json(json!(goal))))
}

pub async fn get_goal(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let goal = engine.goals.get(&bound.ctx.team_id, &id)?;
    Ok(Json(json!(goal)))
}

#[derive(Deserialize)]
pub struct LinkTaskBody {
    pub task_id: Uuid,
}

pub async fn link_goal_task(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<LinkTaskBody>,
) -> ApiResult<StatusCode> {
    engine
        .goals
        .link_task(&bound.ctx.team_id, &id, &body.task_id)?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
pub struct CreateMeasurableBody {
    pub metric_name: String,
    pub target_value: f64,
    #[serde(default)]
    pub unit: String,
    pub deadline: Option<DateTime<Utc>>,
}

pub async fn list_measurable(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
) -> ApiResult<Json<Value>> {
    let goals = engine.measurable_goals.list(&bound.ctx.team_id)?;
    Ok(Json(json!(goals)))
}

pub async fn create_measurable(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<CreateMeasurableBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let goal = engine.measurable_goals.create(
        &bound.ctx.team_id,
        &body.metric_name,
        body.target_value,
        &body.unit,
        body.deadline,
    )?;
    Ok((StatusCode::CREATED, Json(json!(goal))))
}

#[derive(Deserialize)]
pub struct RecordValueBody {
    pub value: f64,
}

pub async fn record_measurable_value(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<RecordValueBody>,
) -> ApiResult<Json<Value>> {
    let goal = engine
        .measurable_goals
        .record_value(&bound.ctx.team_id, &id, body.value)?;
    Ok(Json(json!(goal)))
}
