//! Real-time meeting routes: start, SSE event stream, interjection, voice,
//! and raise-hand.

use agentry_core::MeetingEvent;
use agentry_core::error::EngineError;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::error::ApiResult;
use super::extract::Bound;
use crate::engine::Engine;

#[derive(Deserialize)]
pub struct StartMeetingBody {
    pub title: String,
    pub agent_ids: Vec<Uuid>,
    pub advisor_agent_id: Uuid,
    pub company_name: Option<String>,
}

pub async fn start(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Json(body): Json<StartMeetingBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let meeting = engine.start_meeting(
        &bound.ctx,
        &body.title,
        &body.agent_ids,
        &body.advisor_agent_id,
        body.company_name,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"meeting_id": meeting.id})),
    ))
}

/// Server-sent-event stream of meeting events. A dropped subscriber affects
/// nobody else; lagging subscribers silently skip the events they missed.
pub async fn stream(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let meeting = engine.meetings.get(&bound.ctx.team_id, &id)?;
    let receiver = meeting.subscribe();

    let stream = BroadcastStream::new(receiver).filter_map(|event| async move {
        match event {
            Ok(event) => {
                let name = match &event {
                    MeetingEvent::TurnStart { .. } => "turn_start",
                    MeetingEvent::Delta { .. } => "delta",
                    MeetingEvent::TurnEnd { .. } => "turn_end",
                    MeetingEvent::HumanInjected { .. } => "human_injected",
                    MeetingEvent::MeetingEnd => "meeting_end",
                    MeetingEvent::Ping => "ping",
                };
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
                Some(Ok(Event::default().event(name).data(data)))
            }
            Err(_) => None, // lagged; drop and continue
        }
    });

    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
pub struct HumanMessageBody {
    pub text: String,
}

pub async fn message(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    Json(body): Json<HumanMessageBody>,
) -> ApiResult<StatusCode> {
    let meeting = engine.meetings.get(&bound.ctx.team_id, &id)?;
    meeting.post_human_message(&body.text)?;
    Ok(StatusCode::ACCEPTED)
}

/// Raw audio body in; transcription happens before the text joins the
/// interjection queue.
pub async fn voice(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
    audio: Bytes,
) -> ApiResult<Json<Value>> {
    if audio.is_empty() {
        return Err(EngineError::invalid("audio body must not be empty").into());
    }
    let meeting = engine.meetings.get(&bound.ctx.team_id, &id)?;
    let text = meeting
        .post_voice(engine.transcriber.as_ref(), &audio)
        .await?;
    Ok(Json(json!({"transcribed": text})))
}

pub async fn raise_hand(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let meeting = engine.meetings.get(&bound.ctx.team_id, &id)?;
    meeting.raise_hand();
    Ok(StatusCode::ACCEPTED)
}

pub async fn end(
    State(engine): State<Arc<Engine>>,
    bound: Bound,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let meeting = engine.meetings.get(&bound.ctx.team_id, &id)?;
    meeting.end();
    engine.meetings.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}
