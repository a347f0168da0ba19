//! Router assembly.
//!
//! Public routes (health, platform config) skip authentication entirely.
//! Team and notification routes authenticate but bind no tenant, because
//! they operate across tenants for one user. Everything else requires the
//! `X-Team-Id` binding via the [`extract::Bound`] extractor.

pub mod admin;
pub mod agents;
pub mod chat;
pub mod error;
pub mod extract;
pub mod files;
pub mod kb;
pub mod meetings;
pub mod sor;
pub mod tasks;
pub mod teams;

use agentry_core::agents::TEMPLATES;
use agentry_core::models::PROVIDERS;
use axum::Json;
use axum::extract::State;
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

/// Build the full application router.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = if engine.config.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = engine
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    Router::new()
        // Public.
        .route("/health", get(health))
        .route("/platform", get(platform))
        // Per-user, cross-tenant.
        .route("/teams", get(teams::list).post(teams::create))
        .route("/teams/{team_id}", delete(teams::delete))
        .route("/teams/{team_id}/members", post(teams::upsert_member))
        .route(
            "/teams/{team_id}/members/{user_id}",
            delete(teams::remove_member),
        )
        .route("/notifications", get(teams::notifications))
        .route(
            "/notifications/{id}/read",
            post(teams::mark_notification_read),
        )
        // Agents.
        .route("/agents", get(agents::list).post(agents::create))
        .route(
            "/agents/{id}",
            get(agents::get).patch(agents::patch).delete(agents::delete),
        )
        .route("/agents/{id}/start", post(agents::start))
        .route("/agents/{id}/stop", post(agents::stop))
        .route("/agents/{id}/chat", post(agents::chat))
        .route("/agents/{id}/dm", get(chat::agent_dm))
        .route(
            "/agents/{id}/skills",
            get(agents::list_skills).post(agents::install_skill),
        )
        .route(
            "/agents/{id}/skills/{skill}",
            delete(agents::uninstall_skill),
        )
        // Tasks and goals.
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/tasks/{id}",
            get(tasks::get).patch(tasks::patch).delete(tasks::delete),
        )
        .route("/tasks/{id}/dependencies", post(tasks::add_dependency))
        .route(
            "/tasks/{id}/dependencies/{dep}",
            delete(tasks::remove_dependency),
        )
        .route("/tasks/{id}/thread", get(tasks::thread))
        .route("/goals", get(tasks::list_goals).post(tasks::create_goal))
        .route("/goals/{id}", get(tasks::get_goal))
        .route("/goals/{id}/tasks", post(tasks::link_goal_task))
        .route(
            "/measurable-goals",
            get(tasks::list_measurable).post(tasks::create_measurable),
        )
        .route(
            "/measurable-goals/{id}/value",
            post(tasks::record_measurable_value),
        )
        // Approvals, activity, credits.
        .route("/approvals", get(admin::list_approvals))
        .route("/approvals/{id}/approve", post(admin::approve))
        .route("/approvals/{id}/reject", post(admin::reject))
        .route("/activity", get(admin::activity))
        .route("/credits", get(admin::credits))
        // Chat.
        .route(
            "/channels",
            get(chat::list_channels).post(chat::create_channel),
        )
        .route("/channels/{id}", delete(chat::delete_channel))
        .route(
            "/channels/{id}/messages",
            get(chat::list_messages).post(chat::post_message),
        )
        // Workspace files.
        .route("/files", get(files::list))
        .route("/files/content", get(files::read).put(files::write))
        // Source of record.
        .route("/sor/tables", get(sor::list_tables).post(sor::create_table))
        .route(
            "/sor/tables/{id}",
            get(sor::get_table).delete(sor::delete_table),
        )
        .route(
            "/sor/tables/{id}/rows",
            get(sor::list_rows).post(sor::insert_row),
        )
        .route(
            "/sor/tables/{id}/rows/{row_id}",
            put(sor::update_row).delete(sor::delete_row),
        )
        .route("/sor/tables/{id}/permissions", put(sor::set_permission))
        // Model providers and credentials.
        .route("/models/providers", get(admin::providers))
        .route("/credentials", get(admin::list_credentials))
        .route(
            "/credentials/{service}",
            put(admin::put_credential).delete(admin::delete_credential),
        )
        // Skills library.
        .route("/skills", get(admin::list_skills))
        // Knowledge base.
        .route(
            "/kb/documents",
            get(kb::list_documents).post(kb::upload_document),
        )
        .route(
            "/kb/documents/{id}",
            get(kb::get_document).delete(kb::delete_document),
        )
        .route("/kb/search", post(kb::search))
        .route("/kb/memories/search", post(kb::search_memories))
        // Meetings.
        .route("/meetings/meet-and-greet", post(meetings::start))
        .route("/meetings/{id}/stream", get(meetings::stream))
        .route("/meetings/{id}/message", post(meetings::message))
        .route("/meetings/{id}/voice", post(meetings::voice))
        .route("/meetings/{id}/raise-hand", post(meetings::raise_hand))
        .route("/meetings/{id}/end", post(meetings::end))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Public platform configuration: hosted flag, provider catalog, and the
/// agent template catalog. Nothing tenant-specific.
async fn platform(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({
        "hosted": engine.config.hosted,
        "providers": PROVIDERS.iter().map(|p| json!({
            "id": p.id,
            "name": p.name,
            "requires_key": p.requires_key,
            "enabled": p.enabled,
        })).collect::<Vec<_>>(),
        "templates": TEMPLATES,
    }))
}
