//! Request extractors: verified identity and bound tenant context.

use agentry_core::error::{AuthError, EngineError};
use agentry_core::tenancy::TeamContext;
use agentry_core::types::Identity;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use crate::engine::Engine;

/// The team-binding header.
pub const TEAM_HEADER: &str = "x-team-id";

/// A verified caller. Routes that operate across tenants for one user
/// (teams, notifications) stop here.
pub struct Caller(pub Identity);

impl FromRequestParts<Arc<Engine>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<Engine>,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let identity = state.verifier.authenticate(bearer).await?;
        Ok(Caller(identity))
    }
}

/// A caller bound to the tenant named by `X-Team-Id`. Membership is
/// validated and the subscription attached.
pub struct Bound {
    pub identity: Identity,
    pub ctx: TeamContext,
}

impl FromRequestParts<Arc<Engine>> for Bound {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<Engine>,
    ) -> Result<Self, Self::Rejection> {
        let Caller(identity) = Caller::from_request_parts(parts, state).await?;

        let team_id = parts
            .headers
            .get(TEAM_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(|| {
                ApiError(EngineError::invalid("X-Team-Id header must be a team uuid"))
            })?;

        let ctx = state.tenancy.bind(&identity.user_id, &team_id)?;
        Ok(Bound { identity, ctx })
    }
}

/// Bind a path-supplied team id instead of the header (team management
/// routes address teams explicitly).
pub fn bind_path_team(
    engine: &Engine,
    identity: &Identity,
    team_id: &Uuid,
) -> Result<TeamContext, ApiError> {
    engine
        .tenancy
        .bind(&identity.user_id, team_id)
        .map_err(|e| match e {
            // Non-membership of an explicit team id surfaces as not-found.
            EngineError::Auth(AuthError::NotMember) => {
                ApiError(EngineError::not_found("team"))
            }
            other => ApiError(other),
        })
}
