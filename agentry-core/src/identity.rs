//! Identity resolution — bearer-token verification.
//!
//! The token header is parsed first to discover its algorithm: `HS256` is
//! verified against the shared secret, `ES256` against a JWKS fetched from
//! the issuer and cached for one hour (re-fetched once on a kid miss).
//! Verification failures all collapse to the same `Unauthenticated` surface;
//! clients cannot distinguish missing, malformed, and expired tokens.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AuthError, EngineError, Result};
use crate::types::Identity;

/// JWKS entries are cached for one hour.
const JWKS_TTL: Duration = Duration::from_secs(3600);
/// JWKS fetch deadline.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The deterministic identity used by the developer escape hatch.
const DEV_USER_ID: &str = "00000000-0000-4000-8000-00000000dev0";

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// An immutable JWKS snapshot, swapped atomically on refresh.
struct JwksSnapshot {
    set: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Verifies bearer tokens and resolves identities.
pub struct JwtVerifier {
    config: AuthConfig,
    http: reqwest::Client,
    jwks: RwLock<Option<JwksSnapshot>>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("hs256", &self.config.jwt_secret.is_some())
            .field("es256", &self.config.issuer_url.is_some())
            .finish()
    }
}

impl JwtVerifier {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        }
    }

    /// Whether any verification path is configured.
    pub fn is_configured(&self) -> bool {
        self.config.jwt_secret.is_some() || self.config.issuer_url.is_some()
    }

    /// Resolve an identity from an optional `Authorization: Bearer` value.
    ///
    /// In a non-production deployment with `allow_dev_identity`, a missing
    /// token yields the deterministic dev identity. In production an
    /// unconfigured verifier refuses all traffic.
    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<Identity> {
        if !self.is_configured() {
            if self.config.production {
                return Err(EngineError::Misconfigured {
                    message: "no token verifier configured".into(),
                });
            }
            if self.config.allow_dev_identity {
                return Ok(dev_identity());
            }
        }

        let token = bearer
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(EngineError::Auth(AuthError::MissingToken))?;

        self.verify(token).await
    }

    async fn verify(&self, token: &str) -> Result<Identity> {
        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "Token header parse failed");
            EngineError::Auth(AuthError::InvalidToken)
        })?;

        let claims = match header.alg {
            Algorithm::HS256 => {
                let secret = self
                    .config
                    .jwt_secret
                    .as_deref()
                    .ok_or(EngineError::Auth(AuthError::InvalidToken))?;
                let key = DecodingKey::from_secret(secret.as_bytes());
                decode_claims(token, &key, Algorithm::HS256)?
            }
            Algorithm::ES256 => {
                let kid = header
                    .kid
                    .ok_or(EngineError::Auth(AuthError::InvalidToken))?;
                let key = self.es256_key(&kid).await?;
                decode_claims(token, &key, Algorithm::ES256)?
            }
            other => {
                return Err(EngineError::Auth(AuthError::UnsupportedAlgorithm {
                    alg: format!("{other:?}"),
                }));
            }
        };

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| EngineError::Auth(AuthError::InvalidToken))?;
        Ok(Identity {
            user_id,
            email: claims.email.unwrap_or_default(),
        })
    }

    /// Resolve the ES256 decoding key for `kid`, hitting the cached JWKS
    /// first and re-fetching once on a miss.
    async fn es256_key(&self, kid: &str) -> Result<DecodingKey> {
        let set = self.jwks_snapshot(false).await?;
        if let Some(key) = key_from_set(&set, kid) {
            return Ok(key);
        }
        // Key rotation: the kid may be newer than the cache.
        let set = self.jwks_snapshot(true).await?;
        key_from_set(&set, kid).ok_or_else(|| {
            EngineError::Auth(AuthError::KeyNotFound {
                kid: kid.to_string(),
            })
        })
    }

    async fn jwks_snapshot(&self, force: bool) -> Result<Arc<JwkSet>> {
        if !force {
            let guard = self.jwks.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.fetched_at.elapsed() < JWKS_TTL {
                    return Ok(Arc::clone(&snapshot.set));
                }
            }
        }

        let issuer = self
            .config
            .issuer_url
            .as_deref()
            .ok_or(EngineError::Auth(AuthError::InvalidToken))?;
        let url = format!(
            "{}/auth/v1/.well-known/jwks.json",
            issuer.trim_end_matches('/')
        );

        let mut request = self.http.get(&url).timeout(JWKS_FETCH_TIMEOUT);
        if let Some(anon_key) = &self.config.issuer_anon_key {
            request = request.header("apikey", anon_key);
        }

        let set: JwkSet = request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| {
                warn!(url = %url, error = %e, "JWKS fetch failed");
                EngineError::Auth(AuthError::JwksFetch {
                    message: e.to_string(),
                })
            })?
            .json()
            .await
            .map_err(|e| {
                EngineError::Auth(AuthError::JwksFetch {
                    message: e.to_string(),
                })
            })?;

        let set = Arc::new(set);
        let mut guard = self.jwks.write().await;
        *guard = Some(JwksSnapshot {
            set: Arc::clone(&set),
            fetched_at: Instant::now(),
        });
        debug!(keys = set.keys.len(), "JWKS cache refreshed");
        Ok(set)
    }
}

fn key_from_set(set: &JwkSet, kid: &str) -> Option<DecodingKey> {
    set.keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
        .and_then(|jwk| DecodingKey::from_jwk(jwk).ok())
}

fn decode_claims(token: &str, key: &DecodingKey, alg: Algorithm) -> Result<Claims> {
    let mut validation = Validation::new(alg);
    validation.validate_aud = false;
    decode::<Claims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            debug!(error = %e, "Token verification failed");
            EngineError::Auth(AuthError::InvalidToken)
        })
}

fn dev_identity() -> Identity {
    Identity {
        user_id: Uuid::parse_str(DEV_USER_ID).expect("dev uuid is valid"),
        email: "dev@localhost".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        email: String,
        exp: i64,
    }

    fn hs256_verifier(secret: &str) -> JwtVerifier {
        JwtVerifier::new(AuthConfig {
            jwt_secret: Some(secret.into()),
            ..AuthConfig::default()
        })
    }

    fn sign_hs256(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
        let claims = TestClaims {
            sub: sub.into(),
            email: "user@example.com".into(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_hs256_valid_token() {
        let verifier = hs256_verifier("shared-secret");
        let user = Uuid::new_v4();
        let token = sign_hs256("shared-secret", &user.to_string(), 3600);

        let identity = verifier
            .authenticate(Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.email, "user@example.com");
    }

    #[tokio::test]
    async fn test_hs256_wrong_secret() {
        let verifier = hs256_verifier("right-secret");
        let token = sign_hs256("wrong-secret", &Uuid::new_v4().to_string(), 3600);
        let err = verifier
            .authenticate(Some(&format!("Bearer {token}")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_expired_token_same_surface_as_malformed() {
        let verifier = hs256_verifier("secret");
        let expired = sign_hs256("secret", &Uuid::new_v4().to_string(), -3600);

        let expired_err = verifier
            .authenticate(Some(&format!("Bearer {expired}")))
            .await
            .unwrap_err();
        let malformed_err = verifier
            .authenticate(Some("Bearer not.a.jwt"))
            .await
            .unwrap_err();
        let missing_err = verifier.authenticate(None).await.unwrap_err();

        // All three are indistinguishable at the wire level.
        assert_eq!(expired_err.kind(), crate::error::ErrorKind::Unauthenticated);
        assert_eq!(
            malformed_err.kind(),
            crate::error::ErrorKind::Unauthenticated
        );
        assert_eq!(missing_err.kind(), crate::error::ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_non_uuid_subject_rejected() {
        let verifier = hs256_verifier("secret");
        let token = sign_hs256("secret", "not-a-uuid", 3600);
        assert!(
            verifier
                .authenticate(Some(&format!("Bearer {token}")))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dev_identity_when_unconfigured() {
        let verifier = JwtVerifier::new(AuthConfig {
            allow_dev_identity: true,
            ..AuthConfig::default()
        });
        let identity = verifier.authenticate(None).await.unwrap();
        assert_eq!(identity.email, "dev@localhost");
        // Deterministic: same identity every call.
        let again = verifier.authenticate(None).await.unwrap();
        assert_eq!(identity.user_id, again.user_id);
    }

    #[tokio::test]
    async fn test_production_unconfigured_refuses() {
        let verifier = JwtVerifier::new(AuthConfig {
            production: true,
            allow_dev_identity: true,
            ..AuthConfig::default()
        });
        let err = verifier.authenticate(None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Misconfigured);
    }

    #[tokio::test]
    async fn test_bearer_prefix_required() {
        let verifier = hs256_verifier("secret");
        let token = sign_hs256("secret", &Uuid::new_v4().to_string(), 3600);
        // Raw token without the Bearer prefix is rejected.
        assert!(verifier.authenticate(Some(&token)).await.is_err());
    }
}
