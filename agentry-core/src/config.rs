//! Configuration system for the engine.
//!
//! Uses `figment` for layered configuration: defaults -> `agentry.toml` ->
//! `AGENTRY_*` environment variables. Every deployment-recognized option is
//! represented here; unset secrets stay `None` and the affected subsystem
//! degrades the way its module documents (e.g. the vault's `plain:` fallback).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Top-level configuration for an engine deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for the SQLite database and derived state.
    pub data_dir: PathBuf,
    /// Root of the shared agent workspace file store.
    pub workspace_root: PathBuf,
    /// Directory scanned for skill documents.
    pub skills_dir: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Allowed CORS origins; empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Override for the SQLite database path (defaults to `data_dir/agentry.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Hosted-mode flag: subscription and credit gates apply when set.
    #[serde(default)]
    pub hosted: bool,
    pub auth: AuthConfig,
    pub vault: VaultConfig,
    pub models: ModelsConfig,
    pub transcription: TranscriptionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".agentry"),
            workspace_root: PathBuf::from(".agentry/workspace"),
            skills_dir: PathBuf::from("skills"),
            port: 8080,
            cors_origins: Vec::new(),
            database_url: None,
            hosted: false,
            auth: AuthConfig::default(),
            vault: VaultConfig::default(),
            models: ModelsConfig::default(),
            transcription: TranscriptionConfig::default(),
        }
    }
}

/// Identity verification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for HS256 tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Issuer base URL for ES256 tokens; JWKS is fetched from
    /// `<issuer>/auth/v1/.well-known/jwks.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,
    /// Issuer api key sent alongside the JWKS fetch when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_anon_key: Option<String>,
    /// Allow the deterministic dev identity when no token is presented.
    /// Refused when `production` is set.
    #[serde(default)]
    pub allow_dev_identity: bool,
    /// Production deployments refuse all traffic if no verifier is configured.
    #[serde(default)]
    pub production: bool,
}

/// Credential vault configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Hex-encoded 32-byte AES-256-GCM key. When absent, the vault stores
    /// `plain:` values and logs a one-time warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_hex: Option<String>,
}

impl VaultConfig {
    /// Decode the configured key, validating length.
    pub fn key_bytes(&self) -> Result<Option<[u8; 32]>> {
        let Some(hex) = &self.encryption_key_hex else {
            return Ok(None);
        };
        let bytes = decode_hex(hex)
            .ok_or_else(|| EngineError::invalid("encryption key is not valid hex"))?;
        if bytes.len() != 32 {
            return Err(EngineError::Vault(crate::error::VaultError::InvalidKeyLength(
                bytes.len(),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }
}

/// Model routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Fallback endpoint used when no provider matches a logical id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_endpoint: Option<String>,
    /// Fallback model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    /// Fallback api key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_api_key: Option<String>,
}

/// Speech-to-text adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint of an OpenAI-compatible transcription API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl EngineConfig {
    /// Load configuration from defaults, an optional `agentry.toml` in
    /// `dir`, and `AGENTRY_*` environment variables (nested keys split
    /// on `__`, e.g. `AGENTRY_AUTH__JWT_SECRET`).
    pub fn load(dir: &Path) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(dir.join("agentry.toml")))
            .merge(Env::prefixed("AGENTRY_").split("__"));

        let config: EngineConfig = figment
            .extract()
            .map_err(|e| EngineError::Misconfigured {
                message: format!("configuration error: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(EngineError::Misconfigured {
                message: "port must be non-zero".into(),
            });
        }
        // Fail early on a malformed key rather than at first encrypt.
        self.vault.key_bytes()?;
        Ok(())
    }

    /// Resolved path of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_url {
            Some(url) => PathBuf::from(url),
            None => self.data_dir.join("agentry.db"),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
