//! Model routing — logical model ids to concrete provider configurations.
//!
//! Agents reference models by logical id (a capability tier); the router owns
//! the table mapping those ids to `(provider, endpoint, model, key)` tuples.
//! In hosted mode a pluggable resolver takes precedence; in self-hosted mode
//! candidate providers are matched against tenant-supplied keys; a single
//! fallback tuple applies when nothing else does.

pub mod chat;
pub mod embeddings;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ModelsConfig;
use crate::error::{ModelError, Result};

pub use chat::{ChatClient, StreamDelta};
pub use embeddings::{EMBED_BATCH_SIZE, EmbeddingClient};

/// A provider in the closed catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub base_endpoint: &'static str,
    pub requires_key: bool,
    pub enabled: bool,
}

/// The known provider set. All speak the OpenAI-compatible wire format.
pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: "openai",
        name: "OpenAI",
        base_endpoint: "https://api.openai.com/v1",
        requires_key: true,
        enabled: true,
    },
    ProviderInfo {
        id: "mistral",
        name: "Mistral",
        base_endpoint: "https://api.mistral.ai/v1",
        requires_key: true,
        enabled: true,
    },
    ProviderInfo {
        id: "groq",
        name: "Groq",
        base_endpoint: "https://api.groq.com/openai/v1",
        requires_key: true,
        enabled: true,
    },
    ProviderInfo {
        id: "ollama",
        name: "Ollama",
        base_endpoint: "http://localhost:11434/v1",
        requires_key: false,
        enabled: true,
    },
];

/// Look up a provider by id.
pub fn provider(id: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// A resolved, concrete model configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub provider_id: String,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Per-use credit cost charged before each call.
    pub cost_per_use: i64,
}

struct LogicalModel {
    id: &'static str,
    /// `(provider_id, model_name)` candidates in preference order.
    candidates: &'static [(&'static str, &'static str)],
    cost_per_use: i64,
}

/// The logical model table. Agents only ever see the ids.
const LOGICAL_MODELS: &[LogicalModel] = &[
    LogicalModel {
        id: "fast",
        candidates: &[
            ("groq", "llama-3.1-8b-instant"),
            ("openai", "gpt-4o-mini"),
            ("ollama", "llama3.2:3b"),
        ],
        cost_per_use: 1,
    },
    LogicalModel {
        id: "standard",
        candidates: &[
            ("openai", "gpt-4o"),
            ("mistral", "mistral-large-latest"),
            ("ollama", "qwen2.5:14b"),
        ],
        cost_per_use: 2,
    },
    LogicalModel {
        id: "deep",
        candidates: &[("openai", "o1"), ("mistral", "mistral-large-latest")],
        cost_per_use: 5,
    },
    // Cheap tier used internally for summarization.
    LogicalModel {
        id: "cheap",
        candidates: &[
            ("groq", "llama-3.1-8b-instant"),
            ("openai", "gpt-4o-mini"),
            ("ollama", "llama3.2:1b"),
        ],
        cost_per_use: 1,
    },
    // Embedding tier for the knowledge base. Not charged per use.
    LogicalModel {
        id: "embedding",
        candidates: &[
            ("openai", "text-embedding-3-small"),
            ("ollama", "nomic-embed-text"),
        ],
        cost_per_use: 0,
    },
];

/// A pluggable hosted-mode resolver, consulted before the built-in table.
pub type HostedResolver = Arc<dyn Fn(&str) -> Option<ModelConfig> + Send + Sync>;

/// Routes logical model ids to concrete configurations.
pub struct ModelRouter {
    hosted_resolver: Option<HostedResolver>,
    fallback: Option<ModelConfig>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("hosted", &self.hosted_resolver.is_some())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ModelRouter {
    pub fn new(config: &ModelsConfig, hosted_resolver: Option<HostedResolver>) -> Self {
        let fallback = match (&config.fallback_endpoint, &config.fallback_model) {
            (Some(endpoint), Some(model)) => Some(ModelConfig {
                provider_id: "fallback".into(),
                endpoint: endpoint.clone(),
                model: model.clone(),
                api_key: config.fallback_api_key.clone(),
                cost_per_use: 0,
            }),
            _ => None,
        };
        Self {
            hosted_resolver,
            fallback,
        }
    }

    /// Resolve a logical id against tenant-supplied provider keys.
    ///
    /// `tenant_keys` maps provider id to api key. A provider is usable iff it
    /// is enabled and either key-less or keyed by the tenant.
    pub fn resolve(
        &self,
        logical_id: &str,
        tenant_keys: &HashMap<String, String>,
    ) -> Result<ModelConfig> {
        if let Some(resolver) = &self.hosted_resolver {
            if let Some(config) = resolver(logical_id) {
                return Ok(config);
            }
        }

        let logical = LOGICAL_MODELS.iter().find(|m| m.id == logical_id);
        if let Some(logical) = logical {
            for (provider_id, model) in logical.candidates {
                let Some(info) = provider(provider_id) else {
                    continue;
                };
                if !info.enabled {
                    continue;
                }
                let key = tenant_keys.get(*provider_id).cloned();
                if info.requires_key && key.is_none() {
                    continue;
                }
                return Ok(ModelConfig {
                    provider_id: info.id.to_string(),
                    endpoint: info.base_endpoint.to_string(),
                    model: model.to_string(),
                    api_key: key,
                    cost_per_use: logical.cost_per_use,
                });
            }
        }

        self.fallback
            .clone()
            .ok_or_else(|| {
                ModelError::ProviderUnavailable {
                    logical_id: logical_id.to_string(),
                }
                .into()
            })
    }

    /// Per-use cost of a logical model; 0 for unknown ids (the fallback path
    /// carries its own cost).
    pub fn cost_per_use(&self, logical_id: &str) -> i64 {
        LOGICAL_MODELS
            .iter()
            .find(|m| m.id == logical_id)
            .map(|m| m.cost_per_use)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_prefers_keyed_provider() {
        let router = ModelRouter::new(&ModelsConfig::default(), None);
        let config = router
            .resolve("standard", &keys(&[("openai", "sk-1")]))
            .unwrap();
        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.api_key.as_deref(), Some("sk-1"));
        assert_eq!(config.cost_per_use, 2);
    }

    #[test]
    fn test_resolve_falls_through_candidate_order() {
        let router = ModelRouter::new(&ModelsConfig::default(), None);
        // No groq/openai key: "fast" lands on the key-less ollama candidate.
        let config = router.resolve("fast", &HashMap::new()).unwrap();
        assert_eq!(config.provider_id, "ollama");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_resolve_uses_fallback() {
        let config = ModelsConfig {
            fallback_endpoint: Some("https://llm.internal/v1".into()),
            fallback_model: Some("in-house-7b".into()),
            fallback_api_key: Some("key".into()),
        };
        let router = ModelRouter::new(&config, None);
        // "deep" has no key-less candidate, so the fallback applies.
        let resolved = router.resolve("deep", &HashMap::new()).unwrap();
        assert_eq!(resolved.provider_id, "fallback");
        assert_eq!(resolved.model, "in-house-7b");
    }

    #[test]
    fn test_resolve_unknown_without_fallback_fails() {
        let router = ModelRouter::new(&ModelsConfig::default(), None);
        let err = router.resolve("nonexistent", &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Provider);
    }

    #[test]
    fn test_hosted_resolver_takes_precedence() {
        let resolver: HostedResolver = Arc::new(|logical_id| {
            (logical_id == "standard").then(|| ModelConfig {
                provider_id: "hosted".into(),
                endpoint: "https://hosted.example/v1".into(),
                model: "hosted-std".into(),
                api_key: Some("hosted-key".into()),
                cost_per_use: 2,
            })
        });
        let router = ModelRouter::new(&ModelsConfig::default(), Some(resolver));

        let hosted = router
            .resolve("standard", &keys(&[("openai", "sk-1")]))
            .unwrap();
        assert_eq!(hosted.provider_id, "hosted");

        // Ids the hosted resolver declines fall back to the table.
        let table = router.resolve("fast", &HashMap::new()).unwrap();
        assert_eq!(table.provider_id, "ollama");
    }

    #[test]
    fn test_cost_per_use() {
        let router = ModelRouter::new(&ModelsConfig::default(), None);
        assert_eq!(router.cost_per_use("fast"), 1);
        assert_eq!(router.cost_per_use("deep"), 5);
        assert_eq!(router.cost_per_use("mystery"), 0);
    }

    #[test]
    fn test_provider_catalog_closed_set() {
        assert!(provider("openai").is_some());
        assert!(provider("ollama").map(|p| !p.requires_key).unwrap_or(false));
        assert!(provider("acme-llm").is_none());
    }
}
