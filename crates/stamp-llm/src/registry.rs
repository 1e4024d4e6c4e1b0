//! Provider endpoints keyed by `model_id`.
use std::collections::HashMap;
use std::env;

use crate::LlmError;

/// One chat-completion endpoint: where to POST and which env var holds the
/// key. The `model` field is the provider-side model name, which may differ
/// from the `model_id` clients select with.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub completion_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
}

impl ProviderEndpoint {
    pub fn resolve_api_key(&self) -> Result<Option<String>, LlmError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => env::var(var)
                .map(Some)
                .map_err(|_| LlmError::MissingApiKey(var.clone())),
        }
    }
}

/// Registry of known endpoints with a default fallback model.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    endpoints: HashMap<String, ProviderEndpoint>,
    default_model_id: String,
}

impl ProviderRegistry {
    pub fn new(default_model_id: impl Into<String>) -> Self {
        Self {
            endpoints: HashMap::new(),
            default_model_id: default_model_id.into(),
        }
    }

    pub fn register(&mut self, model_id: impl Into<String>, endpoint: ProviderEndpoint) {
        self.endpoints.insert(model_id.into(), endpoint);
    }

    pub fn with_endpoint(
        mut self,
        model_id: impl Into<String>,
        endpoint: ProviderEndpoint,
    ) -> Self {
        self.register(model_id, endpoint);
        self
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model_id
    }

    /// Resolve a requested model id, falling back to the default when the
    /// caller did not pick one. Unknown ids are an error, not a fallback:
    /// silently answering with a different model would be misleading.
    pub fn resolve(&self, model_id: Option<&str>) -> Result<&ProviderEndpoint, LlmError> {
        let id = model_id.unwrap_or(&self.default_model_id);
        self.endpoints
            .get(id)
            .ok_or_else(|| LlmError::UnknownModel(id.to_string()))
    }
}
