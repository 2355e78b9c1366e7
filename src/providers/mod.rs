//! Provider adapters
//!
//! This module provides:
//! - [`ProviderAdapter`] trait implemented once per vendor
//! - [`AuthRuntime`] shared by every adapter (env, cache, store, prompt, HTTP)
//! - [`ProviderRegistry`] mapping [`Provider`] to its adapter
//!
//! The auth half of the trait has default implementations in
//! [`crate::auth::lifecycle`]; adapters only supply vendor hooks (API-key
//! classification, the probe request) and the completion dialect.

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod types;

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::cache::CredentialCache;
use crate::auth::detect::{DetectionStep, InitOptions};
use crate::auth::env::Environment;
use crate::auth::lifecycle::{self, TokenStatus};
use crate::auth::oauth::{FlowType, OAuthFlow, PendingAuthorization};
use crate::auth::oauth_config::load_oauth_config;
use crate::auth::prompt::AuthorizationPrompt;
use crate::auth::store::CredentialStore;
use crate::auth::{AuthContext, Credentials, Provider};
use crate::config::Config;
use crate::error::Error;
use crate::Result;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use types::*;

/// Collaborators every adapter needs for the credential lifecycle
#[derive(Clone)]
pub struct AuthRuntime {
    pub env: Arc<dyn Environment>,
    pub cache: CredentialCache,
    pub store: CredentialStore,
    pub prompt: Arc<dyn AuthorizationPrompt>,
    pub http: Client,
}

impl AuthRuntime {
    pub fn new(
        env: Arc<dyn Environment>,
        cache: CredentialCache,
        store: CredentialStore,
        prompt: Arc<dyn AuthorizationPrompt>,
        http: Client,
    ) -> Self {
        Self {
            env,
            cache,
            store,
            prompt,
            http,
        }
    }
}

/// Build the shared HTTP client with the configured request timeout
pub fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// One vendor's auth hooks and request dialect
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn runtime(&self) -> &AuthRuntime;

    /// OAuth flow runner, when the vendor supports OAuth
    fn oauth(&self) -> Option<&OAuthFlow>;

    /// Detection steps tried by `initialize_auth`, in order
    fn detection_chain(&self) -> &'static [DetectionStep];

    /// Environment variables holding an API key, in priority order
    fn api_key_vars(&self) -> &'static [&'static str];

    /// Turn a raw key into credentials, rejecting malformed keys
    fn classify_api_key(&self, key: &str) -> Result<Credentials>;

    async fn derive_service_account(&self, _path: &Path) -> Result<AuthContext> {
        Err(Error::AuthMethodUnavailable(self.provider()))
    }

    /// Minimal authenticated request used to check a credential
    async fn probe(&self, ctx: &AuthContext) -> Result<TokenStatus>;

    async fn initialize_auth(&self, options: &InitOptions) -> Result<AuthContext> {
        lifecycle::initialize_auth(self, options).await
    }

    async fn validate_auth(&self, ctx: &AuthContext) -> Result<()> {
        lifecycle::validate_auth(self, ctx).await
    }

    async fn refresh_auth(&self, ctx: &AuthContext) -> Result<AuthContext> {
        lifecycle::refresh_auth(self, ctx).await
    }

    /// Start a device or web flow without waiting for its code
    fn begin_authorization(&self, flow: FlowType) -> Result<PendingAuthorization> {
        self.oauth()
            .ok_or(Error::AuthMethodUnavailable(self.provider()))?
            .begin(flow)
    }

    /// Finish a flow started with [`ProviderAdapter::begin_authorization`]
    async fn complete_authorization(
        &self,
        pending: &PendingAuthorization,
        input: &str,
        session: &str,
    ) -> Result<AuthContext> {
        lifecycle::complete_authorization(self, pending, input, session).await
    }

    async fn complete_text(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse>;

    async fn complete_with_tools(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse>;

    async fn list_models(&self, ctx: &AuthContext) -> Result<Vec<ModelInfo>>;
}

/// Adapters keyed by provider
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All three vendors, configured from `config`
    pub fn from_config(config: &Config, runtime: AuthRuntime) -> Self {
        let oauth = |provider: Provider| {
            OAuthFlow::new(
                provider,
                load_oauth_config(provider, config.oauth.get(provider.as_str()), runtime.env.as_ref()),
                runtime.http.clone(),
            )
        };

        let mut registry = Self::new();
        registry.register(Arc::new(AnthropicAdapter::new(
            runtime.clone(),
            oauth(Provider::Anthropic),
            config.providers.anthropic.clone(),
        )));
        registry.register(Arc::new(OpenAiAdapter::new(
            runtime.clone(),
            oauth(Provider::OpenAi),
            config.providers.openai.clone(),
        )));
        registry.register(Arc::new(GeminiAdapter::new(
            runtime.clone(),
            oauth(Provider::Gemini),
            config.providers.gemini.clone(),
        )));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Config(format!("No adapter registered for {provider}")))
    }

    /// Registered providers in stable order
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }
}
