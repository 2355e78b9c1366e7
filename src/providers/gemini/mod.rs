//! Google Gemini adapter
//!
//! API keys call the public Generative Language API. OAuth and
//! service-account tokens are routed through Code Assist (see
//! [`code_assist`]), which needs a per-session onboarding handshake.

pub mod code_assist;
mod types;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;

use super::http;
use super::types::{CompletionOptions, CompletionResponse, Message, ModelInfo};
use super::{AuthRuntime, ProviderAdapter};
use crate::auth::detect::DetectionStep;
use crate::auth::lifecycle::TokenStatus;
use crate::auth::oauth::OAuthFlow;
use crate::auth::service_account;
use crate::auth::{AuthContext, Credentials, Provider};
use crate::config::GeminiSettings;
use crate::error::Error;
use crate::Result;

use code_assist::CodeAssistClient;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

const API_KEY_PREFIX: &str = "AIza";

/// Models served through Code Assist, which has no listing endpoint
const CODE_ASSIST_MODELS: &[(&str, &str)] = &[
    ("gemini-2.5-pro", "Gemini 2.5 Pro"),
    ("gemini-2.5-flash", "Gemini 2.5 Flash"),
    ("gemini-2.5-flash-lite", "Gemini 2.5 Flash-Lite"),
];

const DETECTION_CHAIN: &[DetectionStep] = &[
    DetectionStep::ApiKey,
    DetectionStep::ServiceAccount,
    DetectionStep::CachedOAuth,
    DetectionStep::Interactive,
];

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

pub struct GeminiAdapter {
    runtime: AuthRuntime,
    oauth: OAuthFlow,
    base_url: String,
    model: String,
    code_assist: CodeAssistClient,
}

impl GeminiAdapter {
    pub fn new(runtime: AuthRuntime, oauth: OAuthFlow, settings: GeminiSettings) -> Self {
        let code_assist = CodeAssistClient::new(runtime.http.clone(), &settings);
        Self {
            runtime,
            oauth,
            base_url: settings
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: settings.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            code_assist,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn generate_url(&self, model: &str) -> String {
        self.url(&format!("/v1beta/models/{model}:generateContent"))
    }

    async fn send(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
        with_tools: bool,
    ) -> Result<CompletionResponse> {
        ctx.ensure_provider(Provider::Gemini)?;
        let model = options.model.clone().unwrap_or_else(|| self.model.clone());
        let tools = if with_tools {
            types::convert_tools(&options.tools)
        } else {
            None
        };

        match &ctx.credentials {
            Credentials::ApiKey { key } => {
                let mut body = json!({
                    "contents": types::build_contents(messages, false),
                    "generationConfig": types::generation_config(options),
                });
                if let Some(system) = types::system_instruction(messages) {
                    body["systemInstruction"] = system;
                }
                if let Some(tools) = tools {
                    body["tools"] = tools;
                }

                let url = self.generate_url(&model);
                tracing::debug!("POST {}", url);
                let response = self
                    .runtime
                    .http
                    .post(&url)
                    .header("x-goog-api-key", key)
                    .json(&body)
                    .send()
                    .await?;
                let response = http::ensure_success(response).await?;
                let parsed: types::GenerateContentResponse = http::decode_json(response).await?;
                types::into_completion(parsed, &model)
            }
            _ => {
                let mut request = json!({
                    "contents": types::build_contents(messages, true),
                    "generationConfig": types::generation_config(options),
                });
                if let Some(tools) = tools {
                    request["tools"] = tools;
                }
                self.code_assist
                    .generate(ctx, self.runtime.env.as_ref(), &model, request)
                    .await
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn runtime(&self) -> &AuthRuntime {
        &self.runtime
    }

    fn oauth(&self) -> Option<&OAuthFlow> {
        Some(&self.oauth)
    }

    fn detection_chain(&self) -> &'static [DetectionStep] {
        DETECTION_CHAIN
    }

    fn api_key_vars(&self) -> &'static [&'static str] {
        &["GEMINI_API_KEY", "GOOGLE_API_KEY"]
    }

    fn classify_api_key(&self, key: &str) -> Result<Credentials> {
        let key = key.trim();
        if key.starts_with(API_KEY_PREFIX) {
            Ok(Credentials::ApiKey {
                key: key.to_string(),
            })
        } else {
            Err(Error::InvalidApiKey(format!(
                "Gemini API keys start with '{API_KEY_PREFIX}'"
            )))
        }
    }

    async fn derive_service_account(&self, path: &Path) -> Result<AuthContext> {
        service_account::derive_context(&self.runtime.http, path).await
    }

    async fn probe(&self, ctx: &AuthContext) -> Result<TokenStatus> {
        match &ctx.credentials {
            Credentials::ApiKey { key } => {
                let body = json!({
                    "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
                    "generationConfig": {"maxOutputTokens": 1},
                });
                let response = self
                    .runtime
                    .http
                    .post(self.generate_url(&self.model))
                    .header("x-goog-api-key", key)
                    .json(&body)
                    .send()
                    .await?;
                Ok(TokenStatus::from_response(response).await)
            }
            other => self.code_assist.probe(other.secret()).await,
        }
    }

    async fn complete_text(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        self.send(ctx, messages, options, false).await
    }

    async fn complete_with_tools(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        self.send(ctx, messages, options, true).await
    }

    async fn list_models(&self, ctx: &AuthContext) -> Result<Vec<ModelInfo>> {
        ctx.ensure_provider(Provider::Gemini)?;
        let Credentials::ApiKey { key } = &ctx.credentials else {
            return Ok(CODE_ASSIST_MODELS
                .iter()
                .map(|(id, name)| ModelInfo {
                    id: id.to_string(),
                    display_name: name.to_string(),
                    provider: Provider::Gemini,
                })
                .collect());
        };

        let response = self
            .runtime
            .http
            .get(self.url("/v1beta/models"))
            .header("x-goog-api-key", key)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let listed: ModelsResponse = http::decode_json(response).await?;

        Ok(listed
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|g| g == "generateContent")
            })
            .map(|m| {
                let id = m
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&m.name)
                    .to_string();
                ModelInfo {
                    display_name: m.display_name.unwrap_or_else(|| id.clone()),
                    id,
                    provider: Provider::Gemini,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::encryption::SecretEncryptor;
    use crate::auth::oauth_config::builtin_defaults;
    use crate::auth::prompt::ScriptedPrompt;
    use crate::auth::service_account::tests::write_key_file;
    use crate::auth::{
        AuthMethod, CredentialCache, CredentialStore, FakeEnv, InitOptions, OAuthTokens,
    };
    use crate::providers::types::ToolDefinition;
    use mockito::Matcher;
    use std::sync::Arc;

    async fn adapter_with_env(server_url: &str, env: FakeEnv) -> GeminiAdapter {
        let store = CredentialStore::in_memory(SecretEncryptor::new(&[3; 32]).unwrap())
            .await
            .unwrap();
        let runtime = AuthRuntime::new(
            Arc::new(env),
            CredentialCache::memory(),
            store,
            Arc::new(ScriptedPrompt::new("code")),
            reqwest::Client::new(),
        );
        let mut config = builtin_defaults(Provider::Gemini);
        config.client_id = "test-client.apps.googleusercontent.com".to_string();
        let oauth = OAuthFlow::new(Provider::Gemini, config, reqwest::Client::new());
        GeminiAdapter::new(
            runtime,
            oauth,
            GeminiSettings {
                base_url: Some(server_url.to_string()),
                code_assist_url: Some(server_url.to_string()),
                onboard_poll_interval_ms: Some(1),
                ..Default::default()
            },
        )
    }

    async fn adapter(server_url: &str) -> GeminiAdapter {
        adapter_with_env(server_url, FakeEnv::new()).await
    }

    const TEXT_RESPONSE: &str =
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]},"finishReason":"STOP"}]}"#;

    #[tokio::test]
    async fn test_classify_api_key() {
        let a = adapter("http://unused").await;
        assert_eq!(
            a.classify_api_key("AIzaSyExample").unwrap().method(),
            AuthMethod::ApiKey
        );
        assert!(matches!(
            a.classify_api_key("sk-not-google"),
            Err(Error::InvalidApiKey(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_uses_public_endpoint_with_system_instruction() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.5-pro:generateContent")
            .match_header("x-goog-api-key", "AIzaKey")
            .match_body(Matcher::PartialJson(json!({
                "systemInstruction": {"parts": [{"text": "Be brief."}]},
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
                "generationConfig": {"maxOutputTokens": 4096}
            })))
            .with_status(200)
            .with_body(TEXT_RESPONSE)
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::api_key(Provider::Gemini, "AIzaKey");
        let response = a
            .complete_text(
                &ctx,
                &[Message::system("Be brief."), Message::user("hi")],
                &CompletionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello"));
        assert_eq!(response.finish_reason, "stop");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_oauth_routes_through_code_assist() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(200)
            .with_body(r#"{"currentTier":{"id":"free-tier"},"cloudaicompanionProject":"companion-1"}"#)
            .create_async()
            .await;
        let generate = server
            .mock("POST", "/v1internal:generateContent")
            .match_header("authorization", "Bearer ya29.access")
            .match_body(Matcher::PartialJson(json!({
                "project": "companion-1",
                "request": {
                    "contents": [
                        {"role": "user", "parts": [{"text": "Be brief."}]},
                        {"role": "user", "parts": [{"text": "hi"}]}
                    ],
                    "tools": [{"functionDeclarations": [{"name": "lookup"}]}]
                }
            })))
            .with_status(200)
            .with_body(format!(r#"{{"response":{TEXT_RESPONSE}}}"#))
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::oauth(Provider::Gemini, OAuthTokens::new("ya29.access", None, None));
        let options = CompletionOptions::default().with_tools(vec![ToolDefinition {
            name: "lookup".into(),
            description: "Search".into(),
            parameters: json!({"type": "object"}),
        }]);
        let response = a
            .complete_with_tools(&ctx, &[Message::system("Be brief."), Message::user("hi")], &options)
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello"));
        generate.assert_async().await;
    }

    #[tokio::test]
    async fn test_service_account_detected_from_env() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.sa","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = write_key_file(dir.path(), &format!("{}/token", server.url()));
        let env = FakeEnv::new().with_var(
            "GOOGLE_APPLICATION_CREDENTIALS",
            key_path.to_str().unwrap(),
        );
        let a = adapter_with_env(&server.url(), env).await;

        let ctx = a.initialize_auth(&InitOptions::default()).await.unwrap();
        assert_eq!(ctx.method(), AuthMethod::ServiceAccount);
        assert_eq!(ctx.credentials.secret(), "ya29.sa");
        assert_eq!(ctx.config_str("project"), Some("sa-project"));
        assert!(a.runtime().store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_env_api_key_wins_over_service_account() {
        let env = FakeEnv::new()
            .with_var("GOOGLE_API_KEY", "AIzaFromEnv")
            .with_var("GOOGLE_APPLICATION_CREDENTIALS", "/nonexistent.json");
        let a = adapter_with_env("http://unused", env).await;

        let ctx = a.initialize_auth(&InitOptions::default()).await.unwrap();
        assert_eq!(ctx.method(), AuthMethod::ApiKey);
        assert_eq!(ctx.credentials.secret(), "AIzaFromEnv");
    }

    #[tokio::test]
    async fn test_probe_per_credential_kind() {
        let mut server = mockito::Server::new_async().await;
        let _public = server
            .mock("POST", "/v1beta/models/gemini-2.5-pro:generateContent")
            .match_body(Matcher::PartialJson(json!({"generationConfig": {"maxOutputTokens": 1}})))
            .with_status(403)
            .create_async()
            .await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let api = AuthContext::api_key(Provider::Gemini, "AIzaKey");
        assert_eq!(a.probe(&api).await.unwrap(), TokenStatus::Expired);

        let oauth = AuthContext::oauth(Provider::Gemini, OAuthTokens::new("ya29.x", None, None));
        assert_eq!(a.probe(&oauth).await.unwrap(), TokenStatus::Valid);
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1beta/models")
            .with_status(200)
            .with_body(
                r#"{"models":[
                    {"name":"models/gemini-2.5-pro","displayName":"Gemini 2.5 Pro","supportedGenerationMethods":["generateContent","countTokens"]},
                    {"name":"models/text-embedding-004","supportedGenerationMethods":["embedContent"]}
                ]}"#,
            )
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let api = AuthContext::api_key(Provider::Gemini, "AIzaKey");
        let models = a.list_models(&api).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gemini-2.5-pro");

        let oauth = AuthContext::oauth(Provider::Gemini, OAuthTokens::new("ya29.x", None, None));
        assert_eq!(a.list_models(&oauth).await.unwrap().len(), CODE_ASSIST_MODELS.len());
    }
}
