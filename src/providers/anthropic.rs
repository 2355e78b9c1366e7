//! Anthropic Messages API adapter
//!
//! API keys authenticate with `x-api-key`. OAuth bearer tokens are only
//! accepted when the request identifies itself as the official CLI, so OAuth
//! traffic carries the CLI header set, the OAuth beta flags and a fixed first
//! system block.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http;
use super::types::{
    system_text, CompletionOptions, CompletionResponse, Message, ModelInfo, Role,
    ToolCallRequest, Usage,
};
use super::{AuthRuntime, ProviderAdapter};
use crate::auth::detect::DetectionStep;
use crate::auth::lifecycle::TokenStatus;
use crate::auth::oauth::OAuthFlow;
use crate::auth::{AuthContext, AuthMethod, Credentials, OAuthTokens, Provider};
use crate::config::ProviderSettings;
use crate::error::Error;
use crate::Result;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";

const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";
const API_KEY_PREFIX: &str = "sk-ant-";

const OAUTH_BETA: &str = "oauth-2025-04-20,claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";
const CLI_VERSION: &str = "2.0.14";
const CLI_SYSTEM_PROMPT: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

const DETECTION_CHAIN: &[DetectionStep] = &[
    DetectionStep::ApiKey,
    DetectionStep::CachedOAuth,
    DetectionStep::Interactive,
];

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

pub struct AnthropicAdapter {
    runtime: AuthRuntime,
    oauth: OAuthFlow,
    base_url: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(runtime: AuthRuntime, oauth: OAuthFlow, settings: ProviderSettings) -> Self {
        Self {
            runtime,
            oauth,
            base_url: settings
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: settings.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Attach auth and identification headers for the credential kind
    fn authorize(&self, builder: RequestBuilder, ctx: &AuthContext) -> RequestBuilder {
        let builder = builder.header("anthropic-version", API_VERSION);
        match &ctx.credentials {
            Credentials::ApiKey { key } => builder.header("x-api-key", key),
            other => cli_headers(builder)
                .bearer_auth(other.secret())
                .header("anthropic-beta", OAUTH_BETA),
        }
    }

    fn build_body(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
        with_tools: bool,
    ) -> Value {
        let mut body = json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "max_tokens": options.max_tokens,
            "messages": convert_messages(messages),
        });

        let system = system_text(messages);
        if ctx.method() == AuthMethod::ApiKey {
            if let Some(system) = system {
                body["system"] = Value::String(system);
            }
        } else {
            let mut blocks = vec![json!({"type": "text", "text": CLI_SYSTEM_PROMPT})];
            if let Some(system) = system {
                blocks.push(json!({"type": "text", "text": system}));
            }
            body["system"] = Value::Array(blocks);
        }

        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if with_tools && !options.tools.is_empty() {
            body["tools"] = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        body
    }

    async fn send(
        &self,
        ctx: &AuthContext,
        messages: &[Message],
        options: &CompletionOptions,
        with_tools: bool,
    ) -> Result<CompletionResponse> {
        ctx.ensure_provider(Provider::Anthropic)?;
        let body = self.build_body(ctx, messages, options, with_tools);
        let url = self.url("/v1/messages");
        tracing::debug!("POST {}", url);

        let response = self
            .authorize(self.runtime.http.post(&url), ctx)
            .json(&body)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let parsed: MessagesResponse = http::decode_json(response).await?;
        Ok(into_completion(parsed, &body))
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
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
        &["ANTHROPIC_API_KEY"]
    }

    /// `sk-ant-oat…` tokens are OAuth access tokens even when supplied as a
    /// key; their expiry is only discovered by probing.
    fn classify_api_key(&self, key: &str) -> Result<Credentials> {
        let key = key.trim();
        if key.starts_with(OAUTH_TOKEN_PREFIX) {
            Ok(Credentials::OAuth(OAuthTokens::new(key, None, None)))
        } else if key.starts_with(API_KEY_PREFIX) {
            Ok(Credentials::ApiKey {
                key: key.to_string(),
            })
        } else {
            Err(Error::InvalidApiKey(format!(
                "Anthropic keys start with '{API_KEY_PREFIX}'"
            )))
        }
    }

    async fn probe(&self, ctx: &AuthContext) -> Result<TokenStatus> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        if ctx.method() != AuthMethod::ApiKey {
            body["system"] = json!([{"type": "text", "text": CLI_SYSTEM_PROMPT}]);
        }

        let response = self
            .authorize(self.runtime.http.post(self.url("/v1/messages")), ctx)
            .json(&body)
            .send()
            .await?;
        Ok(TokenStatus::from_response(response).await)
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
        ctx.ensure_provider(Provider::Anthropic)?;
        let response = self
            .authorize(self.runtime.http.get(self.url("/v1/models")), ctx)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let models: ModelsResponse = http::decode_json(response).await?;

        Ok(models
            .data
            .into_iter()
            .map(|m| ModelInfo {
                display_name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                provider: Provider::Anthropic,
            })
            .collect())
    }
}

/// Headers the CLI sends; required for OAuth bearer traffic
fn cli_headers(builder: RequestBuilder) -> RequestBuilder {
    let os = match std::env::consts::OS {
        "macos" => "MacOS",
        "windows" => "Windows",
        "linux" => "Linux",
        other => other,
    };
    builder
        .header("user-agent", format!("claude-cli/{CLI_VERSION} (external, cli)"))
        .header("x-app", "cli")
        .header("anthropic-dangerous-direct-browser-access", "true")
        .header("x-stainless-lang", "js")
        .header("x-stainless-package-version", "0.60.0")
        .header("x-stainless-os", os)
        .header("x-stainless-arch", std::env::consts::ARCH)
        .header("x-stainless-runtime", "node")
        .header("x-stainless-runtime-version", "v22.19.0")
        .header("x-stainless-retry-count", "0")
        .header("x-stainless-timeout", "600")
}

/// Map neutral messages onto Anthropic turns.
///
/// System messages are lifted to the top-level `system` field; tool results
/// become `user` turns carrying a `tool_result` block.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| match m.role {
            Role::Tool => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                }],
            }),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for call in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                json!({"role": "assistant", "content": blocks})
            }
            Role::Assistant => json!({"role": "assistant", "content": m.content}),
            _ => json!({"role": "user", "content": m.content}),
        })
        .collect()
}

fn into_completion(response: MessagesResponse, request: &Value) -> CompletionResponse {
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block.kind.as_str() {
            "text" => text.extend(block.text),
            "tool_use" => {
                if let (Some(id), Some(name)) = (block.id, block.name) {
                    tool_calls.push(ToolCallRequest {
                        id,
                        name,
                        arguments: block.input.unwrap_or(Value::Object(Default::default())),
                    });
                }
            }
            _ => {}
        }
    }

    let finish_reason = match response.stop_reason.as_deref() {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    };
    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        })
        .unwrap_or_default();

    CompletionResponse {
        content: if text.is_empty() { None } else { Some(text.join("")) },
        tool_calls,
        finish_reason: finish_reason.to_string(),
        usage,
        model: response
            .model
            .or_else(|| request["model"].as_str().map(str::to_string))
            .unwrap_or_default(),
    }
}
