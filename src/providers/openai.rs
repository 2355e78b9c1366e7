//! OpenAI Chat Completions adapter
//!
//! Both API keys and OAuth access tokens are sent as bearer tokens. OAuth
//! traffic additionally names its `originator` and the ChatGPT account the
//! token was issued for.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http;
use super::types::{
    CompletionOptions, CompletionResponse, Message, ModelInfo, Role, ToolCallRequest, Usage,
};
use super::{AuthRuntime, ProviderAdapter};
use crate::auth::context::from_unix_secs;
use crate::auth::detect::DetectionStep;
use crate::auth::lifecycle::TokenStatus;
use crate::auth::oauth::OAuthFlow;
use crate::auth::{AuthContext, Credentials, OAuthTokens, Provider};
use crate::config::ProviderSettings;
use crate::error::Error;
use crate::Result;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o";

const ORIGINATOR: &str = "codex_cli_rs";
const AUTH_CLAIM: &str = "https://api.openai.com/auth";

const DETECTION_CHAIN: &[DetectionStep] = &[
    DetectionStep::ApiKey,
    DetectionStep::CachedOAuth,
    DetectionStep::Interactive,
];

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct OpenAiAdapter {
    runtime: AuthRuntime,
    oauth: OAuthFlow,
    base_url: String,
    model: String,
}

impl OpenAiAdapter {
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

    fn authorize(&self, builder: RequestBuilder, ctx: &AuthContext) -> RequestBuilder {
        let builder = builder.bearer_auth(ctx.credentials.secret());
        match &ctx.credentials {
            Credentials::ApiKey { .. } => builder,
            other => {
                let builder = builder.header("originator", ORIGINATOR);
                match chatgpt_account_id(other.secret()) {
                    Some(account) => builder.header("chatgpt-account-id", account),
                    None => builder,
                }
            }
        }
    }

    fn build_body(&self, messages: &[Message], options: &CompletionOptions, with_tools: bool) -> Value {
        let mut body = json!({
            "model": options.model.clone().unwrap_or_else(|| self.model.clone()),
            "max_tokens": options.max_tokens,
            "messages": messages.iter().map(convert_message).collect::<Vec<_>>(),
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if with_tools && !options.tools.is_empty() {
            body["tools"] = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
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
        ctx.ensure_provider(Provider::OpenAi)?;
        let body = self.build_body(messages, options, with_tools);
        let url = self.url("/v1/chat/completions");
        tracing::debug!("POST {}", url);

        let response = self
            .authorize(self.runtime.http.post(&url), ctx)
            .json(&body)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let parsed: ChatResponse = http::decode_json(response).await?;
        into_completion(parsed, &body)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
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
        &["OPENAI_API_KEY"]
    }

    /// `sk-…` is an API key; a JWT is an OAuth access token whose `exp`
    /// claim becomes the expiry.
    fn classify_api_key(&self, key: &str) -> Result<Credentials> {
        let key = key.trim();
        if key.starts_with("sk-") {
            return Ok(Credentials::ApiKey {
                key: key.to_string(),
            });
        }
        if let Some(claims) = jwt_claims(key) {
            let mut tokens = OAuthTokens::new(key, None, None);
            tokens.expires_at = claims.get("exp").and_then(Value::as_i64).and_then(from_unix_secs);
            return Ok(Credentials::OAuth(tokens));
        }
        Err(Error::InvalidApiKey(
            "OpenAI keys start with 'sk-' (or are OAuth JWTs)".to_string(),
        ))
    }

    async fn probe(&self, ctx: &AuthContext) -> Result<TokenStatus> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = self
            .authorize(self.runtime.http.post(self.url("/v1/chat/completions")), ctx)
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
        ctx.ensure_provider(Provider::OpenAi)?;
        let response = self
            .authorize(self.runtime.http.get(self.url("/v1/models")), ctx)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let models: ModelsResponse = http::decode_json(response).await?;

        let mut out: Vec<ModelInfo> = models
            .data
            .into_iter()
            .map(|m| ModelInfo {
                display_name: m.id.clone(),
                id: m.id,
                provider: Provider::OpenAi,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/// Decode the (unverified) claims of a JWT
fn jwt_claims(token: &str) -> Option<serde_json::Map<String, Value>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn chatgpt_account_id(token: &str) -> Option<String> {
    jwt_claims(token)?
        .get(AUTH_CLAIM)?
        .get("chatgpt_account_id")?
        .as_str()
        .map(str::to_string)
}

fn convert_message(m: &Message) -> Value {
    match m.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if !m.tool_calls.is_empty() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        role => {
            let role = match role {
                Role::System => "system",
                Role::Assistant => "assistant",
                _ => "user",
            };
            json!({"role": role, "content": m.content})
        }
    }
}

fn into_completion(response: ChatResponse, request: &Value) -> Result<CompletionResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::DecodeFailed("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCallRequest {
            id: tc.id,
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments)),
            name: tc.function.name,
        })
        .collect();

    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        usage,
        model: response
            .model
            .or_else(|| request["model"].as_str().map(str::to_string))
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::encryption::SecretEncryptor;
    use crate::auth::oauth_config::builtin_defaults;
    use crate::auth::prompt::ScriptedPrompt;
    use crate::auth::{AuthMethod, CredentialCache, CredentialStore, FakeEnv};
    use crate::providers::types::ToolDefinition;
    use mockito::Matcher;
    use std::sync::Arc;

    async fn adapter(base_url: &str) -> OpenAiAdapter {
        let store = CredentialStore::in_memory(SecretEncryptor::new(&[2; 32]).unwrap())
            .await
            .unwrap();
        let runtime = AuthRuntime::new(
            Arc::new(FakeEnv::new()),
            CredentialCache::memory(),
            store,
            Arc::new(ScriptedPrompt::new("code")),
            reqwest::Client::new(),
        );
        let oauth = OAuthFlow::new(
            Provider::OpenAi,
            builtin_defaults(Provider::OpenAi),
            reqwest::Client::new(),
        );
        OpenAiAdapter::new(
            runtime,
            oauth,
            ProviderSettings {
                model: None,
                base_url: Some(base_url.to_string()),
            },
        )
    }

    fn fake_jwt(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[tokio::test]
    async fn test_classify_jwt_as_oauth_with_expiry() {
        let a = adapter("http://unused").await;
        let jwt = fake_jwt(json!({"exp": 1_900_000_000, "sub": "user"}));

        let creds = a.classify_api_key(&jwt).unwrap();
        assert_eq!(creds.method(), AuthMethod::OAuth);
        assert_eq!(creds.expires_at(), from_unix_secs(1_900_000_000));

        assert_eq!(
            a.classify_api_key("sk-proj-abc").unwrap().method(),
            AuthMethod::ApiKey
        );
        assert!(a.classify_api_key("AIza-nope").is_err());
    }

    #[test]
    fn test_account_id_from_claims() {
        let jwt = fake_jwt(json!({
            AUTH_CLAIM: {"chatgpt_account_id": "acct_123"}
        }));
        assert_eq!(chatgpt_account_id(&jwt).as_deref(), Some("acct_123"));
        assert_eq!(chatgpt_account_id("sk-plain"), None);
    }

    #[tokio::test]
    async fn test_oauth_headers() {
        let mut server = mockito::Server::new_async().await;
        let jwt = fake_jwt(json!({AUTH_CLAIM: {"chatgpt_account_id": "acct_9"}}));
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", format!("Bearer {jwt}").as_str())
            .match_header("originator", ORIGINATOR)
            .match_header("chatgpt-account-id", "acct_9")
            .with_status(200)
            .with_body(
                r#"{"model":"gpt-4o","choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#,
            )
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::oauth(Provider::OpenAi, OAuthTokens::new(jwt, None, None));
        let response = a
            .complete_text(&ctx, &[Message::user("hello")], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("hi"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_key_has_no_oauth_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("originator", Matcher::Missing)
            .match_body(Matcher::PartialJson(json!({
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"ok"},"finish_reason":"stop"}],"usage":{"prompt_tokens":4,"completion_tokens":1,"total_tokens":5}}"#)
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::api_key(Provider::OpenAi, "sk-test");
        let response = a
            .complete_text(
                &ctx,
                &[Message::system("Be brief."), Message::user("hello")],
                &CompletionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.usage.total_tokens, 5);
        assert_eq!(response.model, DEFAULT_MODEL);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_tool_calls_round_trip_arguments_as_strings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({
                "tools": [{"type": "function", "function": {"name": "lookup"}}],
                "messages": [
                    {"role": "user", "content": "find it"},
                    {"role": "assistant", "tool_calls": [
                        {"id": "call_0", "function": {"arguments": "{\"q\":\"first\"}"}}
                    ]},
                    {"role": "tool", "tool_call_id": "call_0", "content": "nothing"}
                ]
            })))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"content":null,"tool_calls":[
                    {"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\":\"rust\"}"}}
                ]},"finish_reason":"tool_calls"}]}"#,
            )
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::api_key(Provider::OpenAi, "sk-test");
        let options = CompletionOptions::default().with_tools(vec![ToolDefinition {
            name: "lookup".into(),
            description: "Search".into(),
            parameters: json!({"type": "object"}),
        }]);
        let history = vec![
            Message::user("find it"),
            Message::assistant_with_tools(
                "",
                vec![ToolCallRequest {
                    id: "call_0".into(),
                    name: "lookup".into(),
                    arguments: json!({"q": "first"}),
                }],
            ),
            Message::tool_result("call_0", "lookup", "nothing"),
        ];

        let response = a.complete_with_tools(&ctx, &history, &options).await.unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.finish_reason, "tool_calls");
        assert_eq!(response.tool_calls[0].arguments["q"], "rust");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_forbidden_is_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({"max_tokens": 1})))
            .with_status(403)
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::api_key(Provider::OpenAi, "sk-test");
        assert_eq!(a.probe(&ctx).await.unwrap(), TokenStatus::Expired);
    }

    #[tokio::test]
    async fn test_list_models_sorted() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(r#"{"object":"list","data":[{"id":"gpt-4o"},{"id":"gpt-4.1"}]}"#)
            .create_async()
            .await;

        let a = adapter(&server.url()).await;
        let ctx = AuthContext::api_key(Provider::OpenAi, "sk-test");
        let ids: Vec<_> = a
            .list_models(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["gpt-4.1", "gpt-4o"]);
    }
}
