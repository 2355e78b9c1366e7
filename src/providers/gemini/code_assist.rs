//! Code Assist API (cloudcode-pa.googleapis.com)
//!
//! OAuth and service-account credentials cannot call the public Gemini API;
//! they go through the internal Code Assist endpoint the Gemini CLI uses.
//! Every session runs an onboarding handshake once (`loadCodeAssist`, then
//! `onboardUser` until its operation reports `done`) to learn the cloud
//! project its requests are billed to.

use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{self, GenerateContentResponse};
use crate::auth::env::{first_var, Environment};
use crate::auth::lifecycle::TokenStatus;
use crate::auth::AuthContext;
use crate::config::GeminiSettings;
use crate::error::Error;
use crate::providers::http;
use crate::providers::types::CompletionResponse;
use crate::Result;

pub const DEFAULT_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const API_VERSION: &str = "v1internal";

const USER_AGENT: &str = "google-api-nodejs-client/maestro";
const API_CLIENT: &str = "gl-node/maestro";

const PROJECT_VARS: &[&str] = &["GOOGLE_CLOUD_PROJECT", "GOOGLE_CLOUD_PROJECT_ID"];
const FALLBACK_TIER: &str = "free-tier";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEFAULT_MAX_ATTEMPTS: u32 = 24;

/// Result of the onboarding handshake for one named session
#[derive(Debug, Clone)]
struct Onboarded {
    project: String,
    session_id: String,
}

pub struct CodeAssistClient {
    http: Client,
    base_url: String,
    poll_interval: Duration,
    max_attempts: u32,
    sessions: Mutex<HashMap<String, Onboarded>>,
}

impl CodeAssistClient {
    pub fn new(http: Client, settings: &GeminiSettings) -> Self {
        Self {
            http,
            base_url: settings
                .code_assist_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            poll_interval: Duration::from_millis(
                settings
                    .onboard_poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            max_attempts: settings
                .onboard_max_attempts
                .unwrap_or(DEFAULT_MAX_ATTEMPTS)
                .max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/{}:{}",
            self.base_url.trim_end_matches('/'),
            API_VERSION,
            method
        )
    }

    fn post(&self, method: &str, access_token: &str) -> RequestBuilder {
        self.http
            .post(self.url(method))
            .header("User-Agent", USER_AGENT)
            .header("X-Goog-Api-Client", API_CLIENT)
            .bearer_auth(access_token)
    }

    /// `loadCodeAssist` doubles as the probe request
    pub async fn probe(&self, access_token: &str) -> Result<TokenStatus> {
        let response = self
            .post("loadCodeAssist", access_token)
            .json(&json!({"metadata": metadata(None)}))
            .send()
            .await?;
        Ok(TokenStatus::from_response(response).await)
    }

    /// Project for `ctx`, onboarding on first use of its session
    pub async fn project_for(&self, ctx: &AuthContext, env: &dyn Environment) -> Result<String> {
        Ok(self.onboarded(ctx, env).await?.project)
    }

    async fn onboarded(&self, ctx: &AuthContext, env: &dyn Environment) -> Result<Onboarded> {
        if let Some(done) = self.sessions.lock().await.get(ctx.session()) {
            return Ok(done.clone());
        }

        let known = ctx
            .config_str("project")
            .map(str::to_string)
            .or_else(|| first_var(env, PROJECT_VARS));
        let project = self.handshake(ctx.credentials.secret(), known).await?;
        tracing::info!("Code Assist project for session '{}': {}", ctx.session(), project);

        let done = Onboarded {
            project,
            session_id: Uuid::new_v4().to_string(),
        };
        self.sessions
            .lock()
            .await
            .insert(ctx.session().to_string(), done.clone());
        Ok(done)
    }

    async fn handshake(&self, access_token: &str, known: Option<String>) -> Result<String> {
        let mut body = json!({"metadata": metadata(known.as_deref())});
        if let Some(project) = &known {
            body["cloudaicompanionProject"] = json!(project);
        }

        let response = self
            .post("loadCodeAssist", access_token)
            .json(&body)
            .send()
            .await?;

        let mut tier = FALLBACK_TIER.to_string();
        if response.status().is_success() {
            let data: Value = http::decode_json(response).await?;
            tracing::debug!("loadCodeAssist response: {}", data);

            if data.get("currentTier").is_some() {
                if let Some(project) = known.clone().or_else(|| project_id(&data)) {
                    return Ok(project);
                }
            }
            if let Some(default) = default_tier(&data) {
                tier = default;
            }
        } else {
            let (status, body) = http::status_and_text(response).await;
            if matches!(status, 401 | 403) {
                return Err(Error::TokenExpired);
            }
            tracing::warn!("loadCodeAssist failed ({}): {}, attempting onboard", status, body);
        }

        self.onboard(access_token, &tier, known).await
    }

    /// Call `onboardUser` until the returned operation is done
    async fn onboard(&self, access_token: &str, tier: &str, known: Option<String>) -> Result<String> {
        let mut body = json!({
            "tierId": tier,
            "metadata": metadata(known.as_deref()),
        });
        if let Some(project) = &known {
            body["cloudaicompanionProject"] = json!(project);
        }

        for attempt in 1..=self.max_attempts {
            let response = self
                .post("onboardUser", access_token)
                .json(&body)
                .send()
                .await?;
            let response = http::ensure_success(response).await?;
            let operation: Value = http::decode_json(response).await?;

            if operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
                return operation
                    .get("response")
                    .and_then(project_id)
                    .or(known)
                    .ok_or_else(|| {
                        Error::Config(
                            "Code Assist did not provision a project. Set GOOGLE_CLOUD_PROJECT."
                                .to_string(),
                        )
                    });
            }

            tracing::debug!(
                "onboardUser not done (attempt {}/{})",
                attempt,
                self.max_attempts
            );
            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(Error::Config(format!(
            "Code Assist onboarding did not finish after {} attempts",
            self.max_attempts
        )))
    }

    /// `generateContent` wrapped in the Code Assist envelope
    pub async fn generate(
        &self,
        ctx: &AuthContext,
        env: &dyn Environment,
        model: &str,
        mut request: Value,
    ) -> Result<CompletionResponse> {
        let session = self.onboarded(ctx, env).await?;
        request["session_id"] = json!(session.session_id);

        let envelope = json!({
            "model": model,
            "project": session.project,
            "user_prompt_id": Uuid::new_v4().to_string(),
            "request": request,
        });

        tracing::debug!("POST {}", self.url("generateContent"));
        let response = self
            .post("generateContent", ctx.credentials.secret())
            .json(&envelope)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;

        let mut wrapped: Value = http::decode_json(response).await?;
        let inner = wrapped
            .get_mut("response")
            .map(Value::take)
            .ok_or_else(|| Error::DecodeFailed("missing 'response' in Code Assist reply".to_string()))?;
        let parsed: GenerateContentResponse = serde_json::from_value(inner)
            .map_err(|e| Error::DecodeFailed(e.to_string()))?;
        types::into_completion(parsed, model)
    }
}

fn metadata(project: Option<&str>) -> Value {
    let mut metadata = json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI",
    });
    if let Some(project) = project {
        metadata["duetProject"] = json!(project);
    }
    metadata
}

/// `cloudaicompanionProject` as either a bare id or `{ "id": ... }`
fn project_id(data: &Value) -> Option<String> {
    let project = data.get("cloudaicompanionProject")?;
    project
        .as_str()
        .or_else(|| project.get("id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn default_tier(data: &Value) -> Option<String> {
    data.get("allowedTiers")?
        .as_array()?
        .iter()
        .find(|t| t.get("isDefault").and_then(Value::as_bool).unwrap_or(false))
        .and_then(|t| t.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{FakeEnv, OAuthTokens, Provider};
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn client(base_url: &str) -> CodeAssistClient {
        CodeAssistClient::new(
            Client::new(),
            &GeminiSettings {
                code_assist_url: Some(base_url.to_string()),
                onboard_poll_interval_ms: Some(1),
                onboard_max_attempts: Some(3),
                ..Default::default()
            },
        )
    }

    fn ctx() -> AuthContext {
        AuthContext::oauth(Provider::Gemini, OAuthTokens::new("ya29.token", None, None))
    }

    #[test]
    fn test_project_id_shapes() {
        assert_eq!(
            project_id(&json!({"cloudaicompanionProject": "p-1"})).as_deref(),
            Some("p-1")
        );
        assert_eq!(
            project_id(&json!({"cloudaicompanionProject": {"id": "p-2", "name": "x"}})).as_deref(),
            Some("p-2")
        );
        assert_eq!(project_id(&json!({})), None);
    }

    #[tokio::test]
    async fn test_existing_tier_uses_returned_project_once_per_session() {
        let mut server = mockito::Server::new_async().await;
        let load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .match_header("authorization", "Bearer ya29.token")
            .match_header("x-goog-api-client", API_CLIENT)
            .with_status(200)
            .with_body(r#"{"currentTier":{"id":"free-tier"},"cloudaicompanionProject":"companion-1"}"#)
            .expect(1)
            .create_async()
            .await;

        let ca = client(&server.url());
        let env = FakeEnv::new();
        assert_eq!(ca.project_for(&ctx(), &env).await.unwrap(), "companion-1");
        assert_eq!(ca.project_for(&ctx(), &env).await.unwrap(), "companion-1");
        load.assert_async().await;
    }

    #[tokio::test]
    async fn test_env_project_takes_priority() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .match_body(Matcher::PartialJson(json!({"cloudaicompanionProject": "env-project"})))
            .with_status(200)
            .with_body(r#"{"currentTier":{"id":"standard-tier"},"cloudaicompanionProject":"other"}"#)
            .create_async()
            .await;

        let ca = client(&server.url());
        let env = FakeEnv::new().with_var("GOOGLE_CLOUD_PROJECT", "env-project");
        assert_eq!(ca.project_for(&ctx(), &env).await.unwrap(), "env-project");
    }

    #[tokio::test]
    async fn test_onboarding_polls_until_done() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(200)
            .with_body(r#"{"allowedTiers":[{"id":"legacy-tier"},{"id":"free-tier","isDefault":true}]}"#)
            .create_async()
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let onboard = server
            .mock("POST", "/v1internal:onboardUser")
            .match_body(Matcher::PartialJson(json!({"tierId": "free-tier"})))
            .with_status(200)
            .with_body_from_request(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    br#"{"name":"operations/1","done":false}"#.to_vec()
                } else {
                    br#"{"name":"operations/1","done":true,"response":{"cloudaicompanionProject":{"id":"onboarded-7"}}}"#.to_vec()
                }
            })
            .expect(2)
            .create_async()
            .await;

        let ca = client(&server.url());
        assert_eq!(
            ca.project_for(&ctx(), &FakeEnv::new()).await.unwrap(),
            "onboarded-7"
        );
        onboard.assert_async().await;
    }

    #[tokio::test]
    async fn test_onboarding_gives_up() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(500)
            .create_async()
            .await;
        let onboard = server
            .mock("POST", "/v1internal:onboardUser")
            .with_status(200)
            .with_body(r#"{"done":false}"#)
            .expect(3)
            .create_async()
            .await;

        let ca = client(&server.url());
        let err = ca.project_for(&ctx(), &FakeEnv::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        onboard.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_handshake_is_token_expired() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(401)
            .create_async()
            .await;

        let ca = client(&server.url());
        assert!(matches!(
            ca.project_for(&ctx(), &FakeEnv::new()).await,
            Err(Error::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_generate_unwraps_envelope() {
        let mut server = mockito::Server::new_async().await;
        let _load = server
            .mock("POST", "/v1internal:loadCodeAssist")
            .with_status(200)
            .with_body(r#"{"currentTier":{"id":"free-tier"}}"#)
            .create_async()
            .await;
        let generate = server
            .mock("POST", "/v1internal:generateContent")
            .match_body(Matcher::PartialJson(json!({
                "model": "gemini-2.5-pro",
                "project": "ctx-project",
                "request": {"contents": [{"role": "user"}]}
            })))
            .with_status(200)
            .with_body(
                r#"{"response":{"candidates":[{"content":{"parts":[{"text":"pong"}]},"finishReason":"STOP"}]}}"#,
            )
            .create_async()
            .await;

        let ca = client(&server.url());
        let ctx = ctx().with_config("project", json!("ctx-project"));
        let request = json!({"contents": [{"role": "user", "parts": [{"text": "ping"}]}]});

        let response = ca
            .generate(&ctx, &FakeEnv::new(), "gemini-2.5-pro", request)
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("pong"));
        generate.assert_async().await;
    }
}
