//! OAuth2 flow engine
//!
//! Builds authorization URLs for the device flow (PKCE, out-of-band redirect,
//! pasted code) and the web flow (application callback, no PKCE), and runs
//! the code and refresh-token grants against the vendor token endpoint.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value};
use url::Url;

use super::context::{expiry_from_now, from_unix_secs, OAuthTokens, Provider};
use super::oauth_config::OAuthConfig;
use super::pkce::{generate_state, PkcePair};
use crate::error::Error;
use crate::providers::http;
use crate::Result;

/// Which OAuth flow to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowType {
    /// Out-of-band redirect; the user pastes the code back
    #[default]
    Device,
    /// Redirect to a callback owned by the embedding application
    Web,
}

/// An authorization in progress, waiting for its code
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAuthorization {
    pub provider: Provider,
    pub flow: FlowType,
    pub url: String,
    pub state: String,
    pub redirect_uri: String,
    /// Present for the device flow only
    pub pkce: Option<PkcePair>,
}

/// Authorization code plus the state echoed back with it, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub state: Option<String>,
}

/// Per-vendor OAuth flow runner
#[derive(Clone)]
pub struct OAuthFlow {
    provider: Provider,
    config: OAuthConfig,
    http: Client,
}

impl OAuthFlow {
    pub fn new(provider: Provider, config: OAuthConfig, http: Client) -> Self {
        Self {
            provider,
            config,
            http,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Start a flow with fresh state (and a fresh PKCE pair for the device flow)
    pub fn begin(&self, flow: FlowType) -> Result<PendingAuthorization> {
        let pkce = match flow {
            FlowType::Device => Some(PkcePair::new()),
            FlowType::Web => None,
        };
        self.begin_with(flow, generate_state(), pkce)
    }

    /// Start a flow with caller-supplied state and PKCE pair
    pub fn begin_with(
        &self,
        flow: FlowType,
        state: String,
        pkce: Option<PkcePair>,
    ) -> Result<PendingAuthorization> {
        if self.config.client_id.is_empty() {
            return Err(Error::Config(format!(
                "No OAuth client id configured for {}",
                self.provider
            )));
        }

        let redirect_uri = match flow {
            FlowType::Device => self.config.device_redirect_uri.clone(),
            FlowType::Web => self.config.web_redirect_uri.clone(),
        };

        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| Error::Config(format!("Invalid auth URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.config.scopes.join(" "))
                .append_pair("state", &state);
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", pkce.method());
            }
            for (key, value) in &self.config.extra_auth_params {
                query.append_pair(key, value);
            }
        }

        Ok(PendingAuthorization {
            provider: self.provider,
            flow,
            url: url.to_string(),
            state,
            redirect_uri,
            pkce,
        })
    }

    /// Finish a flow from the user's pasted input (or a callback query)
    pub async fn complete(
        &self,
        pending: &PendingAuthorization,
        input: &str,
    ) -> Result<OAuthTokens> {
        let parsed = parse_authorization_input(input)?;
        if let Some(returned) = &parsed.state {
            if returned != &pending.state {
                return Err(Error::OAuth(
                    "State mismatch; the authorization may have been tampered with".to_string(),
                ));
            }
        }
        self.exchange_code(pending, &parsed.code).await
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", pending.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(pkce) = &pending.pkce {
            form.push(("code_verifier", pkce.verifier.clone()));
        }
        // Anthropic's endpoint expects the state echoed on exchange
        if self.provider == Provider::Anthropic {
            form.push(("state", pending.state.clone()));
        }

        tracing::info!("Exchanging {} authorization code", self.provider);
        let raw = self.post_token(&form).await?;
        normalize_token_response(&raw)
    }

    /// Run the refresh-token grant, merging the result into `current`
    pub async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(Error::NoRefreshToken)?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        tracing::info!("Refreshing {} access token", self.provider);
        let raw = self.post_token(&form).await?;
        let fresh = normalize_token_response(&raw)?;
        Ok(current.merge_refreshed(fresh))
    }

    async fn post_token(&self, form: &[(&str, String)]) -> Result<Value> {
        tracing::debug!("POST {}", self.config.token_url);
        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body) = http::status_and_text(response).await;
            tracing::warn!("{} token endpoint returned {}", self.provider, status);
            return Err(Error::RefreshFailed { status, body });
        }

        http::decode_json(response).await
    }
}

/// Parse what the user pasted after authorizing.
///
/// Accepts a bare code, `code#state`, a query string (`code=...&state=...`)
/// or the full redirect URL.
pub fn parse_authorization_input(input: &str) -> Result<AuthorizationCode> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::OAuth("No authorization code provided".to_string()));
    }

    if let Ok(url) = Url::parse(input) {
        if url.has_host() {
            return from_query_pairs(url.query_pairs());
        }
    }

    if input.contains("code=") {
        let query = input.trim_start_matches('?');
        return from_query_pairs(url::form_urlencoded::parse(query.as_bytes()));
    }

    let (code, state) = match input.split_once('#') {
        Some((code, state)) => (code, Some(state.to_string()).filter(|s| !s.is_empty())),
        None => (input, None),
    };
    Ok(AuthorizationCode {
        code: code.to_string(),
        state,
    })
}

fn from_query_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> Result<AuthorizationCode> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in pairs {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(Error::OAuth(format!("Authorization denied: {error}")));
    }
    let code = code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::OAuth("No 'code' parameter in input".to_string()))?;
    Ok(AuthorizationCode { code, state })
}

/// Convert a vendor token response into [`OAuthTokens`].
///
/// Keys are normalized to snake_case first, so `accessToken` and
/// `access_token` are equivalent. `expires_in` becomes an absolute
/// `expires_at`; an explicit `expires_at` (unix seconds or RFC 3339) is used
/// when `expires_in` is absent.
pub fn normalize_token_response(raw: &Value) -> Result<OAuthTokens> {
    let obj = raw.as_object().ok_or_else(|| {
        Error::InvalidCredentialFormat("token response is not a JSON object".to_string())
    })?;
    let map: Map<String, Value> = obj
        .iter()
        .map(|(k, v)| (to_snake_case(k), v.clone()))
        .collect();

    let text = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let access_token = text("access_token").ok_or_else(|| {
        Error::InvalidCredentialFormat("token response has no access_token".to_string())
    })?;

    let expires_at = match map.get("expires_in").and_then(as_seconds) {
        Some(secs) => expiry_from_now(secs),
        None => map.get("expires_at").and_then(parse_timestamp),
    };

    Ok(OAuthTokens {
        access_token,
        refresh_token: text("refresh_token"),
        token_type: text("token_type").unwrap_or_else(|| "Bearer".to_string()),
        expires_at,
        scope: text("scope"),
    })
}

fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| s.parse().ok().and_then(from_unix_secs)),
        other => as_seconds(other).and_then(from_unix_secs),
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth_config::builtin_defaults;
    use chrono::Duration;
    use mockito::Matcher;
    use serde_json::json;

    fn flow(provider: Provider, token_url: &str) -> OAuthFlow {
        let mut config = builtin_defaults(provider);
        config.client_id = "test-client".into();
        config.token_url = token_url.to_string();
        OAuthFlow::new(provider, config, Client::new())
    }

    fn query(url: &str) -> std::collections::HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[test]
    fn test_device_url_contains_pkce_and_extras() {
        let flow = flow(Provider::Anthropic, "http://unused");
        let pending = flow.begin(FlowType::Device).unwrap();
        let params = query(&pending.url);

        assert!(pending.url.starts_with("https://claude.ai/oauth/authorize?"));
        assert_eq!(params["client_id"], "test-client");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "org:create_api_key user:profile user:inference");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], pending.pkce.as_ref().unwrap().challenge);
        assert_eq!(params["state"], pending.state);
        assert_eq!(params["code"], "true");
        assert_eq!(
            params["redirect_uri"],
            "https://console.anthropic.com/oauth/code/callback"
        );
    }

    #[test]
    fn test_web_url_has_no_pkce() {
        let flow = flow(Provider::Gemini, "http://unused");
        let pending = flow.begin(FlowType::Web).unwrap();
        let params = query(&pending.url);

        assert!(pending.pkce.is_none());
        assert!(!params.contains_key("code_challenge"));
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["redirect_uri"], "http://localhost:8085/oauth2callback");
    }

    #[test]
    fn test_begin_requires_client_id() {
        let flow = OAuthFlow::new(Provider::Gemini, builtin_defaults(Provider::Gemini), Client::new());
        assert!(matches!(flow.begin(FlowType::Device), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_input_variants() {
        let bare = parse_authorization_input("  abc123 ").unwrap();
        assert_eq!(bare.code, "abc123");
        assert_eq!(bare.state, None);

        let hashed = parse_authorization_input("abc123#st4te").unwrap();
        assert_eq!(hashed.code, "abc123");
        assert_eq!(hashed.state.as_deref(), Some("st4te"));

        let query = parse_authorization_input("code=abc%2F123&state=xyz").unwrap();
        assert_eq!(query.code, "abc/123");
        assert_eq!(query.state.as_deref(), Some("xyz"));

        let url = parse_authorization_input(
            "http://localhost:1455/auth/callback?code=c0de&state=s1",
        )
        .unwrap();
        assert_eq!(url.code, "c0de");
        assert_eq!(url.state.as_deref(), Some("s1"));
    }

    #[test]
    fn test_parse_input_errors() {
        assert!(parse_authorization_input("   ").is_err());
        assert!(parse_authorization_input("http://localhost/cb?error=access_denied").is_err());
        assert!(parse_authorization_input("http://localhost/cb?state=only").is_err());
    }

    #[test]
    fn test_normalize_camel_case_response() {
        let tokens = normalize_token_response(&json!({
            "accessToken": "ya29.a",
            "refreshToken": "1//r",
            "tokenType": "Bearer",
            "expiresIn": 3600
        }))
        .unwrap();

        assert_eq!(tokens.access_token, "ya29.a");
        assert_eq!(tokens.refresh_token.as_deref(), Some("1//r"));
        let remaining = tokens.expires_at.unwrap() - Utc::now();
        assert!(remaining > Duration::seconds(3500) && remaining <= Duration::seconds(3600));
    }

    #[test]
    fn test_normalize_absolute_expiry_and_missing_token() {
        let tokens =
            normalize_token_response(&json!({"access_token": "a", "expires_at": 1_900_000_000}))
                .unwrap();
        assert_eq!(tokens.expires_at, from_unix_secs(1_900_000_000));
        assert_eq!(tokens.token_type, "Bearer");

        assert!(matches!(
            normalize_token_response(&json!({"token_type": "Bearer"})),
            Err(Error::InvalidCredentialFormat(_))
        ));
    }

    #[test]
    fn test_normalize_huge_expires_in() {
        let tokens =
            normalize_token_response(&json!({"access_token": "a", "expires_in": i64::MAX}))
                .unwrap();
        assert!(tokens.expires_at.unwrap() > Utc::now() + Duration::days(365 * 99));

        let tokens =
            normalize_token_response(&json!({"access_token": "a", "expires_in": 1e300})).unwrap();
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn test_device_flow_exchange_sends_verifier() {
        let mut server = mockito::Server::new_async().await;
        let pkce = PkcePair::from_verifier("v".repeat(64));
        let mock = server
            .mock("POST", "/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("code_verifier".into(), "v".repeat(64)),
                Matcher::UrlEncoded("client_id".into(), "test-client".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#)
            .create_async()
            .await;

        let flow = flow(Provider::OpenAi, &format!("{}/token", server.url()));
        let pending = flow
            .begin_with(FlowType::Device, "s".into(), Some(pkce))
            .unwrap();
        let tokens = flow.complete(&pending, "the-code#s").await.unwrap();

        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_state_mismatch_rejected_before_exchange() {
        let flow = flow(Provider::Anthropic, "http://127.0.0.1:1/token");
        let pending = flow.begin(FlowType::Device).unwrap();
        let err = flow.complete(&pending, "code#wrong-state").await.unwrap_err();
        assert!(matches!(err, Error::OAuth(_)));
    }

    #[tokio::test]
    async fn test_refresh_preserves_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("refresh_token".into(), "keep".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"new","expires_in":3600}"#)
            .create_async()
            .await;

        let flow = flow(Provider::Gemini, &format!("{}/token", server.url()));
        let current = OAuthTokens::new("old", Some("keep".into()), Some(-10));
        let refreshed = flow.refresh(&current).await.unwrap();

        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("keep"));
        assert!(!refreshed.is_expired());
    }

    #[tokio::test]
    async fn test_refresh_error_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let flow = flow(Provider::OpenAi, &format!("{}/token", server.url()));
        let current = OAuthTokens::new("old", Some("revoked".into()), Some(-10));
        match flow.refresh(&current).await {
            Err(Error::RefreshFailed { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_without_token() {
        let flow = flow(Provider::OpenAi, "http://127.0.0.1:1/token");
        let current = OAuthTokens::new("old", None, Some(-10));
        assert!(matches!(flow.refresh(&current).await, Err(Error::NoRefreshToken)));
    }
}
