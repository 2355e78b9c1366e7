//! Authentication context carried between provider calls
//!
//! An [`AuthContext`] pairs a [`Provider`] with a [`Credentials`] payload whose
//! variant is the auth method tag, plus a free-form config map.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::store::SavedAuthentication;
use crate::error::Error;
use crate::Result;

/// Config key holding the named session a context belongs to.
pub const SESSION_KEY: &str = "session";

/// Session name used when the caller does not pick one.
pub const DEFAULT_SESSION: &str = "default";

/// Lifetime assumed for refreshed tokens whose response omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Vendor-supplied lifetimes are clamped to this many seconds (100 years)
const MAX_LIFETIME_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Supported LLM vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::OpenAi, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAi),
            "gemini" | "google" => Ok(Provider::Gemini),
            other => Err(Error::Validation(format!("unknown provider: {other}"))),
        }
    }
}

/// Auth method tag, derived from the [`Credentials`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    ApiKey,
    OAuth,
    ServiceAccount,
}

/// Persisted auth type of a saved session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::ApiKey => "api_key",
            AuthType::OAuth => "oauth",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api_key" => Ok(AuthType::ApiKey),
            "oauth" => Ok(AuthType::OAuth),
            other => Err(Error::Validation(format!("unknown auth type: {other}"))),
        }
    }
}

/// OAuth2 tokens with access and refresh tokens
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// The access token for API requests
    pub access_token: String,

    /// The refresh token for obtaining new access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// When the access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthTokens {
    /// Create new tokens from a token response
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
    ) -> Self {
        let expires_at = expires_in_secs.and_then(expiry_from_now);

        Self {
            access_token: access_token.into(),
            refresh_token,
            token_type: default_token_type(),
            expires_at,
            scope: None,
        }
    }

    /// Whether the access token is past its expiry. Tokens without a known
    /// expiry are never considered expired locally.
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    /// Whether the token expires within `window` from now
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() + window >= expires,
            None => false,
        }
    }

    /// Check if we have a refresh token
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Merge a refresh-grant result into these tokens.
    ///
    /// Refresh-token rotation is optional for vendors: when the response omits
    /// a refresh token (or scope) the current one is kept.
    pub fn merge_refreshed(&self, fresh: OAuthTokens) -> OAuthTokens {
        OAuthTokens {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            token_type: fresh.token_type,
            expires_at: fresh
                .expires_at
                .or_else(|| expiry_from_now(DEFAULT_TOKEN_LIFETIME_SECS)),
            scope: fresh.scope.or_else(|| self.scope.clone()),
        }
    }
}

/// Credential payload; the variant is the auth method tag
#[derive(Clone, PartialEq)]
pub enum Credentials {
    ApiKey {
        key: String,
    },
    OAuth(OAuthTokens),
    ServiceAccount {
        access_token: String,
        source_path: PathBuf,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey { key } => {
                f.debug_struct("ApiKey").field("key", &redact(key)).finish()
            }
            Credentials::OAuth(tokens) => f.debug_tuple("OAuth").field(tokens).finish(),
            Credentials::ServiceAccount {
                source_path,
                expires_at,
                ..
            } => f
                .debug_struct("ServiceAccount")
                .field("source_path", source_path)
                .field("expires_at", expires_at)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credentials::ApiKey { .. } => AuthMethod::ApiKey,
            Credentials::OAuth(_) => AuthMethod::OAuth,
            Credentials::ServiceAccount { .. } => AuthMethod::ServiceAccount,
        }
    }

    /// The secret sent on the wire (API key or bearer token)
    pub fn secret(&self) -> &str {
        match self {
            Credentials::ApiKey { key } => key,
            Credentials::OAuth(tokens) => &tokens.access_token,
            Credentials::ServiceAccount { access_token, .. } => access_token,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::ApiKey { .. } => None,
            Credentials::OAuth(tokens) => tokens.expires_at,
            Credentials::ServiceAccount { expires_at, .. } => *expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| Utc::now() >= at)
    }

    /// Auth type under which these credentials are persisted, if at all
    pub fn auth_type(&self) -> Option<AuthType> {
        match self {
            Credentials::ApiKey { .. } => Some(AuthType::ApiKey),
            Credentials::OAuth(_) => Some(AuthType::OAuth),
            Credentials::ServiceAccount { .. } => None,
        }
    }

    /// Canonical plaintext `credentials` map stored in the database
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Credentials::ApiKey { key } => {
                map.insert("api_key".into(), Value::String(key.clone()));
            }
            Credentials::OAuth(tokens) => {
                map.insert("access_token".into(), Value::String(tokens.access_token.clone()));
                if let Some(refresh) = &tokens.refresh_token {
                    map.insert("refresh_token".into(), Value::String(refresh.clone()));
                }
                map.insert("token_type".into(), Value::String(tokens.token_type.clone()));
                if let Some(scope) = &tokens.scope {
                    map.insert("scope".into(), Value::String(scope.clone()));
                }
            }
            Credentials::ServiceAccount {
                access_token,
                source_path,
                ..
            } => {
                map.insert("access_token".into(), Value::String(access_token.clone()));
                map.insert(
                    "source_path".into(),
                    Value::String(source_path.to_string_lossy().into_owned()),
                );
            }
        }
        map
    }

    /// Rebuild credentials from a stored `credentials` map
    pub fn from_map(
        auth_type: AuthType,
        map: &Map<String, Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let field = |name: &str| map.get(name).and_then(Value::as_str).map(str::to_string);

        match auth_type {
            AuthType::ApiKey => {
                let key = field("api_key").ok_or_else(|| {
                    Error::InvalidCredentialFormat("api_key credentials missing 'api_key'".into())
                })?;
                Ok(Credentials::ApiKey { key })
            }
            AuthType::OAuth => {
                let access_token = field("access_token").ok_or_else(|| {
                    Error::InvalidCredentialFormat(
                        "oauth credentials missing 'access_token'".into(),
                    )
                })?;
                Ok(Credentials::OAuth(OAuthTokens {
                    access_token,
                    refresh_token: field("refresh_token"),
                    token_type: field("token_type").unwrap_or_else(default_token_type),
                    expires_at,
                    scope: field("scope"),
                }))
            }
        }
    }
}

/// Method tag + credential payload + config passed into every provider operation
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub provider: Provider,
    pub credentials: Credentials,
    pub config: HashMap<String, Value>,
}

impl AuthContext {
    pub fn new(provider: Provider, credentials: Credentials) -> Self {
        Self {
            provider,
            credentials,
            config: HashMap::new(),
        }
    }

    pub fn api_key(provider: Provider, key: impl Into<String>) -> Self {
        Self::new(provider, Credentials::ApiKey { key: key.into() })
    }

    pub fn oauth(provider: Provider, tokens: OAuthTokens) -> Self {
        Self::new(provider, Credentials::OAuth(tokens))
    }

    pub fn with_session(mut self, name: impl Into<String>) -> Self {
        self.config
            .insert(SESSION_KEY.to_string(), Value::String(name.into()));
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Named session this context belongs to
    pub fn session(&self) -> &str {
        self.config
            .get(SESSION_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SESSION)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn method(&self) -> AuthMethod {
        self.credentials.method()
    }

    pub fn is_expired(&self) -> bool {
        self.credentials.is_expired()
    }

    pub fn oauth_tokens(&self) -> Option<&OAuthTokens> {
        match &self.credentials {
            Credentials::OAuth(tokens) => Some(tokens),
            _ => None,
        }
    }

    /// Reject contexts built for a different vendor
    pub fn ensure_provider(&self, expected: Provider) -> Result<()> {
        if self.provider == expected {
            Ok(())
        } else {
            Err(Error::ProviderMismatch {
                expected,
                found: self.provider,
            })
        }
    }

    /// Rebuild a context from a saved named session
    pub fn from_saved(record: &SavedAuthentication) -> Result<Self> {
        let credentials =
            Credentials::from_map(record.auth_type, &record.credentials, record.expires_at)?;
        Ok(Self::new(record.provider, credentials).with_session(record.name.clone()))
    }
}

/// Convert unix seconds into a UTC timestamp
pub(crate) fn from_unix_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Absolute expiry `secs` from now; out-of-range lifetimes are clamped
pub(crate) fn expiry_from_now(secs: i64) -> Option<DateTime<Utc>> {
    let secs = secs.clamp(-MAX_LIFETIME_SECS, MAX_LIFETIME_SECS);
    Duration::try_seconds(secs).and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        "[redacted]".to_string()
    } else {
        format!("{}…[redacted]", &secret[..secret.char_indices().nth(6).map_or(0, |(i, _)| i)])
    }
}
