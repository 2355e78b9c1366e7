//! Error types for Maestro

use thiserror::Error;

use crate::auth::{AuthType, Provider};

/// Result type alias for Maestro operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Maestro
#[derive(Error, Debug)]
pub enum Error {
    #[error("No usable authentication method for {0}")]
    AuthMethodUnavailable(Provider),

    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Interactive OAuth flow required for {0}, but the environment is non-interactive")]
    OAuthInitializationRequired(Provider),

    #[error("No cached credentials for {0}")]
    NoCachedCredentials(Provider),

    #[error("Invalid credential format: {0}")]
    InvalidCredentialFormat(String),

    #[error("No refresh token available; re-run the OAuth flow")]
    NoRefreshToken,

    #[error("Access token expired")]
    TokenExpired,

    #[error("Token refresh failed ({status}): {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("Provider request failed ({status}): {body}")]
    ProviderRequestFailed { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    DecodeFailed(String),

    #[error("Credentials belong to {found}, expected {expected}")]
    ProviderMismatch { expected: Provider, found: Provider },

    #[error("A {auth_type} session named '{name}' already exists for {provider}")]
    DuplicateNamedSession {
        provider: Provider,
        auth_type: AuthType,
        name: String,
    },

    #[error("No {auth_type} session named '{name}' for {provider}")]
    SessionNotFound {
        provider: Provider,
        auth_type: AuthType,
        name: String,
    },

    #[error("No active provider")]
    NoActiveProvider,

    #[error("Credential refresh failed for: {}", format_providers(.0))]
    RefreshAllFailed(Vec<Provider>),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Session worker stopped")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn format_providers(providers: &[Provider]) -> String {
    providers
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Stable snake_case code for the error, suitable for machine consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AuthMethodUnavailable(_) => "auth_method_unavailable",
            Error::InvalidApiKey(_) => "invalid_api_key",
            Error::OAuthInitializationRequired(_) => "oauth_initialization_required",
            Error::NoCachedCredentials(_) => "no_cached_credentials",
            Error::InvalidCredentialFormat(_) => "invalid_credential_format",
            Error::NoRefreshToken => "no_refresh_token",
            Error::TokenExpired => "token_expired",
            Error::RefreshFailed { .. } => "refresh_failed",
            Error::ProviderRequestFailed { .. } => "provider_request_failed",
            Error::DecodeFailed(_) => "decode_failed",
            Error::ProviderMismatch { .. } => "provider_mismatch",
            Error::DuplicateNamedSession { .. } => "duplicate_named_session",
            Error::SessionNotFound { .. } => "session_not_found",
            Error::NoActiveProvider => "no_active_provider",
            Error::RefreshAllFailed(_) => "refresh_all_failed",
            Error::Validation(_) => "validation_failed",
            Error::OAuth(_) => "oauth_error",
            Error::Config(_) => "config_error",
            Error::Encryption(_) => "encryption_error",
            Error::SessionClosed => "session_closed",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Database(_) => "database_error",
        }
    }
}
