//! Authentication and credential lifecycle
//!
//! This module provides:
//! - [`AuthContext`] and the [`Credentials`] sum type
//! - Auth-method detection and the validate/refresh state machine
//! - OAuth2 device and web flows (PKCE, state, code/refresh grants)
//! - Google service-account JWT exchange
//! - [`CredentialCache`] (per-vendor token files) and [`CredentialStore`]
//!   (encrypted named sessions in SQLite)

pub mod cache;
pub mod cli_extractor;
pub mod context;
pub mod detect;
pub mod encryption;
pub mod env;
pub mod lifecycle;
pub mod oauth;
pub mod oauth_config;
pub mod pkce;
pub mod prompt;
pub mod service_account;
pub mod store;

pub use cache::CredentialCache;
pub use context::{
    AuthContext, AuthMethod, AuthType, Credentials, OAuthTokens, Provider, DEFAULT_SESSION,
};
pub use detect::{DetectionStep, InitOptions};
pub use env::{Environment, FakeEnv, SystemEnv};
pub use lifecycle::TokenStatus;
pub use oauth::{FlowType, OAuthFlow, PendingAuthorization};
pub use prompt::{AuthorizationPrompt, ScriptedPrompt, TerminalPrompt};
pub use store::{CredentialStore, SavedAuthentication, SessionAttrs};
