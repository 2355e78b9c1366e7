//! Auth-method detection chain
//!
//! Each adapter declares an ordered list of [`DetectionStep`]s; the first step
//! that yields credentials wins. [`InitOptions::method`] narrows the chain to
//! the steps producing that method.

use super::context::{AuthMethod, Provider, DEFAULT_SESSION};
use super::oauth::FlowType;
use crate::error::Error;

/// Env var naming a Google service-account key file
pub const SERVICE_ACCOUNT_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStep {
    /// Vendor API key variable present
    ApiKey,
    /// Service-account key file referenced from the environment
    ServiceAccount,
    /// Previously cached OAuth tokens on disk
    CachedOAuth,
    /// New OAuth flow with the user at a terminal
    Interactive,
}

impl DetectionStep {
    pub fn method(&self) -> AuthMethod {
        match self {
            DetectionStep::ApiKey => AuthMethod::ApiKey,
            DetectionStep::ServiceAccount => AuthMethod::ServiceAccount,
            DetectionStep::CachedOAuth | DetectionStep::Interactive => AuthMethod::OAuth,
        }
    }
}

/// How `initialize_auth` should proceed
#[derive(Debug, Clone, PartialEq)]
pub struct InitOptions {
    /// Named session the credentials are stored under
    pub session: String,
    pub flow: FlowType,
    /// Restrict detection to one method
    pub method: Option<AuthMethod>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION.to_string(),
            flow: FlowType::Device,
            method: None,
        }
    }
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_flow(mut self, flow: FlowType) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_method(mut self, method: AuthMethod) -> Self {
        self.method = Some(method);
        self
    }
}

/// Steps of `chain` allowed by the requested method, in order
pub fn applicable_steps(chain: &[DetectionStep], method: Option<AuthMethod>) -> Vec<DetectionStep> {
    chain
        .iter()
        .copied()
        .filter(|step| method.map_or(true, |m| step.method() == m))
        .collect()
}

/// Error once every step came up empty.
///
/// An explicit OAuth request that only failed for lack of a terminal gets
/// `OAuthInitializationRequired`.
pub fn exhausted(provider: Provider, options: &InitOptions, interactive_blocked: bool) -> Error {
    if options.method == Some(AuthMethod::OAuth) && interactive_blocked {
        Error::OAuthInitializationRequired(provider)
    } else {
        Error::AuthMethodUnavailable(provider)
    }
}
