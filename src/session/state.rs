//! Per-user session state owned by a session actor

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::auth::{AuthContext, Provider};

/// Whether a provider can be used without running authentication again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Authenticated,
    NeedsAuth,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProviderStatus::Authenticated => "authenticated",
            ProviderStatus::NeedsAuth => "needs auth",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub user_id: String,
    /// Named session used for stored credentials
    pub session_name: String,
    pub active_provider: Option<Provider>,
    pub provider_contexts: HashMap<Provider, AuthContext>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>, session_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            session_name: session_name.into(),
            active_provider: None,
            provider_contexts: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// In-memory context for `provider` unless it has expired locally
    pub fn usable_context(&self, provider: Provider) -> Option<&AuthContext> {
        self.provider_contexts
            .get(&provider)
            .filter(|ctx| !ctx.is_expired())
    }

    pub fn insert(&mut self, ctx: AuthContext) {
        self.provider_contexts.insert(ctx.provider, ctx);
    }

    /// Drop the context for `provider`, unsetting it as active
    pub fn evict(&mut self, provider: Provider) -> Option<AuthContext> {
        if self.active_provider == Some(provider) {
            self.active_provider = None;
        }
        self.provider_contexts.remove(&provider)
    }

    pub fn status(&self, provider: Provider) -> ProviderStatus {
        if self.usable_context(provider).is_some() {
            ProviderStatus::Authenticated
        } else {
            ProviderStatus::NeedsAuth
        }
    }
}
