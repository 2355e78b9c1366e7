//! Credential lifecycle shared by all adapters
//!
//! Detection, the probe/refresh state machine and the persistence side
//! effects live here as free functions over [`ProviderAdapter`], so each
//! adapter only implements its vendor hooks.
//!
//! ```text
//! Unchecked -> Valid | Expired | Invalid
//! Expired   -> Refreshing -> Valid | RefreshFailed
//! ```

use std::path::Path;

use super::context::{AuthContext, AuthType, Credentials};
use super::detect::{self, DetectionStep, InitOptions, SERVICE_ACCOUNT_ENV};
use super::env::{first_var, is_interactive};
use super::oauth::PendingAuthorization;
use super::store::SessionAttrs;
use crate::error::Error;
use crate::providers::ProviderAdapter;
use crate::Result;

/// Outcome of a probe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    /// Rejected as unauthenticated (401/403)
    Expired,
    /// Any other failure; not retried
    Invalid { status: u16, body: String },
}

impl TokenStatus {
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            200..=299 => TokenStatus::Valid,
            401 | 403 => TokenStatus::Expired,
            _ => TokenStatus::Invalid {
                status,
                body: body.into(),
            },
        }
    }

    /// Classify a probe response, reading the body only on failure
    pub async fn from_response(response: reqwest::Response) -> Self {
        if response.status().is_success() {
            return TokenStatus::Valid;
        }
        let (status, body) = crate::providers::http::status_and_text(response).await;
        Self::from_status(status, body)
    }
}

/// Walk the adapter's detection chain; first usable method wins
pub async fn initialize_auth<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    options: &InitOptions,
) -> Result<AuthContext> {
    let provider = adapter.provider();
    let rt = adapter.runtime();
    let mut interactive_blocked = false;

    for step in detect::applicable_steps(adapter.detection_chain(), options.method) {
        match step {
            DetectionStep::ApiKey => {
                let Some(key) = first_var(rt.env.as_ref(), adapter.api_key_vars()) else {
                    continue;
                };
                let credentials = adapter.classify_api_key(&key)?;
                let ctx = AuthContext::new(provider, credentials).with_session(&options.session);
                persist(adapter, &ctx).await?;
                tracing::info!("Authenticated {} from environment key", provider);
                return Ok(ctx);
            }
            DetectionStep::ServiceAccount => {
                let Some(path) = rt.env.var(SERVICE_ACCOUNT_ENV) else {
                    continue;
                };
                let ctx = adapter
                    .derive_service_account(Path::new(&path))
                    .await?
                    .with_session(&options.session);
                tracing::info!("Authenticated {} with service account {}", provider, path);
                return Ok(ctx);
            }
            DetectionStep::CachedOAuth => match rt.cache.require(provider, &options.session).await {
                Ok(tokens) => {
                    tracing::debug!(
                        "Found cached {} OAuth tokens for session '{}'",
                        provider,
                        options.session
                    );
                    let ctx = AuthContext::oauth(provider, tokens).with_session(&options.session);
                    match validate_and_refresh(adapter, ctx).await {
                        Ok(ctx) => {
                            persist(adapter, &ctx).await?;
                            tracing::info!("Authenticated {} from cached OAuth tokens", provider);
                            return Ok(ctx);
                        }
                        Err(e) => {
                            tracing::warn!("Cached {} credentials unusable: {}", provider, e)
                        }
                    }
                }
                Err(Error::NoCachedCredentials(_)) => tracing::debug!(
                    "No cached {} OAuth tokens for session '{}'",
                    provider,
                    options.session
                ),
                Err(e) => tracing::warn!("Ignoring {} credential cache: {}", provider, e),
            },
            DetectionStep::Interactive => {
                if !is_interactive(rt.env.as_ref()) {
                    tracing::debug!("Skipping {} OAuth flow: not interactive", provider);
                    interactive_blocked = true;
                    continue;
                }
                let pending = adapter.begin_authorization(options.flow)?;
                let input = rt.prompt.authorize(&pending).await?;
                return complete_authorization(adapter, &pending, &input, &options.session).await;
            }
        }
    }

    Err(detect::exhausted(provider, options, interactive_blocked))
}

/// Exchange the code for a pending authorization and persist the result
pub async fn complete_authorization<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    pending: &PendingAuthorization,
    input: &str,
    session: &str,
) -> Result<AuthContext> {
    let provider = adapter.provider();
    if pending.provider != provider {
        return Err(Error::ProviderMismatch {
            expected: provider,
            found: pending.provider,
        });
    }
    let flow = adapter
        .oauth()
        .ok_or(Error::AuthMethodUnavailable(provider))?;

    let tokens = flow.complete(pending, input).await?;
    let ctx = AuthContext::oauth(provider, tokens).with_session(session);
    persist(adapter, &ctx).await?;
    tracing::info!("Completed {} OAuth authorization for session '{}'", provider, session);
    Ok(ctx)
}

/// Probe the context, refreshing once if the vendor reports it expired
pub async fn validate_and_refresh<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    ctx: AuthContext,
) -> Result<AuthContext> {
    let status = if ctx.is_expired() {
        TokenStatus::Expired
    } else {
        adapter.probe(&ctx).await?
    };

    match status {
        TokenStatus::Valid => Ok(ctx),
        TokenStatus::Expired => match &ctx.credentials {
            Credentials::OAuth(tokens) if !tokens.can_refresh() => Err(Error::NoRefreshToken),
            Credentials::OAuth(_) => refresh_oauth(adapter, &ctx).await,
            Credentials::ApiKey { .. } => Err(Error::InvalidApiKey(format!(
                "{} rejected the key",
                adapter.provider()
            ))),
            Credentials::ServiceAccount { source_path, .. } => {
                rederive(adapter, &ctx, source_path).await
            }
        },
        TokenStatus::Invalid { status, body } => {
            Err(Error::ProviderRequestFailed { status, body })
        }
    }
}

/// Syntactic check, local expiry, then a live probe
pub async fn validate_auth<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    ctx: &AuthContext,
) -> Result<()> {
    ctx.ensure_provider(adapter.provider())?;
    if let Credentials::ApiKey { key } = &ctx.credentials {
        adapter.classify_api_key(key)?;
    }
    if ctx.is_expired() {
        return Err(Error::TokenExpired);
    }

    match adapter.probe(ctx).await? {
        TokenStatus::Valid => Ok(()),
        TokenStatus::Expired => match ctx.credentials {
            Credentials::ApiKey { .. } => Err(Error::InvalidApiKey(format!(
                "{} rejected the key",
                adapter.provider()
            ))),
            _ => Err(Error::TokenExpired),
        },
        TokenStatus::Invalid { status, body } => {
            Err(Error::ProviderRequestFailed { status, body })
        }
    }
}

/// Refresh a context; API keys and non-expiring tokens come back unchanged
pub async fn refresh_auth<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    ctx: &AuthContext,
) -> Result<AuthContext> {
    ctx.ensure_provider(adapter.provider())?;
    match &ctx.credentials {
        Credentials::ApiKey { .. } => Ok(ctx.clone()),
        Credentials::OAuth(tokens) if tokens.expires_at.is_none() && !tokens.can_refresh() => {
            Ok(ctx.clone())
        }
        Credentials::OAuth(_) => refresh_oauth(adapter, ctx).await,
        Credentials::ServiceAccount { source_path, .. } => {
            rederive(adapter, ctx, source_path).await
        }
    }
}

async fn refresh_oauth<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    ctx: &AuthContext,
) -> Result<AuthContext> {
    let provider = adapter.provider();
    let tokens = ctx.oauth_tokens().ok_or(Error::NoRefreshToken)?;
    let flow = adapter
        .oauth()
        .ok_or(Error::AuthMethodUnavailable(provider))?;

    let refreshed = flow.refresh(tokens).await?;
    let next = AuthContext {
        provider,
        credentials: Credentials::OAuth(refreshed),
        config: ctx.config.clone(),
    };
    persist(adapter, &next).await?;
    tracing::info!("Refreshed {} credentials for session '{}'", provider, next.session());
    Ok(next)
}

async fn rederive<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    ctx: &AuthContext,
    source_path: &Path,
) -> Result<AuthContext> {
    let mut next = adapter.derive_service_account(source_path).await?;
    for (key, value) in &ctx.config {
        next.config.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Ok(next)
}

/// Write a freshly established context to the cache and/or store.
///
/// Both are keyed by the context's session. OAuth goes to both, except that
/// tokens without an expiry skip the store. API keys go to the store only and
/// service accounts are re-derived, not persisted.
pub async fn persist<A: ProviderAdapter + ?Sized>(adapter: &A, ctx: &AuthContext) -> Result<()> {
    let provider = adapter.provider();
    let rt = adapter.runtime();
    let session = ctx.session();

    match &ctx.credentials {
        Credentials::OAuth(tokens) => {
            rt.cache.save(provider, session, tokens).await?;
            if tokens.expires_at.is_some() {
                rt.store
                    .upsert(
                        provider,
                        AuthType::OAuth,
                        session,
                        SessionAttrs::from_credentials(&ctx.credentials),
                    )
                    .await?;
            } else {
                tracing::debug!("Not storing {} OAuth token without expiry", provider);
            }
        }
        Credentials::ApiKey { .. } => {
            rt.store
                .upsert(
                    provider,
                    AuthType::ApiKey,
                    session,
                    SessionAttrs::from_credentials(&ctx.credentials),
                )
                .await?;
        }
        Credentials::ServiceAccount { .. } => {}
    }
    Ok(())
}
