//! Session actors and their supervisor
//!
//! Each user gets one actor task that owns its [`SessionState`] and processes
//! commands in arrival order. Auth work (store lookups, refreshes, OAuth
//! flows) is awaited inside the actor; completions only borrow a context from
//! it and run on the caller's task.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::state::{ProviderStatus, SessionState};
use crate::auth::{AuthContext, AuthType, InitOptions, Provider};
use crate::error::Error;
use crate::providers::{
    CompletionOptions, CompletionResponse, Message, ModelInfo, ProviderAdapter, ProviderRegistry,
};
use crate::Result;

const CHANNEL_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    SetActive {
        provider: Provider,
        options: Option<InitOptions>,
        reply: Reply<AuthContext>,
    },
    GetActive {
        reply: Reply<(Provider, AuthContext)>,
    },
    GetContext {
        provider: Provider,
        reply: Reply<AuthContext>,
    },
    RefreshAll {
        reply: Reply<()>,
    },
    ListProviders {
        reply: Reply<BTreeMap<Provider, ProviderStatus>>,
    },
    Clear {
        provider: Provider,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionState>,
    },
}

struct SessionActor {
    state: SessionState,
    registry: ProviderRegistry,
    receiver: mpsc::Receiver<Command>,
}

impl SessionActor {
    async fn run(mut self) {
        tracing::debug!("Session actor for '{}' started", self.state.user_id);
        while let Some(command) = self.receiver.recv().await {
            self.state.touch();
            self.handle(command).await;
        }
        tracing::debug!("Session actor for '{}' stopped", self.state.user_id);
    }

    async fn handle(&mut self, command: Command) {
        // A dropped receiver means the caller went away; nothing to report.
        match command {
            Command::SetActive {
                provider,
                options,
                reply,
            } => {
                let _ = reply.send(self.set_active(provider, options).await);
            }
            Command::GetActive { reply } => {
                let _ = reply.send(self.active().await);
            }
            Command::GetContext { provider, reply } => {
                let _ = reply.send(self.context(provider).await);
            }
            Command::RefreshAll { reply } => {
                let _ = reply.send(self.refresh_all().await);
            }
            Command::ListProviders { reply } => {
                let _ = reply.send(Ok(self.list()));
            }
            Command::Clear { provider, reply } => {
                let _ = reply.send(self.clear(provider).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.state.clone()));
            }
        }
    }

    async fn set_active(
        &mut self,
        provider: Provider,
        options: Option<InitOptions>,
    ) -> Result<AuthContext> {
        let ctx = match options {
            Some(options) => {
                let ctx = self.registry.get(provider)?.initialize_auth(&options).await?;
                self.state.insert(ctx.clone());
                ctx
            }
            None => self.context(provider).await?,
        };
        self.state.active_provider = Some(provider);
        tracing::info!("Active provider for '{}' is now {}", self.state.user_id, provider);
        Ok(ctx)
    }

    async fn active(&mut self) -> Result<(Provider, AuthContext)> {
        let provider = self.state.active_provider.ok_or(Error::NoActiveProvider)?;
        Ok((provider, self.context(provider).await?))
    }

    /// Named session a provider's credentials belong to: the loaded
    /// context's own session, else the manager default
    fn session_for(&self, provider: Provider) -> String {
        self.state
            .provider_contexts
            .get(&provider)
            .map(|ctx| ctx.session().to_string())
            .unwrap_or_else(|| self.state.session_name.clone())
    }

    /// Memory (refreshing a stale entry), then the store, then the adapter's
    /// detection chain. Any failure evicts the provider.
    async fn context(&mut self, provider: Provider) -> Result<AuthContext> {
        if let Some(ctx) = self.state.usable_context(provider) {
            return Ok(ctx.clone());
        }

        match self.resolve(provider).await {
            Ok(ctx) => {
                self.state.insert(ctx.clone());
                Ok(ctx)
            }
            Err(e) => {
                if self.state.provider_contexts.contains_key(&provider) {
                    tracing::warn!("Evicting {} for '{}': {}", provider, self.state.user_id, e);
                }
                self.state.evict(provider);
                Err(e)
            }
        }
    }

    async fn resolve(&self, provider: Provider) -> Result<AuthContext> {
        let adapter = self.registry.get(provider)?;
        if let Some(stale) = self.state.provider_contexts.get(&provider) {
            return adapter.refresh_auth(stale).await;
        }

        let session = self.session_for(provider);
        match self.load_stored(adapter.as_ref(), &session).await? {
            Some(ctx) => Ok(ctx),
            None => {
                let options = InitOptions::new().with_session(&session);
                adapter.initialize_auth(&options).await
            }
        }
    }

    async fn load_stored(
        &self,
        adapter: &dyn ProviderAdapter,
        name: &str,
    ) -> Result<Option<AuthContext>> {
        let provider = adapter.provider();
        let store = &adapter.runtime().store;

        for auth_type in [AuthType::OAuth, AuthType::ApiKey] {
            let Some(record) = store.get(provider, auth_type, name).await? else {
                continue;
            };
            let ctx = match AuthContext::from_saved(&record) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!("Skipping unreadable {} {} session: {}", provider, auth_type, e);
                    continue;
                }
            };
            if !ctx.is_expired() {
                tracing::debug!("Loaded {} {} session '{}'", provider, auth_type, name);
                return Ok(Some(ctx));
            }
            match adapter.refresh_auth(&ctx).await {
                Ok(ctx) => return Ok(Some(ctx)),
                Err(e) => tracing::warn!("Stored {} session '{}' not refreshable: {}", provider, name, e),
            }
        }
        Ok(None)
    }

    async fn refresh_all(&mut self) -> Result<()> {
        let mut providers: Vec<Provider> = self.state.provider_contexts.keys().copied().collect();
        providers.sort();

        let mut failed = Vec::new();
        for provider in providers {
            let Some(ctx) = self.state.provider_contexts.get(&provider).cloned() else {
                continue;
            };
            let refreshed = match self.registry.get(provider) {
                Ok(adapter) => adapter.refresh_auth(&ctx).await,
                Err(e) => Err(e),
            };
            match refreshed {
                Ok(ctx) => self.state.insert(ctx),
                Err(e) => {
                    tracing::warn!("Refresh failed for {}: {}", provider, e);
                    self.state.evict(provider);
                    failed.push(provider);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::RefreshAllFailed(failed))
        }
    }

    fn list(&self) -> BTreeMap<Provider, ProviderStatus> {
        self.registry
            .providers()
            .into_iter()
            .map(|p| (p, self.state.status(p)))
            .collect()
    }

    async fn clear(&mut self, provider: Provider) -> Result<()> {
        let adapter = self.registry.get(provider)?;
        let rt = adapter.runtime();
        let session = self.session_for(provider);
        for auth_type in [AuthType::OAuth, AuthType::ApiKey] {
            rt.store.delete(provider, auth_type, &session).await?;
        }
        rt.cache.remove(provider, &session).await?;
        self.state.evict(provider);
        tracing::info!(
            "Cleared {} credentials in session '{}' for '{}'",
            provider,
            session,
            self.state.user_id
        );
        Ok(())
    }
}

/// Cloneable handle to one user's session actor
#[derive(Clone)]
pub struct SessionHandle {
    user_id: String,
    sender: mpsc::Sender<Command>,
    registry: ProviderRegistry,
}

impl SessionHandle {
    fn spawn(user_id: &str, session_name: &str, registry: ProviderRegistry) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let actor = SessionActor {
            state: SessionState::new(user_id, session_name),
            registry: registry.clone(),
            receiver,
        };
        tokio::spawn(actor.run());

        Self {
            user_id: user_id.to_string(),
            sender,
            registry,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Authenticate `provider` (running detection with `options` when given)
    /// and make it the active provider
    pub async fn set_active_provider(
        &self,
        provider: Provider,
        options: Option<InitOptions>,
    ) -> Result<AuthContext> {
        self.call(|reply| Command::SetActive {
            provider,
            options,
            reply,
        })
        .await
    }

    pub async fn get_active_provider(&self) -> Result<(Provider, AuthContext)> {
        self.call(|reply| Command::GetActive { reply }).await
    }

    pub async fn get_provider_context(&self, provider: Provider) -> Result<AuthContext> {
        self.call(|reply| Command::GetContext { provider, reply })
            .await
    }

    /// Refresh every loaded context; failures are evicted and reported together
    pub async fn refresh_all_credentials(&self) -> Result<()> {
        self.call(|reply| Command::RefreshAll { reply }).await
    }

    pub async fn list_session_providers(&self) -> Result<BTreeMap<Provider, ProviderStatus>> {
        self.call(|reply| Command::ListProviders { reply }).await
    }

    pub async fn clear_provider(&self, provider: Provider) -> Result<()> {
        self.call(|reply| Command::Clear { provider, reply }).await
    }

    /// Copy of the actor's current state
    pub async fn snapshot(&self) -> Result<SessionState> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    async fn active_adapter(&self) -> Result<(std::sync::Arc<dyn ProviderAdapter>, AuthContext)> {
        let (provider, ctx) = self.get_active_provider().await?;
        Ok((self.registry.get(provider)?, ctx))
    }

    pub async fn complete_text(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let (adapter, ctx) = self.active_adapter().await?;
        adapter.complete_text(&ctx, messages, options).await
    }

    pub async fn complete_with_tools(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let (adapter, ctx) = self.active_adapter().await?;
        adapter.complete_with_tools(&ctx, messages, options).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let (adapter, ctx) = self.active_adapter().await?;
        adapter.list_models(&ctx).await
    }
}

/// Lazily spawns one session actor per user id
pub struct SessionManager {
    registry: ProviderRegistry,
    session_name: String,
    handles: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(registry: ProviderRegistry, session_name: impl Into<String>) -> Self {
        Self {
            registry,
            session_name: session_name.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Handle for `user_id`, spawning its actor on first use
    pub async fn session(&self, user_id: &str) -> SessionHandle {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(user_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }

        let handle = SessionHandle::spawn(user_id, &self.session_name, self.registry.clone());
        handles.insert(user_id.to_string(), handle.clone());
        handle
    }

    /// Forget a user; the actor stops once outstanding handles are dropped
    pub async fn remove(&self, user_id: &str) -> bool {
        self.handles.lock().await.remove(user_id).is_some()
    }

    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        users.sort();
        users
    }
}
