//! Maestro CLI entry point

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use maestro::auth::encryption::{load_or_create_master_key, SecretEncryptor};
use maestro::auth::env::first_var;
use maestro::auth::{
    AuthMethod, AuthType, CredentialCache, CredentialStore, Environment, FlowType, InitOptions,
    Provider, SystemEnv, TerminalPrompt,
};
use maestro::config::{self, Config};
use maestro::providers::{
    build_http_client, AuthRuntime, CompletionOptions, Message, ProviderRegistry,
};
use maestro::session::{ProviderStatus, SessionManager};
use maestro::ui;

/// Local user id for CLI sessions
const CLI_USER: &str = "cli";

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Multi-vendor LLM authentication and sessions")]
#[command(version)]
struct Cli {
    /// Named session to use (defaults to the configured one)
    #[arg(short, long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate with a provider
    Login {
        provider: Provider,

        /// Use the web (callback) flow instead of the device flow
        #[arg(long)]
        web: bool,

        /// Only try this authentication method
        #[arg(long, value_enum)]
        method: Option<MethodArg>,
    },

    /// Remove stored credentials for a provider
    Logout { provider: Provider },

    /// Show credential status for every provider
    Status,

    /// Manage named sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// List models available to the current credentials
    Models { provider: Provider },

    /// Send a single prompt
    Complete {
        provider: Provider,

        prompt: String,

        #[arg(short, long)]
        model: Option<String>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List saved sessions
    List {
        #[arg(long)]
        provider: Option<Provider>,
    },

    /// Copy a saved session under a new name
    Clone {
        provider: Provider,
        #[arg(long, value_enum)]
        auth_type: AuthTypeArg,
        from: String,
        to: String,
    },

    /// Delete a saved session
    Delete {
        provider: Provider,
        #[arg(long, value_enum)]
        auth_type: AuthTypeArg,
        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    ApiKey,
    Oauth,
    ServiceAccount,
}

impl From<MethodArg> for AuthMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::ApiKey => AuthMethod::ApiKey,
            MethodArg::Oauth => AuthMethod::OAuth,
            MethodArg::ServiceAccount => AuthMethod::ServiceAccount,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthTypeArg {
    ApiKey,
    Oauth,
}

impl From<AuthTypeArg> for AuthType {
    fn from(a: AuthTypeArg) -> Self {
        match a {
            AuthTypeArg::ApiKey => AuthType::ApiKey,
            AuthTypeArg::Oauth => AuthType::OAuth,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load()?;
    let session_name = cli
        .session
        .clone()
        .unwrap_or_else(|| config.default_session.clone());

    let runtime = build_runtime(&config).await?;

    match cli.command {
        Commands::Login {
            provider,
            web,
            method,
        } => {
            let manager = session_manager(&config, &runtime, &session_name);
            let mut options = InitOptions::new().with_session(&session_name);
            if web {
                options = options.with_flow(FlowType::Web);
            }
            if let Some(method) = method {
                options = options.with_method(method.into());
            }

            let session = manager.session(CLI_USER).await;
            match session.set_active_provider(provider, Some(options)).await {
                Ok(ctx) => ui::print_success(&format!(
                    "Authenticated {} ({:?}, session '{}'): {}",
                    provider,
                    ctx.method(),
                    ctx.session(),
                    ui::mask(ctx.credentials.secret())
                )),
                Err(e) => {
                    ui::print_error(&format!("Login failed [{}]: {}", e.code(), e));
                    return Err(e.into());
                }
            }
        }

        Commands::Logout { provider } => {
            let manager = session_manager(&config, &runtime, &session_name);
            manager.session(CLI_USER).await.clear_provider(provider).await?;
            ui::print_success(&format!(
                "Removed {} credentials for session '{}'",
                provider, session_name
            ));
        }

        Commands::Status => print_status(&runtime, &session_name).await?,

        Commands::Sessions { command } => run_sessions(&runtime.store, command).await?,

        Commands::Models { provider } => {
            let manager = session_manager(&config, &runtime, &session_name);
            let session = manager.session(CLI_USER).await;
            session.set_active_provider(provider, None).await?;

            for model in session.list_models().await? {
                println!("  {:<32} {}", model.id, model.display_name);
            }
        }

        Commands::Complete {
            provider,
            prompt,
            model,
            system,
            max_tokens,
        } => {
            let manager = session_manager(&config, &runtime, &session_name);
            let session = manager.session(CLI_USER).await;
            session.set_active_provider(provider, None).await?;

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let mut options = CompletionOptions {
                max_tokens,
                ..Default::default()
            };
            if let Some(model) = model {
                options = options.with_model(model);
            }

            ui::print_thinking(&format!("Asking {}", provider));
            let response = session.complete_text(&messages, &options).await?;
            println!("\n{}\n", response.content.unwrap_or_default());
            tracing::info!(
                "{} used {} tokens ({})",
                response.model,
                response.usage.total_tokens,
                response.finish_reason
            );
        }
    }

    Ok(())
}

async fn build_runtime(config: &Config) -> Result<AuthRuntime> {
    let env: Arc<dyn Environment> = Arc::new(SystemEnv);
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let master_key = load_or_create_master_key(env.as_ref(), &config.master_key_path()).await?;
    let store =
        CredentialStore::connect(&config.database_url(), SecretEncryptor::new(&master_key)?)
            .await?;

    Ok(AuthRuntime::new(
        env,
        CredentialCache::file(&config.data_dir),
        store,
        Arc::new(TerminalPrompt),
        build_http_client(config.request_timeout_secs)?,
    ))
}

fn session_manager(config: &Config, runtime: &AuthRuntime, session_name: &str) -> SessionManager {
    let registry = ProviderRegistry::from_config(config, runtime.clone());
    SessionManager::new(registry, session_name)
}

/// Offline status: environment keys, cached tokens and saved sessions
async fn print_status(runtime: &AuthRuntime, session_name: &str) -> Result<()> {
    ui::print_header(&format!("session '{}'", session_name));

    for provider in Provider::ALL {
        let env_key = first_var(runtime.env.as_ref(), env_vars(provider)).is_some();
        let cached = runtime
            .cache
            .load(provider, session_name)
            .await
            .ok()
            .flatten();
        let saved = runtime.store.list(provider).await?;

        let usable_saved = saved
            .iter()
            .filter(|s| s.name == session_name)
            .any(|s| s.expires_at.map_or(true, |t| t > chrono::Utc::now()));
        let usable_cache = cached
            .as_ref()
            .is_some_and(|t| !t.is_expired() || t.can_refresh());

        let status = if env_key || usable_saved || usable_cache {
            ProviderStatus::Authenticated
        } else {
            ProviderStatus::NeedsAuth
        };

        let mut detail = Vec::new();
        if env_key {
            detail.push("env key".to_string());
        }
        if cached.is_some() {
            detail.push("cached oauth".to_string());
        }
        for s in &saved {
            detail.push(format!("{}:{}", s.auth_type, s.name));
        }
        ui::print_provider_status(provider.as_str(), status, &detail.join(", "));
    }
    Ok(())
}

fn env_vars(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Anthropic => &["ANTHROPIC_API_KEY"],
        Provider::OpenAi => &["OPENAI_API_KEY"],
        Provider::Gemini => &[
            "GEMINI_API_KEY",
            "GOOGLE_API_KEY",
            "GOOGLE_APPLICATION_CREDENTIALS",
        ],
    }
}

async fn run_sessions(store: &CredentialStore, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::List { provider } => {
            let sessions = match provider {
                Some(p) => store.list(p).await?,
                None => store.list_all().await?,
            };
            if sessions.is_empty() {
                ui::print_warning("No saved sessions");
            }
            for s in sessions {
                let expires = s
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {:<10} {:<8} {:<20} expires {}",
                    s.provider, s.auth_type, s.name, expires
                );
            }
        }
        SessionCommands::Clone {
            provider,
            auth_type,
            from,
            to,
        } => {
            store
                .clone_session(provider, auth_type.into(), &from, &to)
                .await?;
            ui::print_success(&format!("Cloned {} session '{}' to '{}'", provider, from, to));
        }
        SessionCommands::Delete {
            provider,
            auth_type,
            name,
        } => {
            store.delete(provider, auth_type.into(), &name).await?;
            ui::print_success(&format!("Deleted {} session '{}'", provider, name));
        }
    }
    Ok(())
}
