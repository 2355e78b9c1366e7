//! Per-vendor OAuth client configuration

use serde::{Deserialize, Serialize};

use super::cli_extractor::extract_cli_credentials;
use super::context::Provider;
use super::env::Environment;
use crate::config::OAuthOverride;

/// OAuth endpoints and client registration for one vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    /// Out-of-band target that displays the code for the device flow
    pub device_redirect_uri: String,
    /// Callback owned by the embedding application for the web flow
    pub web_redirect_uri: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

/// Built-in registrations for the supported vendors
pub fn builtin_defaults(provider: Provider) -> OAuthConfig {
    match provider {
        Provider::Anthropic => OAuthConfig {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".into(),
            client_secret: None,
            auth_url: "https://claude.ai/oauth/authorize".into(),
            token_url: "https://console.anthropic.com/v1/oauth/token".into(),
            device_redirect_uri: "https://console.anthropic.com/oauth/code/callback".into(),
            web_redirect_uri: "http://localhost:54545/callback".into(),
            scopes: vec![
                "org:create_api_key".into(),
                "user:profile".into(),
                "user:inference".into(),
            ],
            extra_auth_params: vec![("code".into(), "true".into())],
        },
        Provider::OpenAi => OAuthConfig {
            client_id: "app_EMoamEEZ73f0CkXaXp7hrann".into(),
            client_secret: None,
            auth_url: "https://auth.openai.com/oauth/authorize".into(),
            token_url: "https://auth.openai.com/oauth/token".into(),
            device_redirect_uri: "http://localhost:1455/auth/callback".into(),
            web_redirect_uri: "http://localhost:1455/auth/callback".into(),
            scopes: vec![
                "openid".into(),
                "profile".into(),
                "email".into(),
                "offline_access".into(),
            ],
            extra_auth_params: vec![
                ("id_token_add_organizations".into(), "true".into()),
                ("codex_cli_simplified_flow".into(), "true".into()),
            ],
        },
        // Client id/secret come from config, env, or an installed Gemini CLI
        Provider::Gemini => OAuthConfig {
            client_id: String::new(),
            client_secret: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            device_redirect_uri: "https://codeassist.google.com/authcode".into(),
            web_redirect_uri: "http://localhost:8085/oauth2callback".into(),
            scopes: vec![
                "https://www.googleapis.com/auth/cloud-platform".into(),
                "https://www.googleapis.com/auth/userinfo.email".into(),
                "https://www.googleapis.com/auth/userinfo.profile".into(),
            ],
            extra_auth_params: vec![
                ("access_type".into(), "offline".into()),
                ("prompt".into(), "consent".into()),
            ],
        },
    }
}

/// Resolve the OAuth config for a provider.
///
/// Priority (later wins):
/// 1. Built-in defaults
/// 2. `oauth.<provider>` in the config file
/// 3. `MAESTRO_OAUTH_<PROVIDER>_*` environment variables
///
/// Google credentials still missing after that are extracted from an
/// installed Gemini CLI when possible.
pub fn load_oauth_config(
    provider: Provider,
    overrides: Option<&OAuthOverride>,
    env: &dyn Environment,
) -> OAuthConfig {
    let mut config = builtin_defaults(provider);

    if let Some(o) = overrides {
        apply(&mut config.client_id, o.client_id.clone());
        if o.client_secret.is_some() {
            config.client_secret = o.client_secret.clone();
        }
        apply(&mut config.auth_url, o.auth_url.clone());
        apply(&mut config.token_url, o.token_url.clone());
        apply(&mut config.device_redirect_uri, o.redirect_uri.clone());
        apply(&mut config.web_redirect_uri, o.web_redirect_uri.clone());
    }

    let prefix = format!("MAESTRO_OAUTH_{}_", provider.as_str().to_uppercase());
    apply(&mut config.client_id, env.var(&format!("{prefix}CLIENT_ID")));
    if let Some(secret) = env.var(&format!("{prefix}CLIENT_SECRET")) {
        config.client_secret = Some(secret);
    }
    apply(&mut config.auth_url, env.var(&format!("{prefix}AUTH_URL")));
    apply(&mut config.token_url, env.var(&format!("{prefix}TOKEN_URL")));
    apply(&mut config.device_redirect_uri, env.var(&format!("{prefix}REDIRECT_URI")));

    if provider == Provider::Gemini && config.client_id.is_empty() {
        match extract_cli_credentials() {
            Ok(creds) => {
                tracing::debug!("Using OAuth client from installed Gemini CLI");
                config.client_id = creds.client_id;
                config.client_secret = Some(creds.client_secret);
            }
            Err(e) => tracing::debug!("Gemini CLI credentials unavailable: {}", e),
        }
    }

    config
}

fn apply(slot: &mut String, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::env::FakeEnv;

    #[test]
    fn test_builtin_anthropic() {
        let config = builtin_defaults(Provider::Anthropic);
        assert!(config.auth_url.starts_with("https://claude.ai"));
        assert!(config.scopes.iter().any(|s| s == "user:inference"));
    }

    #[test]
    fn test_config_file_override() {
        let overrides = OAuthOverride {
            client_id: Some("custom-client".into()),
            token_url: Some("http://127.0.0.1:9/token".into()),
            ..Default::default()
        };
        let config = load_oauth_config(Provider::OpenAi, Some(&overrides), &FakeEnv::new());
        assert_eq!(config.client_id, "custom-client");
        assert_eq!(config.token_url, "http://127.0.0.1:9/token");
        assert_eq!(config.auth_url, "https://auth.openai.com/oauth/authorize");
    }

    #[test]
    fn test_env_beats_config_file() {
        let overrides = OAuthOverride {
            client_id: Some("from-file".into()),
            ..Default::default()
        };
        let env = FakeEnv::new()
            .with_var("MAESTRO_OAUTH_GEMINI_CLIENT_ID", "from-env.apps.googleusercontent.com")
            .with_var("MAESTRO_OAUTH_GEMINI_CLIENT_SECRET", "GOCSPX-env");
        let config = load_oauth_config(Provider::Gemini, Some(&overrides), &env);
        assert_eq!(config.client_id, "from-env.apps.googleusercontent.com");
        assert_eq!(config.client_secret.as_deref(), Some("GOCSPX-env"));
    }
}
