//! Google service-account credentials
//!
//! Signs an RS256 JWT with the account's private key and trades it for a
//! scoped access token through the JWT bearer grant.

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::context::{expiry_from_now, AuthContext, Credentials, Provider};
use crate::error::Error;
use crate::providers::http;
use crate::Result;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The fields of a service-account key file we need
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    scope: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl ServiceAccountKey {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&content).map_err(|e| {
            Error::InvalidCredentialFormat(format!("service account file {path:?}: {e}"))
        })?;
        if key.key_type != "service_account" {
            return Err(Error::InvalidCredentialFormat(format!(
                "{path:?} is a '{}' credential, not a service account",
                key.key_type
            )));
        }
        Ok(key)
    }

    /// Signed assertion for the JWT bearer grant
    pub fn assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.client_email,
            sub: &self.client_email,
            aud: &self.token_uri,
            scope: CLOUD_PLATFORM_SCOPE,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| Error::InvalidCredentialFormat(format!("service account key: {e}")))?;
        encode(&header, &claims, &key)
            .map_err(|e| Error::InvalidCredentialFormat(format!("signing assertion: {e}")))
    }
}

/// Derive a Gemini [`AuthContext`] from the key file at `path`
pub async fn derive_context(http_client: &Client, path: &Path) -> Result<AuthContext> {
    let key = ServiceAccountKey::load(path).await?;
    let assertion = key.assertion()?;

    tracing::info!("Requesting service account token for {}", key.client_email);
    let response = http_client
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await?;

    if !response.status().is_success() {
        let (status, body) = http::status_and_text(response).await;
        return Err(Error::RefreshFailed { status, body });
    }
    let token: TokenResponse = http::decode_json(response).await?;

    let credentials = Credentials::ServiceAccount {
        access_token: token.access_token,
        source_path: path.to_path_buf(),
        expires_at: token.expires_in.and_then(expiry_from_now),
    };

    let mut ctx = AuthContext::new(Provider::Gemini, credentials);
    if let Some(project) = key.project_id {
        ctx = ctx.with_config("project", serde_json::Value::String(project));
    }
    Ok(ctx)
}
