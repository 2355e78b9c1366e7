//! User-facing half of the OAuth device flow
//!
//! An [`AuthorizationPrompt`] shows the authorization URL and returns whatever
//! the user pastes back. The terminal implementation opens a browser and
//! reads a line; tests script the answer with [`ScriptedPrompt`].

use async_trait::async_trait;
use std::sync::Mutex;

use super::oauth::PendingAuthorization;
use crate::error::Error;
use crate::ui;
use crate::Result;

#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    /// Present `pending.url` and return the pasted code, `code#state`,
    /// query string or redirect URL
    async fn authorize(&self, pending: &PendingAuthorization) -> Result<String>;
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl AuthorizationPrompt for TerminalPrompt {
    async fn authorize(&self, pending: &PendingAuthorization) -> Result<String> {
        println!();
        ui::print_step(&format!("Sign in to {} in your browser", pending.provider));
        println!("\n  If the browser doesn't open, visit this URL:\n  {}\n", pending.url);

        if let Err(e) = open::that(&pending.url) {
            tracing::warn!("Failed to open browser: {}", e);
        }

        let input = tokio::task::spawn_blocking(|| {
            inquire::Text::new("Paste the authorization code:")
                .with_help_message("The code shown after approving access, or the full redirect URL")
                .prompt()
        })
        .await
        .map_err(|e| Error::OAuth(format!("Prompt task failed: {e}")))?
        .map_err(|e| Error::OAuth(format!("Prompt failed: {e}")))?;

        ui::print_thinking("Exchanging authorization code");
        Ok(input)
    }
}

/// Answers every prompt with a fixed code, echoing the expected state
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    code: String,
    seen: Mutex<Vec<PendingAuthorization>>,
}

impl ScriptedPrompt {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Authorizations presented so far
    pub fn seen(&self) -> Vec<PendingAuthorization> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuthorizationPrompt for ScriptedPrompt {
    async fn authorize(&self, pending: &PendingAuthorization) -> Result<String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(pending.clone());
        }
        Ok(format!("{}#{}", self.code, pending.state))
    }
}
