//! Maestro - multi-vendor LLM authentication and sessions
//!
//! This library authenticates against Anthropic, OpenAI and Google Gemini
//! (API keys, OAuth device/web flows, Google service accounts), keeps the
//! resulting credentials fresh and persisted, and routes completions through
//! per-user sessions.

pub mod auth;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod ui;

pub use error::{Error, Result};
