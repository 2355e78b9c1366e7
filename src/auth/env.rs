//! Process environment access
//!
//! Auth-method detection only reads the environment through [`Environment`],
//! so tests can inject a [`FakeEnv`] instead of mutating process state.

use std::collections::HashMap;
use std::io::IsTerminal;

/// Read-only view of the process environment
pub trait Environment: Send + Sync {
    /// Value of an environment variable, `None` when unset or empty
    fn var(&self, key: &str) -> Option<String>;

    /// Whether stdin is attached to a terminal
    fn stdin_is_tty(&self) -> bool;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn stdin_is_tty(&self) -> bool {
        std::io::stdin().is_terminal()
    }
}

/// In-memory environment for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct FakeEnv {
    vars: HashMap<String, String>,
    tty: bool,
}

impl FakeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.tty = true;
        self.vars
            .entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());
        self
    }
}

impl Environment for FakeEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }

    fn stdin_is_tty(&self) -> bool {
        self.tty
    }
}

/// First non-empty value among `keys`
pub fn first_var(env: &dyn Environment, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env.var(k))
}

fn truthy(value: Option<String>) -> bool {
    match value {
        Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"),
        None => false,
    }
}

/// Whether an interactive OAuth flow may prompt the user.
///
/// Requires: not running under CI, no explicit `NON_INTERACTIVE` flag, a
/// usable `TERM`, and a TTY on stdin.
pub fn is_interactive(env: &dyn Environment) -> bool {
    if truthy(env.var("CI")) || truthy(env.var("NON_INTERACTIVE")) {
        return false;
    }
    match env.var("TERM") {
        Some(term) if term != "dumb" => env.stdin_is_tty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_terminal() {
        assert!(is_interactive(&FakeEnv::new().interactive()));
    }

    #[test]
    fn test_ci_is_not_interactive() {
        let env = FakeEnv::new().interactive().with_var("CI", "true");
        assert!(!is_interactive(&env));
    }

    #[test]
    fn test_ci_false_is_ignored() {
        let env = FakeEnv::new().interactive().with_var("CI", "false");
        assert!(is_interactive(&env));
    }

    #[test]
    fn test_non_interactive_flag() {
        let env = FakeEnv::new().interactive().with_var("NON_INTERACTIVE", "1");
        assert!(!is_interactive(&env));
    }

    #[test]
    fn test_dumb_terminal() {
        let env = FakeEnv::new().interactive().with_var("TERM", "dumb");
        assert!(!is_interactive(&env));
    }

    #[test]
    fn test_no_tty() {
        let env = FakeEnv::new().with_var("TERM", "xterm");
        assert!(!is_interactive(&env));
    }

    #[test]
    fn test_first_var_skips_empty() {
        let env = FakeEnv::new()
            .with_var("GEMINI_API_KEY", "  ")
            .with_var("GOOGLE_API_KEY", "AIza-test");
        assert_eq!(
            first_var(&env, &["GEMINI_API_KEY", "GOOGLE_API_KEY"]).as_deref(),
            Some("AIza-test")
        );
    }
}
