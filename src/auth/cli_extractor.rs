//! Google OAuth client lookup from an installed Gemini CLI
//!
//! The Gemini CLI ships its OAuth client id/secret in a bundled
//! `code_assist/oauth2.js`. When no Google client is configured we locate that
//! file next to the `gemini` binary and read the pair out of it.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Error;
use crate::Result;

const OAUTH_JS_SUFFIX: &str = "code_assist/oauth2.js";
const CORE_PACKAGE: &str = "node_modules/@google/gemini-cli-core/dist/src";

/// OAuth client registration read from the CLI bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Locate an installed Gemini CLI and extract its OAuth client
pub fn extract_cli_credentials() -> Result<CliCredentials> {
    let binary = find_gemini_binary()?;
    let oauth_file = find_oauth_file(&binary)?;
    let content = std::fs::read_to_string(&oauth_file)?;
    extract_credentials_from_content(&content)
}

fn find_gemini_binary() -> Result<PathBuf> {
    if let Ok(output) = Command::new("which").arg("gemini").output() {
        if output.status.success() {
            let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
            if path.exists() {
                return Ok(path);
            }
        }
    }

    let mut candidates = vec![
        PathBuf::from("/usr/local/bin/gemini"),
        PathBuf::from("/opt/homebrew/bin/gemini"),
    ];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".npm-global/bin/gemini"));
        candidates.push(home.join("node_modules/.bin/gemini"));
    }

    candidates.into_iter().find(|p| p.exists()).ok_or_else(|| {
        Error::Config(
            "Gemini CLI not found; install with `npm install -g @google/gemini-cli` \
             or configure oauth.gemini.client_id"
                .to_string(),
        )
    })
}

/// Walk up from the resolved binary looking for the bundled `oauth2.js`
fn find_oauth_file(binary: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(binary)?;
    tracing::debug!("Resolved gemini binary: {:?}", resolved);

    for dir in resolved.ancestors().skip(1) {
        let candidates = [
            // Homebrew: Cellar/gemini-cli/<ver>/libexec/...
            dir.join("libexec/lib/node_modules/@google/gemini-cli")
                .join(CORE_PACKAGE)
                .join(OAUTH_JS_SUFFIX),
            dir.join("libexec/lib")
                .join(CORE_PACKAGE)
                .join(OAUTH_JS_SUFFIX),
            // npm global: lib/node_modules/@google/gemini-cli/...
            dir.join(CORE_PACKAGE).join(OAUTH_JS_SUFFIX),
            dir.join("dist/src").join(OAUTH_JS_SUFFIX),
        ];
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            tracing::debug!("Found oauth2.js at {:?}", found);
            return Ok(found);
        }
    }

    find_oauth_with_find(&resolved)
}

/// Last resort: `find` under the nearest install root
fn find_oauth_with_find(resolved: &Path) -> Result<PathBuf> {
    let root = resolved
        .ancestors()
        .take(10)
        .find(|d| {
            d.join("libexec").exists()
                || d.join("node_modules").exists()
                || d.to_string_lossy().contains("gemini-cli")
        })
        .unwrap_or(resolved);

    let pattern = format!("*/{OAUTH_JS_SUFFIX}");
    let output = Command::new("find")
        .arg(root)
        .args(["-path", pattern.as_str(), "-type", "f"])
        .output()?;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| PathBuf::from(l.trim()))
        .find(|p| p.exists())
        .ok_or_else(|| Error::Config(format!("No {OAUTH_JS_SUFFIX} under {root:?}")))
}

/// Pull `client_id`/`client_secret` out of the JavaScript source.
///
/// Accepts `OAUTH_CLIENT_ID = '...'`, `clientId: "..."` and quoted JSON keys.
fn extract_credentials_from_content(content: &str) -> Result<CliCredentials> {
    let id_patterns = [
        r#"["']client[_-]?id["']\s*:\s*["']([^"']+\.apps\.googleusercontent\.com)["']"#,
        r#"(?i)client[_-]?id["']?\s*[:=]\s*["']([^"']+)["']"#,
    ];
    let secret_patterns = [
        r#"["']client[_-]?secret["']\s*:\s*["']([^"']+)["']"#,
        r#"(?i)client[_-]?secret["']?\s*[:=]\s*["']([^"']+)["']"#,
    ];

    let client_id = find_match(&id_patterns, content)
        .ok_or_else(|| Error::Config("client_id not found in Gemini CLI bundle".to_string()))?;
    let client_secret = find_match(&secret_patterns, content).ok_or_else(|| {
        Error::Config("client_secret not found in Gemini CLI bundle".to_string())
    })?;

    Ok(CliCredentials {
        client_id,
        client_secret,
    })
}

fn find_match(patterns: &[&str], content: &str) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        Regex::new(pattern)
            .ok()?
            .captures(content)?
            .get(1)
            .map(|m| m.as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_json_style() {
        let content = r#"
        const config = {
            "client_id": "123456789.apps.googleusercontent.com",
            "client_secret": "GOCSPX-abcdefghijk"
        };
        "#;

        let creds = extract_credentials_from_content(content).unwrap();
        assert_eq!(creds.client_id, "123456789.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "GOCSPX-abcdefghijk");
    }

    #[test]
    fn test_extract_from_const_style() {
        let content = r#"
        const OAUTH_CLIENT_ID = '123456789.apps.googleusercontent.com';
        const OAUTH_CLIENT_SECRET = 'GOCSPX-abcdefghijk';
        "#;

        let creds = extract_credentials_from_content(content).unwrap();
        assert_eq!(creds.client_id, "123456789.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "GOCSPX-abcdefghijk");
    }

    #[test]
    fn test_extract_from_camel_case() {
        let content = r#"
        const clientId = "app-id.apps.googleusercontent.com";
        const clientSecret = "secret-value";
        "#;

        let creds = extract_credentials_from_content(content).unwrap();
        assert_eq!(creds.client_id, "app-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "secret-value");
    }

    #[test]
    fn test_missing_credentials() {
        assert!(extract_credentials_from_content("const foo = 'bar';").is_err());
    }

    #[test]
    fn test_finds_bundle_in_npm_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("lib/node_modules/@google/gemini-cli");
        let bin = pkg.join("dist/index.js");
        let oauth = pkg.join(CORE_PACKAGE).join(OAUTH_JS_SUFFIX);
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::create_dir_all(oauth.parent().unwrap()).unwrap();
        std::fs::write(&bin, "").unwrap();
        std::fs::write(&oauth, "const OAUTH_CLIENT_ID = 'x';").unwrap();

        let found = find_oauth_file(&bin).unwrap();
        assert_eq!(found, std::fs::canonicalize(oauth).unwrap());
    }
}
