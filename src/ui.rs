use colored::*;

use crate::session::ProviderStatus;

const RULE_WIDTH: usize = 60;

pub fn print_header(title: &str) {
    let line = "─".repeat(RULE_WIDTH);
    println!("{}", line.black().bold());

    let name = "Maestro".yellow().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    println!("  {} {}  {}", name, version, title.cyan());

    println!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠️ ".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("  {} {}", "❌".red().bold(), msg.red());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// One row of `maestro status`
pub fn print_provider_status(provider: &str, status: ProviderStatus, detail: &str) {
    let badge = match status {
        ProviderStatus::Authenticated => status.to_string().green().bold(),
        ProviderStatus::NeedsAuth => status.to_string().yellow(),
    };
    println!("  {:<10} {:<16} {}", provider.bold(), badge, detail.black().bold());
}

/// Show the first and last few characters of a secret
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("short"), "*****");
        assert_eq!(mask("sk-ant-api03-abcdefgh"), "sk-ant…efgh");
    }
}
