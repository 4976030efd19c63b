//! Command-line interface definitions for News Relay.
//!
//! Polling settings and the source list live in the YAML config; the command
//! line only says where that file and the state directory are, and how to
//! reach the outside world. Secrets are read from the environment.

use clap::Parser;

/// Command-line arguments for the News Relay application.
///
/// # Examples
///
/// ```sh
/// # Poll and post to Telegram
/// TELEGRAM_TOKEN=123:abc TELEGRAM_CHAT_ID=-100123 news_relay -c sources.yaml -s ./state
///
/// # Browser sources through a local chromedriver, log instead of posting
/// news_relay -c sources.yaml --webdriver-url http://localhost:9515 --dry-run
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML config with polling settings and sources
    #[arg(short, long, default_value = "sources.yaml")]
    pub config: String,

    /// Directory holding the last announced id per source
    #[arg(short, long, env = "NEWS_RELAY_STATE_DIR", default_value = "./state")]
    pub state_dir: String,

    /// Wait for a `start` command instead of polling right away
    #[arg(long)]
    pub no_autostart: bool,

    /// WebDriver endpoint for `browser` sources (chromedriver, geckodriver, Selenium)
    #[arg(long, env = "WEBDRIVER_URL")]
    pub webdriver_url: Option<String>,

    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// Chat or channel id messages are posted to
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    /// Log messages instead of sending them
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "news_relay",
            "--config",
            "./relay.yaml",
            "--state-dir",
            "/var/lib/news_relay",
            "--no-autostart",
            "--dry-run",
        ]);

        assert_eq!(cli.config, "./relay.yaml");
        assert_eq!(cli.state_dir, "/var/lib/news_relay");
        assert!(cli.no_autostart);
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from(["news_relay", "-c", "/tmp/s.yaml", "-s", "/tmp/state"]);

        assert_eq!(cli.config, "/tmp/s.yaml");
        assert_eq!(cli.state_dir, "/tmp/state");
        assert!(!cli.no_autostart);
    }

    #[test]
    fn test_cli_webdriver_flag() {
        let cli = Cli::parse_from(["news_relay", "--webdriver-url", "http://localhost:9515"]);
        assert_eq!(cli.webdriver_url.as_deref(), Some("http://localhost:9515"));
    }
}
