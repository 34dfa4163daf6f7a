use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::normalizer::{NormalizerOptions, ReactionMode};
use crate::engine::scope::ChatScope;
use crate::engine::{ChatId, EngineSettings, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub reactions: ReactionsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReactionsConfig {
    #[serde(default = "default_reaction")]
    pub reaction: String,
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
    /// Chats to react in; unset or empty means all chats
    #[serde(default)]
    pub watch_chats: Option<Vec<ChatId>>,
    #[serde(default)]
    pub mode: ReactionMode,
    #[serde(default = "default_max_range")]
    pub max_range: usize,
    #[serde(default)]
    pub broadcast_only: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    #[serde(default = "default_transient_delay_ms")]
    pub transient_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LedgerConfig {
    /// Committed entries kept in memory; unbounded when unset
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeedConfig {
    /// File or FIFO with newline-delimited JSON updates; stdin when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_status_cron")]
    pub status_cron: String,
}

fn default_reaction() -> String {
    "⭐".to_string()
}

fn default_delay_seconds() -> f64 {
    1.0
}

fn default_max_range() -> usize {
    100
}

fn default_max_transient_attempts() -> u32 {
    3
}

fn default_transient_delay_ms() -> u64 {
    2000
}

fn default_status_cron() -> String {
    "0 */15 * * * *".to_string()
}

impl Default for ReactionsConfig {
    fn default() -> Self {
        Self {
            reaction: default_reaction(),
            delay_seconds: default_delay_seconds(),
            watch_chats: None,
            mode: ReactionMode::default(),
            max_range: default_max_range(),
            broadcast_only: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_attempts: default_max_transient_attempts(),
            transient_delay_ms: default_transient_delay_ms(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            status_cron: default_status_cron(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token must not be empty");
        }
        let reactions = &self.reactions;
        if reactions.reaction.trim().is_empty() {
            anyhow::bail!("reactions.reaction must not be empty");
        }
        if !reactions.delay_seconds.is_finite() || reactions.delay_seconds < 0.0 {
            anyhow::bail!(
                "reactions.delay_seconds must be a non-negative number, got {}",
                reactions.delay_seconds
            );
        }
        if reactions.max_range == 0 {
            anyhow::bail!("reactions.max_range must be at least 1");
        }
        if self.retry.max_transient_attempts == 0 {
            anyhow::bail!("retry.max_transient_attempts must be at least 1");
        }
        if self.ledger.capacity == Some(0) {
            anyhow::bail!("ledger.capacity must be at least 1; leave it unset for no limit");
        }
        Ok(())
    }

    /// The part of the configuration the reaction engine consumes
    pub fn engine_settings(&self) -> EngineSettings {
        let reactions = &self.reactions;
        EngineSettings {
            reaction: reactions.reaction.clone(),
            min_delay: Duration::from_secs_f64(reactions.delay_seconds),
            scope: ChatScope::from_watch_list(reactions.watch_chats.as_deref()),
            normalizer: NormalizerOptions {
                mode: reactions.mode,
                max_range: reactions.max_range,
                broadcast_only: reactions.broadcast_only,
            },
            retry: RetryPolicy {
                max_transient_attempts: self.retry.max_transient_attempts,
                transient_delay: Duration::from_millis(self.retry.transient_delay_ms),
            },
            ledger_capacity: self.ledger.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[telegram]\nbot_token = \"123:abc\"\n").unwrap();
        let settings = config.engine_settings();

        assert_eq!(settings.reaction, "⭐");
        assert_eq!(settings.min_delay, Duration::from_secs(1));
        assert_eq!(settings.scope, ChatScope::All);
        assert_eq!(settings.normalizer.mode, ReactionMode::Range);
        assert_eq!(settings.normalizer.max_range, 100);
        assert_eq!(settings.retry.max_transient_attempts, 3);
        assert_eq!(settings.retry.transient_delay, Duration::from_secs(2));
        assert_eq!(settings.ledger_capacity, None);
        assert!(config.feed.path.is_none());
        assert_eq!(config.report.status_cron, "0 */15 * * * *");
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [telegram]
            bot_token = "123:abc"

            [reactions]
            reaction = "👍"
            delay_seconds = 2.5
            watch_chats = [5, 7]
            mode = "latest"
            broadcast_only = true

            [retry]
            max_transient_attempts = 5
            transient_delay_ms = 500

            [ledger]
            capacity = 10000

            [feed]
            path = "/run/autostar/updates.fifo"
            "#,
        )
        .unwrap();
        let settings = config.engine_settings();

        assert_eq!(settings.reaction, "👍");
        assert_eq!(settings.min_delay, Duration::from_millis(2500));
        assert!(settings.scope.is_in_scope(5));
        assert!(!settings.scope.is_in_scope(9));
        assert_eq!(settings.normalizer.mode, ReactionMode::Latest);
        assert!(settings.normalizer.broadcast_only);
        assert_eq!(settings.retry.max_transient_attempts, 5);
        assert_eq!(settings.ledger_capacity, Some(10000));
        assert_eq!(
            config.feed.path.as_deref(),
            Some(Path::new("/run/autostar/updates.fifo"))
        );
    }

    #[test]
    fn test_empty_watch_list_means_all_chats() {
        let config =
            Config::parse("[telegram]\nbot_token = \"t\"\n[reactions]\nwatch_chats = []\n")
                .unwrap();
        assert_eq!(config.engine_settings().scope, ChatScope::All);
    }

    #[test]
    fn test_rejects_negative_delay() {
        let err = Config::parse("[telegram]\nbot_token = \"t\"\n[reactions]\ndelay_seconds = -1.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("delay_seconds"));
    }

    #[test]
    fn test_rejects_zero_retry_bound() {
        assert!(Config::parse(
            "[telegram]\nbot_token = \"t\"\n[retry]\nmax_transient_attempts = 0\n"
        )
        .is_err());
    }

    #[test]
    fn test_rejects_zero_ledger_capacity() {
        let err = Config::parse("[telegram]\nbot_token = \"t\"\n[ledger]\ncapacity = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("ledger.capacity"));

        let config =
            Config::parse("[telegram]\nbot_token = \"t\"\n[ledger]\ncapacity = 1\n").unwrap();
        assert_eq!(config.engine_settings().ledger_capacity, Some(1));
    }

    #[test]
    fn test_missing_telegram_section_fails() {
        assert!(Config::parse("[reactions]\nreaction = \"⭐\"\n").is_err());
    }
}
