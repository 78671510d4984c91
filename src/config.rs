//! Configuration management for the notifier daemon

use crate::notifier::NotifierSettings;
use crate::status::Thresholds;
use crate::subject::LifecyclePolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, read from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Keys polled on every cycle
    pub watch_groups: Vec<String>,

    /// Base URL of the status endpoint; keys are appended as a path segment
    pub status_base_url: String,

    /// Channel that receives status transitions
    pub status_audience: String,

    /// Delay between cycles
    pub poll_interval: Duration,

    /// Age at which a group becomes Unhealthy
    pub soft_threshold: Duration,

    /// Age at which a group becomes Offline
    pub hard_threshold: Duration,

    /// Groups fetched per cycle; 0 means all of them
    pub fetch_budget: usize,

    /// Concurrent fetches within one cycle
    pub max_concurrent_fetches: usize,

    /// How long a subject stays active without renewal
    pub session_max_active: Duration,

    /// Warning lead time before a subject expires
    pub session_warn_before: Duration,

    /// Directory for persisted state
    pub data_dir: PathBuf,

    /// Chat gateway webhook; notifications are only logged when unset
    pub webhook_url: Option<String>,

    /// HTTP timeout for fetches and webhook posts
    pub http_timeout: Duration,

    /// Maximum retry attempts for webhook posts
    pub max_retries: u32,

    /// Retry backoff base
    pub retry_backoff_ms: u64,

    /// The game host counts itself as a player
    pub discount_host_player: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_groups: Vec::new(),
            status_base_url: "http://status.hoggitworld.com".to_string(),
            status_audience: "server-status".to_string(),
            poll_interval: Duration::from_secs(20),
            soft_threshold: Duration::from_secs(30),
            hard_threshold: Duration::from_secs(60),
            fetch_budget: 0,
            max_concurrent_fetches: 4,
            session_max_active: Duration::from_secs(30 * 60),
            session_warn_before: Duration::from_secs(5 * 60),
            data_dir: PathBuf::from("data/state_notifier"),
            webhook_url: None,
            http_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_ms: 1000,
            discount_host_player: true,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Unrecognised spellings are ignored so the default stands.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|v| parse_flag(&v))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(groups) = env::var("WATCH_GROUPS") {
            config.watch_groups = groups
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(base_url) = env::var("STATUS_BASE_URL") {
            config.status_base_url = base_url;
        }

        if let Ok(audience) = env::var("STATUS_AUDIENCE") {
            config.status_audience = audience;
        }

        if let Some(seconds) = parse_var::<u64>("POLL_INTERVAL_SECONDS") {
            config.poll_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse_var::<u64>("SOFT_THRESHOLD_SECONDS") {
            config.soft_threshold = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse_var::<u64>("HARD_THRESHOLD_SECONDS") {
            config.hard_threshold = Duration::from_secs(seconds);
        }

        if let Some(budget) = parse_var("FETCH_BUDGET") {
            config.fetch_budget = budget;
        }

        if let Some(max) = parse_var("MAX_CONCURRENT_FETCHES") {
            config.max_concurrent_fetches = max;
        }

        if let Some(seconds) = parse_var::<u64>("SESSION_MAX_ACTIVE_SECONDS") {
            config.session_max_active = Duration::from_secs(seconds);
        }

        if let Some(seconds) = parse_var::<u64>("SESSION_WARN_BEFORE_SECONDS") {
            config.session_warn_before = Duration::from_secs(seconds);
        }

        if let Ok(dir) = env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(url) = env::var("WEBHOOK_URL") {
            if !url.trim().is_empty() {
                config.webhook_url = Some(url);
            }
        }

        if let Some(seconds) = parse_var::<u64>("HTTP_TIMEOUT_SECONDS") {
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Some(retries) = parse_var("MAX_RETRIES") {
            config.max_retries = retries;
        }

        if let Some(ms) = parse_var("RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = ms;
        }

        if let Some(discount) = parse_bool("DISCOUNT_HOST_PLAYER") {
            config.discount_host_player = discount;
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than 0".to_string());
        }

        self.thresholds().validate()?;
        self.lifecycle().validate()?;

        if self.max_concurrent_fetches == 0 {
            return Err("max_concurrent_fetches must be greater than 0".to_string());
        }

        if !self.watch_groups.is_empty() && self.status_base_url.is_empty() {
            return Err("status_base_url cannot be empty when watch groups are set".to_string());
        }

        if self.status_audience.is_empty() {
            return Err("status_audience cannot be empty".to_string());
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Staleness bands for classification
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.soft_threshold, self.hard_threshold)
    }

    /// Active window and warning lead time for subjects
    pub fn lifecycle(&self) -> LifecyclePolicy {
        LifecyclePolicy::new(self.session_max_active, self.session_warn_before)
    }

    /// Build notifier settings; a zero budget means every group each tick
    pub fn notifier_settings(&self) -> NotifierSettings {
        NotifierSettings {
            thresholds: self.thresholds(),
            lifecycle: self.lifecycle(),
            fetch_budget: (self.fetch_budget > 0).then_some(self.fetch_budget),
            max_concurrent_fetches: self.max_concurrent_fetches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.notifier_settings().fetch_budget, None);
    }

    #[test]
    fn test_threshold_order_enforced() {
        let config = Config {
            soft_threshold: Duration::from_secs(100),
            hard_threshold: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warn_window_enforced() {
        let config = Config {
            session_max_active: Duration::from_secs(300),
            session_warn_before: Duration::from_secs(600),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_groups_need_base_url() {
        let config = Config {
            watch_groups: vec!["gaw".to_string()],
            status_base_url: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert_eq!(parse_flag(value), Some(true), "{value}");
        }
        for value in ["0", "False", "no", "off"] {
            assert_eq!(parse_flag(value), Some(false), "{value}");
        }
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_flag(""), None);
    }

    #[test]
    fn test_budget_maps_to_settings() {
        let config = Config {
            fetch_budget: 1,
            soft_threshold: Duration::from_secs(60),
            hard_threshold: Duration::from_secs(100),
            ..Config::default()
        };
        let settings = config.notifier_settings();
        assert_eq!(settings.fetch_budget, Some(1));
        assert_eq!(settings.thresholds.hard, Duration::from_secs(100));
        assert!(settings.validate().is_ok());
    }
}
