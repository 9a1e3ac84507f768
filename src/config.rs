//! Proxy configuration from environment variables.
//!
//! All options have defaults suitable for a localhost deployment in front of
//! the Anthropic API. Thresholds are fractions of the model's context window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Context window assumed for models missing from the table.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Runtime configuration, read once at startup and treated as immutable.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bind address for both listeners.
    pub host: String,
    /// Port for the intercepting proxy surface.
    pub proxy_port: u16,
    /// Port for the dashboard surface.
    pub dashboard_port: u16,
    /// Base URL of the real API.
    pub upstream_url: String,
    /// Utilization fraction at which a background checkpoint starts.
    pub checkpoint_threshold: f64,
    /// Utilization fraction at which a checkpoint becomes swap-eligible.
    pub swap_threshold: f64,
    /// When true, every request is forwarded unchanged.
    pub passthrough: bool,
    /// Idle conversations older than this are evicted.
    pub conversation_ttl: Duration,
    /// Below this estimated token count a checkpoint is refused as too small.
    pub compact_trigger_tokens: u64,
    /// SQLite snapshot file for crash survival.
    pub db_path: PathBuf,
    /// Known model families mapped to their context windows.
    pub model_context_windows: HashMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            proxy_port: 8742,
            dashboard_port: 8743,
            upstream_url: "https://api.anthropic.com".to_string(),
            checkpoint_threshold: 0.70,
            swap_threshold: 0.80,
            passthrough: false,
            conversation_ttl: Duration::from_secs(7200),
            compact_trigger_tokens: 50_000,
            db_path: PathBuf::from("data/compaction-proxy.sqlite"),
            model_context_windows: default_context_windows(),
        }
    }
}

fn default_context_windows() -> HashMap<String, u64> {
    [
        ("claude-opus-4-6", 200_000),
        ("claude-sonnet-4-6", 200_000),
        ("claude-sonnet-4-5-20250514", 200_000),
        ("claude-haiku-4-5-20251001", 200_000),
    ]
    .into_iter()
    .map(|(model, window)| (model.to_string(), window))
    .collect()
}

impl Config {
    /// Build a configuration from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("HOST", defaults.host),
            proxy_port: env_parse("PROXY_PORT", defaults.proxy_port),
            dashboard_port: env_parse("DASHBOARD_PORT", defaults.dashboard_port),
            upstream_url: env_string("UPSTREAM_URL", defaults.upstream_url),
            checkpoint_threshold: env_parse("CHECKPOINT_THRESHOLD", defaults.checkpoint_threshold),
            swap_threshold: env_parse("SWAP_THRESHOLD", defaults.swap_threshold),
            passthrough: env_bool("PASSTHROUGH", defaults.passthrough),
            conversation_ttl: Duration::from_secs(env_parse(
                "CONVERSATION_TTL_SECONDS",
                defaults.conversation_ttl.as_secs(),
            )),
            compact_trigger_tokens: env_parse(
                "COMPACT_TRIGGER_TOKENS",
                defaults.compact_trigger_tokens,
            ),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            model_context_windows: defaults.model_context_windows,
        }
    }

    /// Resolve the context window for a model identifier.
    #[must_use]
    pub fn context_window_for(&self, model: &str) -> u64 {
        self.model_context_windows
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|raw| raw == "true" || raw == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert!((config.checkpoint_threshold - 0.70).abs() < f64::EPSILON);
        assert!((config.swap_threshold - 0.80).abs() < f64::EPSILON);
        assert!(!config.passthrough);
        assert_eq!(config.conversation_ttl, Duration::from_secs(7200));
        assert_eq!(config.compact_trigger_tokens, 50_000);
    }

    #[test]
    fn unknown_model_gets_conservative_window() {
        let config = Config::default();
        assert_eq!(
            config.context_window_for("experimental-model"),
            DEFAULT_CONTEXT_WINDOW
        );
        assert_eq!(config.context_window_for("claude-opus-4-6"), 200_000);
    }
}
