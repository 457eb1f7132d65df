use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Settings for the Anthropic Messages API client.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// `None` when no key was configured; every generation then fails with an
    /// authentication error before touching the network.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4000,
            timeout: Duration::from_secs(30),
            max_retries: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Sessions untouched for this long are dropped by the sweeper.
    pub session_idle_ttl: Duration,
    pub generation: GenerationConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source so tests do not
    /// have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = GenerationConfig::default();

        let api_key = lookup("ANTHROPIC_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let generation = GenerationConfig {
            api_key,
            base_url: lookup("ANTHROPIC_API_BASE")
                .map(|b| b.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model: lookup("ANTHROPIC_MODEL").unwrap_or(defaults.model),
            max_tokens: parse_var(&lookup, "ANTHROPIC_MAX_TOKENS")?.unwrap_or(defaults.max_tokens),
            timeout: parse_var(&lookup, "ANTHROPIC_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: parse_var(&lookup, "GENERATION_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            backoff: parse_var(&lookup, "GENERATION_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
        };

        let port = parse_var(&lookup, "PORT")?.unwrap_or(8080);
        let session_idle_ttl = parse_var(&lookup, "SESSION_IDLE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_IDLE_TTL);

        Ok(Self { port, session_idle_ttl, generation })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.generation.api_key.is_none());
        assert_eq!(config.generation.base_url, DEFAULT_API_BASE);
        assert_eq!(config.generation.model, DEFAULT_MODEL);
        assert_eq!(config.generation.max_tokens, 4000);
        assert_eq!(config.generation.timeout, Duration::from_secs(30));
        assert_eq!(config.generation.max_retries, 1);
        assert_eq!(config.session_idle_ttl, DEFAULT_SESSION_IDLE_TTL);
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = AppConfig::from_lookup(lookup_from(&[("ANTHROPIC_API_KEY", "   ")])).unwrap();
        assert!(config.generation.api_key.is_none());
    }

    #[test]
    fn overrides_are_read_and_trimmed() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ANTHROPIC_API_KEY", " sk-test \n"),
            ("ANTHROPIC_API_BASE", "http://localhost:9000/"),
            ("ANTHROPIC_TIMEOUT_SECS", "12"),
            ("GENERATION_BACKOFF_MS", "5"),
            ("PORT", "3000"),
            ("SESSION_IDLE_TTL_SECS", "90"),
        ]))
        .unwrap();
        assert_eq!(config.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.generation.base_url, "http://localhost:9000");
        assert_eq!(config.generation.timeout, Duration::from_secs(12));
        assert_eq!(config.generation.backoff, Duration::from_millis(5));
        assert_eq!(config.port, 3000);
        assert_eq!(config.session_idle_ttl, Duration::from_secs(90));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
