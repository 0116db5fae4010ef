use config::builder::DefaultState;
use config::{Config as ConfigLoader, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{LimiterError, Result};

const ENV_PREFIX: &str = "LIMITER";
const CONFIG_FILE: &str = "limiter";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefillMode {
    /// Buckets refill only when touched by an acquire or an inspection.
    #[default]
    Lazy,
    /// A background task refills every bucket each `tick_interval_ms`.
    Ticking,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LimiterConfig {
    // Per-key defaults
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    // Aggregate ceiling across all keys
    #[serde(default)]
    pub global_limit: Option<u32>,
    #[serde(default)]
    pub global_window_ms: Option<u64>,

    // Background work
    #[serde(default)]
    pub refill_mode: RefillMode,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub idle_ttl_ms: Option<u64>,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_limit() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_reap_interval_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            global_limit: None,
            global_window_ms: None,
            refill_mode: RefillMode::Lazy,
            tick_interval_ms: default_tick_interval_ms(),
            idle_ttl_ms: None,
            reap_interval_ms: default_reap_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

impl LimiterConfig {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            ..Self::default()
        }
    }

    pub fn with_global(mut self, global_limit: u32, global_window_ms: u64) -> Self {
        self.global_limit = Some(global_limit);
        self.global_window_ms = Some(global_window_ms);
        self
    }

    pub fn with_ticking(mut self, tick_interval_ms: u64) -> Self {
        self.refill_mode = RefillMode::Ticking;
        self.tick_interval_ms = tick_interval_ms;
        self
    }

    pub fn with_idle_ttl(mut self, idle_ttl_ms: u64) -> Self {
        self.idle_ttl_ms = Some(idle_ttl_ms);
        self
    }

    /// Load from an optional `limiter.{toml,json,yaml}` file, then
    /// `LIMITER_*` environment variables (a `.env` file is honoured).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let builder = ConfigLoader::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: LimiterConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Global `(limit, window_ms)` if an aggregate ceiling is configured.
    /// A missing global window falls back to the per-key window.
    pub fn global(&self) -> Option<(u32, u64)> {
        self.global_limit
            .map(|limit| (limit, self.global_window_ms.unwrap_or(self.window_ms)))
    }

    pub fn validate(&self) -> Result<()> {
        validate_limit(self.limit, self.window_ms)?;

        if self.global_limit.is_none() && self.global_window_ms.is_some() {
            return Err(LimiterError::InvalidConfiguration(
                "global_window_ms is set but global_limit is not".into(),
            ));
        }
        if let Some((limit, window_ms)) = self.global() {
            validate_limit(limit, window_ms)?;
        }

        if self.refill_mode == RefillMode::Ticking && self.tick_interval_ms == 0 {
            return Err(LimiterError::InvalidConfiguration(
                "tick_interval_ms must be positive in ticking mode".into(),
            ));
        }
        if self.idle_ttl_ms.is_some() && self.reap_interval_ms == 0 {
            return Err(LimiterError::InvalidConfiguration(
                "reap_interval_ms must be positive when idle_ttl_ms is set".into(),
            ));
        }

        Ok(())
    }
}

/// Rejects parameters that would make a bucket suspend every caller forever.
pub fn validate_limit(limit: u32, window_ms: u64) -> Result<()> {
    if limit == 0 {
        return Err(LimiterError::InvalidConfiguration(
            "limit must be positive".into(),
        ));
    }
    if window_ms == 0 {
        return Err(LimiterError::InvalidConfiguration(
            "window must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Result<LimiterConfig> {
        LimiterConfig::from_builder(
            ConfigLoader::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LimiterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limit, 5);
        assert_eq!(config.window_ms, 1_000);
        assert_eq!(config.global(), None);
        assert_eq!(config.refill_mode, RefillMode::Lazy);
    }

    #[test]
    fn test_rejects_non_positive_values() {
        assert!(matches!(
            LimiterConfig::new(0, 1000).validate(),
            Err(LimiterError::InvalidConfiguration(_))
        ));
        assert!(LimiterConfig::new(5, 0).validate().is_err());
        assert!(LimiterConfig::new(5, 1000).with_global(0, 1000).validate().is_err());
        assert!(LimiterConfig::new(5, 1000).with_global(1, 0).validate().is_err());
        assert!(LimiterConfig::new(5, 1000).with_ticking(0).validate().is_err());
    }

    #[test]
    fn test_global_window_falls_back_to_key_window() {
        let mut config = LimiterConfig::new(5, 750);
        config.global_limit = Some(20);
        assert_eq!(config.global(), Some((20, 750)));

        config.global_limit = None;
        config.global_window_ms = Some(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = parse(
            r#"
            limit = 10
            global_limit = 100
            global_window_ms = 60000
            refill_mode = "ticking"
            tick_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.limit, 10);
        assert_eq!(config.window_ms, 1_000);
        assert_eq!(config.global(), Some((100, 60_000)));
        assert_eq!(config.refill_mode, RefillMode::Ticking);
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.idle_ttl_ms, None);
    }

    #[test]
    fn test_parse_error_surfaces_as_config_error() {
        let err = parse(r#"limit = "many""#).unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_zero_window() {
        let err = parse("window_ms = 0").unwrap_err();
        assert!(matches!(err, LimiterError::InvalidConfiguration(_)));
    }
}
