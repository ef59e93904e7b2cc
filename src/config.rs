//! Layered runtime configuration (A3, §12).
//!
//! Load order: compiled-in defaults, then an optional TOML file, then
//! `OPERON_`-prefixed environment variables. Later sources win. Loading
//! never panics on malformed input; callers get a [`ConfigError`] and
//! decide what to do with it.

use crate::clock::DelayStrategy;
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Runtime-wide knobs, loaded in layers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_count: usize,
    pub default_delay_strategy: DelayStrategy,
    pub exclusivity_fairness: ExclusivityFairness,
    pub max_concurrent_operations: Option<usize>,
}

/// Policy for ordering operations contending on the same exclusivity
/// category. FIFO is the only implemented policy; the knob exists for
/// forward compatibility, not because alternatives exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusivityFairness {
    Fifo,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_count: num_cpus::get().max(1),
            default_delay_strategy: DelayStrategy::Immediate,
            exclusivity_fairness: ExclusivityFairness::Fifo,
            max_concurrent_operations: None,
        }
    }
}

/// The subset of [`RuntimeConfig`] that can be expressed in a TOML file or
/// environment variables (`DelayStrategy::Custom` carries a closure and
/// can't be deserialized, so the file/env layers only cover the strategies
/// that are plain data).
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    worker_count: Option<usize>,
    default_delay_strategy: Option<RawDelayStrategy>,
    exclusivity_fairness: Option<ExclusivityFairness>,
    max_concurrent_operations: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawDelayStrategy {
    Immediate,
    By { millis: u64 },
    Exponential { base_millis: u64, factor: f64 },
}

impl From<RawDelayStrategy> for DelayStrategy {
    fn from(raw: RawDelayStrategy) -> Self {
        match raw {
            RawDelayStrategy::Immediate => DelayStrategy::Immediate,
            RawDelayStrategy::By { millis } => DelayStrategy::By(Duration::from_millis(millis)),
            RawDelayStrategy::Exponential { base_millis, factor } => DelayStrategy::Exponential {
                base: Duration::from_millis(base_millis),
                factor,
            },
        }
    }
}

impl RuntimeConfig {
    /// Load defaults, then layer a TOML file at `path` (if it exists), then
    /// `OPERON_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = RuntimeConfig::default();

        if let Some(path) = path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)?;
                let raw: RawConfig = toml::from_str(&contents)?;
                config.apply_raw(raw);
            }
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_raw(&mut self, raw: RawConfig) {
        if let Some(worker_count) = raw.worker_count {
            self.worker_count = worker_count;
        }
        if let Some(strategy) = raw.default_delay_strategy {
            self.default_delay_strategy = strategy.into();
        }
        if let Some(fairness) = raw.exclusivity_fairness {
            self.exclusivity_fairness = fairness;
        }
        if raw.max_concurrent_operations.is_some() {
            self.max_concurrent_operations = raw.max_concurrent_operations;
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("OPERON_WORKER_COUNT") {
            self.worker_count = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "OPERON_WORKER_COUNT".to_string(),
                value: value.clone(),
            })?;
        }

        if let Ok(value) = std::env::var("OPERON_MAX_CONCURRENT_OPERATIONS") {
            let parsed = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "OPERON_MAX_CONCURRENT_OPERATIONS".to_string(),
                value: value.clone(),
            })?;
            self.max_concurrent_operations = Some(parsed);
        }

        if let Ok(value) = std::env::var("OPERON_EXCLUSIVITY_FAIRNESS") {
            self.exclusivity_fairness = match value.to_ascii_lowercase().as_str() {
                "fifo" => ExclusivityFairness::Fifo,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "OPERON_EXCLUSIVITY_FAIRNESS".to_string(),
                        value,
                    })
                }
            };
        }

        Ok(())
    }
}
