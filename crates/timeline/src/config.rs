use std::path::Path;
use std::time::Duration;

use relaypool::{LivenessSchedule, PoolConfig, QueueConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::distribution::DistributionConfig;
use crate::{Error, Result};

/// Knobs for the whole engine. Durations are milliseconds so the JSON form
/// stays flat:
///
/// ```json
/// { "max_concurrent_queries": 3, "query_timeout_ms": 8000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_queries: usize,
    pub min_query_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub batch_delay_ms: u64,
    pub live_buffer_cap: usize,
    pub idle_timeout_ms: u64,
    pub liveness_checks_ms: Vec<u64>,
    pub distribution: DistributionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 3,
            min_query_interval_ms: 100,
            query_timeout_ms: 8_000,
            batch_delay_ms: 50,
            live_buffer_cap: 50,
            idle_timeout_ms: 5 * 60 * 1000,
            liveness_checks_ms: vec![1_000, 3_000, 5_000],
            distribution: DistributionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!("loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_queries == 0 {
            return Err(Error::Config(
                "max_concurrent_queries must be at least 1".to_owned(),
            ));
        }
        if self.live_buffer_cap == 0 {
            return Err(Error::Config("live_buffer_cap must be at least 1".to_owned()));
        }
        if self.query_timeout_ms == 0 {
            return Err(Error::Config("query_timeout_ms must be positive".to_owned()));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent_queries: self.max_concurrent_queries,
            min_query_interval: Duration::from_millis(self.min_query_interval_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            liveness: LivenessSchedule::new(
                self.liveness_checks_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms)),
            ),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ..PoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_json(r#"{ "query_timeout_ms": 2000 }"#).unwrap();
        assert_eq!(config.query_timeout_ms, 2000);
        assert_eq!(config.max_concurrent_queries, 3);
        assert_eq!(config.queue_config().query_timeout, Duration::from_secs(2));
        assert_eq!(config.distribution, DistributionConfig::default());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EngineConfig::from_json(r#"{ "max_concurrent_queries": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "liveness_checks_ms": [500, 2000], "distribution": {{ "relay_budget": 2 }} }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.distribution.relay_budget, 2);
        assert_eq!(
            config.pool_config().liveness.give_up_after(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
