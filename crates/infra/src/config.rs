use std::time::Duration;

use kindling_domain::coordinator::CoordinatorConfig;
use kindling_domain::keys::KeySpace;
use kindling_domain::priority::PriorityTable;
use kindling_domain::streaming::StreamingConfig;
use serde::Deserialize;

use crate::kv::ConnectionPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub redis_reconnect_cooldown_ms: u64,
    pub redis_max_reconnect_failures: u32,
    pub redis_circuit_open_ms: u64,
    pub redis_connect_retry_attempts: u32,
    pub redis_retry_backoff_base_ms: u64,
    pub redis_retry_backoff_max_ms: u64,
    pub redis_connect_timeout_ms: u64,
    pub redis_command_timeout_ms: u64,
    pub request_ttl_secs: u64,
    pub result_ttl_secs: u64,
    pub unwaited_status_ttl_secs: u64,
    pub max_wait_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub stream_ttl_secs: u64,
    pub stream_grace_secs: u64,
    pub stream_poll_ms: u64,
    pub stream_max_empty_polls: u32,
    pub cancellation_check_interval: u32,
    pub http_timeout_secs: u64,
    /// Comma separated paths that skip priority checks and always replace
    /// the running request.
    pub legacy_last_one_wins_paths: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("key_prefix", "kindle")?
            .set_default("redis_reconnect_cooldown_ms", 1000)?
            .set_default("redis_max_reconnect_failures", 10)?
            .set_default("redis_circuit_open_ms", 30000)?
            .set_default("redis_connect_retry_attempts", 3)?
            .set_default("redis_retry_backoff_base_ms", 100)?
            .set_default("redis_retry_backoff_max_ms", 1000)?
            .set_default("redis_connect_timeout_ms", 2000)?
            .set_default("redis_command_timeout_ms", 1000)?
            .set_default("request_ttl_secs", 130)?
            .set_default("result_ttl_secs", 10)?
            .set_default("unwaited_status_ttl_secs", 2)?
            .set_default("max_wait_secs", 125)?
            .set_default("poll_initial_ms", 500)?
            .set_default("poll_max_ms", 2000)?
            .set_default("stream_ttl_secs", 300)?
            .set_default("stream_grace_secs", 60)?
            .set_default("stream_poll_ms", 500)?
            .set_default("stream_max_empty_polls", 10)?
            .set_default("cancellation_check_interval", 5)?
            .set_default("http_timeout_secs", 150)?
            .set_default("legacy_last_one_wins_paths", "")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        let config: Self = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.max_wait_secs >= self.request_ttl_secs {
            return Err(config::ConfigError::Message(format!(
                "max_wait_secs ({}) must be below request_ttl_secs ({})",
                self.max_wait_secs, self.request_ttl_secs
            )));
        }
        if self.http_timeout_secs <= self.max_wait_secs {
            return Err(config::ConfigError::Message(format!(
                "http_timeout_secs ({}) must exceed max_wait_secs ({})",
                self.http_timeout_secs, self.max_wait_secs
            )));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            record_ttl: Duration::from_secs(self.request_ttl_secs),
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            unwaited_status_ttl: Duration::from_secs(self.unwaited_status_ttl_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
            poll_initial: Duration::from_millis(self.poll_initial_ms),
            poll_max: Duration::from_millis(self.poll_max_ms),
            ..CoordinatorConfig::default()
        }
    }

    pub fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig {
            stream_ttl: Duration::from_secs(self.stream_ttl_secs),
            ended_grace: Duration::from_secs(self.stream_grace_secs),
            poll_interval: Duration::from_millis(self.stream_poll_ms),
            max_empty_polls: self.stream_max_empty_polls,
        }
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }

    pub fn priority_table(&self) -> PriorityTable {
        let legacy = self
            .legacy_last_one_wins_paths
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        PriorityTable::default().with_legacy_last_one_wins(legacy)
    }

    pub fn redis_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            reconnect_cooldown: Duration::from_millis(self.redis_reconnect_cooldown_ms),
            max_reconnect_failures: self.redis_max_reconnect_failures.max(1),
            circuit_open: Duration::from_millis(self.redis_circuit_open_ms.max(1)),
            connect_attempts: self.redis_connect_retry_attempts.max(1),
            retry_backoff_base: Duration::from_millis(self.redis_retry_backoff_base_ms),
            retry_backoff_max: Duration::from_millis(self.redis_retry_backoff_max_ms),
            connect_timeout: Duration::from_millis(self.redis_connect_timeout_ms.max(1)),
            command_timeout: Duration::from_millis(self.redis_command_timeout_ms.max(1)),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            app_env: "test".into(),
            port: 0,
            log_level: "debug".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            key_prefix: "kindle".into(),
            redis_reconnect_cooldown_ms: 1000,
            redis_max_reconnect_failures: 10,
            redis_circuit_open_ms: 30000,
            redis_connect_retry_attempts: 3,
            redis_retry_backoff_base_ms: 100,
            redis_retry_backoff_max_ms: 1000,
            redis_connect_timeout_ms: 2000,
            redis_command_timeout_ms: 1000,
            request_ttl_secs: 130,
            result_ttl_secs: 10,
            unwaited_status_ttl_secs: 2,
            max_wait_secs: 125,
            poll_initial_ms: 500,
            poll_max_ms: 2000,
            stream_ttl_secs: 300,
            stream_grace_secs: 60,
            stream_poll_ms: 500,
            stream_max_empty_polls: 10,
            cancellation_check_interval: 5,
            http_timeout_secs: 150,
            legacy_last_one_wins_paths: " /open-random-book, ,/navigate".into(),
        }
    }

    #[test]
    fn maps_flat_settings_into_coordinator_config() {
        let config = sample().coordinator_config();
        assert_eq!(config.record_ttl, Duration::from_secs(130));
        assert_eq!(config.max_wait, Duration::from_secs(125));
        assert_eq!(config.poll_max, Duration::from_secs(2));
        assert_eq!(config.poll_factor, 1.5);
    }

    #[test]
    fn redis_policy_bounds_connects_and_commands() {
        let policy = sample().redis_policy();
        assert_eq!(policy.connect_timeout, Duration::from_secs(2));
        assert_eq!(policy.command_timeout, Duration::from_secs(1));
        assert_eq!(policy.circuit_open, Duration::from_secs(30));
    }

    #[test]
    fn parses_legacy_paths_list() {
        let table = sample().priority_table();
        assert!(table.is_legacy_last_one_wins("/open-random-book"));
        assert!(table.is_legacy_last_one_wins("/navigate"));
        assert!(!table.is_legacy_last_one_wins("/books"));
        assert_eq!(table.priority("/open-book"), 100);
    }

    #[test]
    fn rejects_wait_ceiling_above_record_ttl() {
        let mut config = sample();
        assert!(config.validate().is_ok());
        config.max_wait_secs = 140;
        assert!(config.validate().is_err());
        config.max_wait_secs = 125;
        config.http_timeout_secs = 100;
        assert!(config.validate().is_err());
    }
}
