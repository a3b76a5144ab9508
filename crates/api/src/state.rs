use std::sync::Arc;

use kindling_domain::coordinator::CoordinationService;
use kindling_domain::ports::automation::EmulatorAutomation;
use kindling_domain::ports::kv::KvStore;
use kindling_infra::automation::UnattachedEmulator;
use kindling_infra::config::AppConfig;
use kindling_infra::kv::RedisKvStore;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub coordination: CoordinationService,
    pub automation: Arc<dyn EmulatorAutomation>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = RedisKvStore::new(&config.redis_url, config.redis_policy())?;
        match store.ping().await {
            Ok(()) => info!("redis reachable"),
            Err(err) => warn!(error = %err, "redis unreachable at startup; coordination disabled until it recovers"),
        }
        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(UnattachedEmulator),
        ))
    }

    pub fn with_components(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        automation: Arc<dyn EmulatorAutomation>,
    ) -> Self {
        let coordination = CoordinationService::new(
            store,
            config.priority_table(),
            config.coordinator_config(),
        )
        .with_keyspace(config.key_space())
        .with_streaming_config(config.streaming_config());
        Self {
            config,
            coordination,
            automation,
        }
    }
}
