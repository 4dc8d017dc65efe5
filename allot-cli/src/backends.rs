use std::path::Path;
use std::sync::Arc;

use allot_core::infrastructure::RecordStore;
use allot_core::infrastructure_in_memory::InMemoryRecordStore;
use allot_core::{ConfigError, EngineConfig, IssuanceEngine, Ports};

/// Engine settings from an optional TOML file; defaults when absent.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

pub async fn build_engine(
    storage: &str,
    redis_url: Option<&str>,
    config: EngineConfig,
) -> Result<IssuanceEngine, String> {
    let store = open_store(storage);

    let ports = match redis_url {
        Some(url) => redis_ports(url, store).await?,
        None => {
            tracing::info!("Shared state: in-memory (counters and locks are process-local)");
            Ports {
                store,
                ..Ports::in_memory()
            }
        }
    };

    IssuanceEngine::new(ports, config).map_err(|e| e.to_string())
}

fn open_store(storage: &str) -> Arc<dyn RecordStore> {
    if storage == "memory" {
        tracing::info!("Storage backend: in-memory (records will not persist)");
        Arc::new(InMemoryRecordStore::new())
    } else if let Some(path) = storage.strip_prefix("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            tracing::info!("Storage backend: SQLite ({})", path);
            match allot_core::infrastructure_sqlite::SqliteRecordStore::open(path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::error!("Failed to open SQLite: {}. Falling back to in-memory.", e);
                    Arc::new(InMemoryRecordStore::new())
                }
            }
        }
        #[cfg(not(feature = "sqlite"))]
        {
            tracing::error!(
                "SQLite storage requested but `sqlite` feature is not enabled. \
                 Rebuild with: cargo build --features sqlite"
            );
            tracing::warn!("Falling back to in-memory storage.");
            let _ = path;
            Arc::new(InMemoryRecordStore::new())
        }
    } else {
        tracing::error!(
            "Unknown storage backend: '{}'. Use 'memory' or 'sqlite:<path>'",
            storage
        );
        tracing::warn!("Falling back to in-memory storage.");
        Arc::new(InMemoryRecordStore::new())
    }
}

#[cfg(feature = "redis")]
async fn redis_ports(url: &str, store: Arc<dyn RecordStore>) -> Result<Ports, String> {
    tracing::info!("Shared state: Redis ({})", url);
    allot_core::infrastructure_redis::ports(url, store)
        .await
        .map_err(|e| format!("failed to connect to Redis: {e}"))
}

#[cfg(not(feature = "redis"))]
async fn redis_ports(_url: &str, _store: Arc<dyn RecordStore>) -> Result<Ports, String> {
    Err("Redis requested but the `redis` feature is not enabled. \
         Rebuild with: cargo build --features redis"
        .to_string())
}
