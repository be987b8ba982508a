//! Store construction from configuration, with optional startup-only
//! fallback from etcd to the embedded backend.

use super::etcd::EtcdStore;
use super::memory::MemoryStore;
use super::{Options, Result, Store, StoreError};
use log::warn;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_PREFIX: &str = "/minik8s";
pub const DEFAULT_ETCD_ENDPOINT: &str = "localhost:2379";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    #[default]
    Memory,
    Etcd,
}

impl FromStr for StoreType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StoreType::Memory),
            "etcd" => Ok(StoreType::Etcd),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown store type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub store_type: StoreType,
    pub endpoints: Vec<String>,
    pub prefix: String,
    /// Degrade to the embedded backend when the initial etcd probe fails.
    /// Startup-only: failures after construction surface to callers.
    pub enable_fallback: bool,
    pub options: Options,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            enable_fallback: true,
            options: Options::default(),
        }
    }
}

pub async fn new_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.store_type {
        StoreType::Memory => Ok(Arc::new(MemoryStore::new(config.options.clone()))),
        StoreType::Etcd => {
            let endpoints = if config.endpoints.is_empty() {
                vec![DEFAULT_ETCD_ENDPOINT.to_string()]
            } else {
                config.endpoints.clone()
            };
            let prefix = if config.prefix.is_empty() {
                DEFAULT_PREFIX
            } else {
                &config.prefix
            };

            match EtcdStore::new(&endpoints, prefix, config.options.clone()).await {
                Ok(store) => Ok(Arc::new(store)),
                Err(e) if config.enable_fallback => {
                    warn!("etcd unreachable ({e}), falling back to in-memory store");
                    Ok(Arc::new(MemoryStore::new(config.options.clone())))
                }
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_type_parses() {
        assert_eq!("memory".parse::<StoreType>().unwrap(), StoreType::Memory);
        assert_eq!("etcd".parse::<StoreType>().unwrap(), StoreType::Etcd);
        assert!("redis".parse::<StoreType>().is_err());
    }

    #[tokio::test]
    async fn memory_store_from_config() {
        let store = new_store(&StoreConfig::default()).await.unwrap();
        assert!(store
            .list(common::ResourceKind::Pod, "")
            .await
            .unwrap()
            .is_empty());
    }
}
